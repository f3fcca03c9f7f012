// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios against the in-process fault channel model.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use uffd_pager::channel::RawEvent;
use uffd_pager::classifier::FaultFlags;
use uffd_pager::engine::{EngineError, FaultStats};
use uffd_pager::monitor::MonitorError;
use uffd_pager::protection::PageProtectionState;
use uffd_pager::provider::FillPolicy;
use uffd_pager::test_utils::SimKernel;
use uffd_pager::{EngineHandle, FaultEngine, PagerConfig, Region, RegionManager, UFFD_API};
use utils::usize_to_u64;

const PAGE: usize = 0x1000;
const BASE: usize = 0x7f00_0000;
const TIMEOUT: Duration = Duration::from_secs(10);

struct Setup {
    kernel: Arc<SimKernel>,
    manager: RegionManager<SimKernel>,
    region: Region,
    handle: EngineHandle<SimKernel>,
}

fn start(pages: usize, config: PagerConfig) -> Setup {
    let _ = env_logger::builder().is_test(true).try_init();
    let (kernel, caps) =
        SimKernel::negotiate(PAGE, UFFD_API, config.required_features()).unwrap();
    let kernel = Arc::new(kernel);
    let mut manager = RegionManager::new(kernel.clone(), caps, PAGE);
    let region = manager
        .register(BASE, pages * PAGE, config.tracking_mode())
        .unwrap();
    let handle = FaultEngine::new(kernel.clone(), region, &config)
        .spawn()
        .unwrap();

    Setup {
        kernel,
        manager,
        region,
        handle,
    }
}

fn settled(kernel: &SimKernel, stats: &FaultStats) -> bool {
    kernel.pending_faults() == 0
        && stats.snapshot().faults == usize_to_u64(kernel.delivered().len())
}

#[test]
fn test_read_installs_alphabet_page() {
    let setup = start(
        4,
        PagerConfig {
            fill: FillPolicy::Alphabet,
            ..Default::default()
        },
    );

    assert_eq!(setup.kernel.load(BASE + 0xf), b'A');

    assert_eq!(
        setup.kernel.delivered(),
        vec![RawEvent::Pagefault {
            address: BASE + 0xf,
            flags: FaultFlags::empty()
        }]
    );
    assert_eq!(setup.kernel.page_bytes(BASE).unwrap(), vec![b'A'; PAGE]);
    assert_eq!(setup.kernel.is_protected(BASE), Some(true));
    for page in 1..4 {
        assert_eq!(setup.kernel.page_bytes(BASE + page * PAGE), None);
    }
    setup.handle.shutdown().unwrap();
}

#[test]
fn test_write_oscillates_between_grant_and_protect() {
    let config = PagerConfig {
        grace_window_us: 50_000,
        ..Default::default()
    };
    let setup = start(1, config);
    let stats = setup.handle.stats();
    let states = setup.handle.page_states();

    // The first write installs the page protected, then faults again on the
    // protection and is granted.
    setup.kernel.store(BASE + 4, 7);
    assert!(setup.kernel.wait_until(TIMEOUT, |k| {
        settled(k, &stats)
            && states.get(BASE) == Some(PageProtectionState::MappedProtected)
            && k.is_protected(BASE) == Some(true)
    }));
    let first = stats.snapshot();
    assert_eq!(first.installs, 1);
    assert!(first.grants >= 1);
    assert_eq!(first.faults, first.installs + first.grants);

    setup.kernel.store(BASE + 8, 9);
    assert!(setup.kernel.wait_until(TIMEOUT, |k| {
        stats.snapshot().grants > first.grants
            && settled(k, &stats)
            && k.is_protected(BASE) == Some(true)
    }));

    let delivered = setup.kernel.delivered();
    assert_eq!(
        delivered.last(),
        Some(&RawEvent::Pagefault {
            address: BASE + 8,
            flags: FaultFlags::WP | FaultFlags::WRITE
        })
    );
    // Granting a write never replaces content.
    assert_eq!(stats.snapshot().installs, 1);
    let bytes = setup.kernel.page_bytes(BASE).unwrap();
    assert_eq!((bytes[4], bytes[8]), (7, 9));
    setup.handle.shutdown().unwrap();
}

#[test]
fn test_concurrent_readers_share_one_install() {
    let setup = start(2, PagerConfig::default());
    let stats = setup.handle.stats();

    thread::scope(|s| {
        for i in 0..4 {
            let kernel = &setup.kernel;
            s.spawn(move || assert_eq!(kernel.load(BASE + PAGE + i * 64), 0));
        }
    });
    assert!(setup.kernel.wait_until(TIMEOUT, |k| settled(k, &stats)));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.installs, 1);
    assert_eq!(snapshot.faults, snapshot.installs + snapshot.duplicates);
    assert_eq!(setup.kernel.page_bytes(BASE), None);
    setup.handle.shutdown().unwrap();
}

#[test]
fn test_sequence_drives_fill_across_pages() {
    let setup = start(
        8,
        PagerConfig {
            track_write_protect: false,
            fill: FillPolicy::Alphabet,
            ..Default::default()
        },
    );

    let seen: Vec<u8> = (0..8)
        .map(|page| setup.kernel.load(BASE + page * PAGE))
        .collect();

    assert_eq!(seen, b"ABCDEFGH".to_vec());
    assert_eq!(
        setup
            .handle
            .page_states()
            .count(PageProtectionState::MappedWritable),
        8
    );
    setup.handle.shutdown().unwrap();
}

#[test]
fn test_missing_only_write_needs_one_fault() {
    let setup = start(
        1,
        PagerConfig {
            track_write_protect: false,
            ..Default::default()
        },
    );
    let stats = setup.handle.stats();

    setup.kernel.store(BASE, 0x5a);
    setup.kernel.store(BASE + 1, 0x5b);
    assert!(setup.kernel.wait_until(TIMEOUT, |k| settled(k, &stats)));

    assert_eq!(stats.snapshot().faults, 1);
    assert_eq!(setup.kernel.is_protected(BASE), Some(false));
    assert_eq!(setup.kernel.page_bytes(BASE).unwrap()[..2], [0x5a, 0x5b]);
    setup.handle.shutdown().unwrap();
}

#[test]
fn test_unregister_releases_blocked_access() {
    let Setup {
        kernel,
        mut manager,
        region,
        handle,
    } = start(1, PagerConfig::default());
    handle.shutdown().unwrap();

    let reader = {
        let kernel = kernel.clone();
        thread::spawn(move || kernel.load(BASE + 0x10))
    };
    assert!(kernel.wait_until(TIMEOUT, |k| k.pending_faults() == 1));

    manager.unregister(&region).unwrap();
    assert_eq!(reader.join().unwrap(), 0);
    assert!(manager.regions().is_empty());
    assert!(!kernel.is_registered(BASE));
}

#[test]
fn test_unexpected_event_stops_engine() {
    let setup = start(1, PagerConfig::default());
    setup.kernel.inject_event(RawEvent::Unexpected("fork"));

    assert!(matches!(
        setup.handle.join(),
        Err(EngineError::Monitor(MonitorError::UnexpectedEventKind("fork")))
    ));
}

#[test]
fn test_interrupted_reads_are_retried() {
    let setup = start(2, PagerConfig::default());
    setup.kernel.inject_interrupts(3);

    assert_eq!(setup.kernel.load(BASE + PAGE), 0);
    assert!(!setup.handle.is_finished());
    setup.handle.shutdown().unwrap();
}
