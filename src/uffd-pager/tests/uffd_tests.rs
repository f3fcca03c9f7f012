// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scenarios against a real userfaultfd. Each test returns early when the host
//! does not let this process create one (no privileges, `vm.unprivileged_userfaultfd`
//! disabled, or a kernel without write-protect support).

use std::sync::Arc;

use uffd_pager::protection::PageProtectionState;
use uffd_pager::provider::FillPolicy;
use uffd_pager::{FaultEngine, PagerConfig, RegionManager, Reservation, UFFD_API, UffdChannel};

fn page_size() -> usize {
    utils::get_page_size().unwrap()
}

struct Host {
    manager: RegionManager<UffdChannel>,
    channel: Arc<UffdChannel>,
}

fn negotiate(config: &PagerConfig) -> Option<Host> {
    match UffdChannel::negotiate(UFFD_API, config.required_features()) {
        Ok((channel, caps)) => {
            let channel = Arc::new(channel);
            Some(Host {
                manager: RegionManager::new(channel.clone(), caps, page_size()),
                channel,
            })
        }
        Err(err) => {
            eprintln!("Skipping, userfaultfd unavailable: {}", err);
            None
        }
    }
}

#[test]
fn test_uffd_read_installs_page() {
    let config = PagerConfig {
        fill: FillPolicy::Alphabet,
        ..Default::default()
    };
    let Some(mut host) = negotiate(&config) else {
        return;
    };
    let reservation = Reservation::reserve(4 * page_size()).unwrap();
    let region = match host
        .manager
        .register_reservation(&reservation, config.tracking_mode())
    {
        Ok(region) => region,
        Err(err) => {
            eprintln!("Skipping, cannot register: {}", err);
            return;
        }
    };
    let handle = FaultEngine::new(host.channel.clone(), region, &config)
        .spawn()
        .unwrap();

    assert_eq!(reservation.load::<u8>(0xf).unwrap(), b'A');
    assert_eq!(reservation.load::<u8>(page_size() - 1).unwrap(), b'A');
    assert_eq!(reservation.load::<u8>(page_size()).unwrap(), b'B');

    let states = handle.page_states();
    assert_eq!(states.count(PageProtectionState::MappedProtected), 2);
    assert_eq!(states.count(PageProtectionState::Unmapped), 2);

    handle.shutdown().unwrap();
    host.manager.unregister(&region).unwrap();
}

#[test]
fn test_uffd_write_round_trips_through_protection() {
    let config = PagerConfig {
        grace_window_us: 1000,
        ..Default::default()
    };
    let Some(mut host) = negotiate(&config) else {
        return;
    };
    let reservation = Reservation::reserve(2 * page_size()).unwrap();
    let region = match host
        .manager
        .register_reservation(&reservation, config.tracking_mode())
    {
        Ok(region) => region,
        Err(err) => {
            eprintln!("Skipping, cannot register: {}", err);
            return;
        }
    };
    let handle = FaultEngine::new(host.channel.clone(), region, &config)
        .spawn()
        .unwrap();

    for round in 1..=3u32 {
        let value = reservation.load::<u32>(0).unwrap();
        reservation.store(0, value + 1).unwrap();
        assert_eq!(reservation.load::<u32>(0).unwrap(), round);
    }

    let stats = handle.stats();
    handle.shutdown().unwrap();
    let stats = stats.snapshot();
    assert_eq!(stats.installs, 1);
    assert!(stats.grants >= 1);
    host.manager.unregister(&region).unwrap();
}

#[test]
fn test_uffd_missing_only() {
    let config = PagerConfig {
        track_write_protect: false,
        fill: FillPolicy::Alphabet,
        ..Default::default()
    };
    let Some(mut host) = negotiate(&config) else {
        return;
    };
    let reservation = Reservation::reserve(page_size()).unwrap();
    let region = match host
        .manager
        .register_reservation(&reservation, config.tracking_mode())
    {
        Ok(region) => region,
        Err(err) => {
            eprintln!("Skipping, cannot register: {}", err);
            return;
        }
    };
    let handle = FaultEngine::new(host.channel.clone(), region, &config)
        .spawn()
        .unwrap();

    reservation.store(8, 0x55u8).unwrap();
    assert_eq!(reservation.load::<u8>(8).unwrap(), 0x55);
    assert_eq!(reservation.load::<u8>(0).unwrap(), b'A');

    let stats = handle.stats();
    handle.shutdown().unwrap();
    assert_eq!(stats.snapshot().faults, 1);
    host.manager.unregister(&region).unwrap();
}
