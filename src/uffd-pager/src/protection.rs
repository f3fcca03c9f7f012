// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Write-protect control and per-page protection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use log::trace;
use serde::Serialize;
use utils::is_aligned;

use crate::channel::{ChannelError, FaultChannel};
use crate::region::Region;

/// Protection state of one page of the monitored region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum PageProtectionState {
    /// No content installed yet.
    Unmapped = 0,
    /// Installed and writable.
    MappedWritable = 1,
    /// Installed and write protected.
    MappedProtected = 2,
}

impl PageProtectionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => PageProtectionState::MappedWritable,
            2 => PageProtectionState::MappedProtected,
            _ => PageProtectionState::Unmapped,
        }
    }
}

/// Lock-free table of [`PageProtectionState`], one slot per page.
///
/// Only the protection controller and the dispatcher write to it. Any thread
/// may read it.
#[derive(Debug)]
pub struct PageStates {
    base: usize,
    page_size: usize,
    states: Vec<AtomicU8>,
}

impl PageStates {
    /// Creates a table for `region` with every page unmapped.
    pub fn new(region: &Region) -> Self {
        PageStates {
            base: region.base(),
            page_size: region.page_size(),
            states: (0..region.page_count())
                .map(|_| AtomicU8::new(PageProtectionState::Unmapped as u8))
                .collect(),
        }
    }

    fn slot(&self, addr: usize) -> Option<&AtomicU8> {
        let offset = addr.checked_sub(self.base)?;
        self.states.get(offset / self.page_size)
    }

    /// State of the page holding `addr`, or `None` outside the region.
    pub fn get(&self, addr: usize) -> Option<PageProtectionState> {
        self.slot(addr)
            .map(|slot| PageProtectionState::from_raw(slot.load(Ordering::Acquire)))
    }

    pub(crate) fn set(&self, addr: usize, state: PageProtectionState) {
        if let Some(slot) = self.slot(addr) {
            slot.store(state as u8, Ordering::Release);
        }
    }

    /// Number of pages currently in `state`.
    pub fn count(&self, state: PageProtectionState) -> usize {
        self.states
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) == state as u8)
            .count()
    }

    /// Number of pages tracked.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the table tracks no page.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Errors associated with toggling write protection.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ProtectionError {
    /// Range {addr:#x}+{len:#x} is not aligned to the {page_size:#x} byte page size
    Unaligned { addr: usize, len: usize, page_size: usize },
    /// Range {addr:#x}+{len:#x} is outside the monitored region
    OutOfRegion { addr: usize, len: usize },
    /// Region at {0:#x} is not registered for write-protect tracking
    NotTracked(usize),
    /// Failed to clear write protection at {addr:#x}: {source}
    Clear { addr: usize, source: ChannelError },
    /// Failed to set write protection at {addr:#x}: {source}
    Set { addr: usize, source: ChannelError },
}

/// Toggles the write-protect bit of pages in one region.
///
/// Setting protection on an already protected page is a no-op for the kernel,
/// so re-arming is always an explicit clear followed by a set.
#[derive(Debug)]
pub struct ProtectionController<C> {
    channel: Arc<C>,
    region: Region,
    states: Arc<PageStates>,
    grace_window: Duration,
}

impl<C: FaultChannel> ProtectionController<C> {
    /// Creates a controller for `region`.
    pub fn new(
        channel: Arc<C>,
        region: Region,
        states: Arc<PageStates>,
        grace_window: Duration,
    ) -> Self {
        ProtectionController {
            channel,
            region,
            states,
            grace_window,
        }
    }

    /// How long a granted page stays writable before protection is re-applied.
    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// Sets or clears protection on `[addr, addr + len)`. Clearing releases
    /// blocked writers.
    pub fn set_protected(
        &self,
        addr: usize,
        len: usize,
        protect: bool,
    ) -> Result<(), ProtectionError> {
        let page_size = self.region.page_size();
        if len == 0 || !is_aligned(addr, page_size) || !is_aligned(len, page_size) {
            return Err(ProtectionError::Unaligned {
                addr,
                len,
                page_size,
            });
        }
        if !self.region.contains_range(addr, len) {
            return Err(ProtectionError::OutOfRegion { addr, len });
        }
        if !self.region.mode().write_protect {
            return Err(ProtectionError::NotTracked(self.region.base()));
        }

        self.channel
            .set_write_protect(addr, len, protect)
            .map_err(|source| {
                if protect {
                    ProtectionError::Set { addr, source }
                } else {
                    ProtectionError::Clear { addr, source }
                }
            })?;

        let new_state = if protect {
            PageProtectionState::MappedProtected
        } else {
            PageProtectionState::MappedWritable
        };
        for page in (addr..addr + len).step_by(page_size) {
            // Protection bits only exist on installed pages.
            if self.states.get(page) != Some(PageProtectionState::Unmapped) {
                self.states.set(page, new_state);
            }
        }
        trace!("Write protection {} at {:#x}+{:#x}", protect, addr, len);

        Ok(())
    }

    /// Re-arms protection on `page` without touching its content.
    pub fn reapply(&self, page: usize) -> Result<(), ProtectionError> {
        let page_size = self.region.page_size();
        self.set_protected(page, page_size, false)?;
        self.set_protected(page, page_size, true)
    }

    /// Lets the pending write on `page` through, then re-arms protection once
    /// the grace window has elapsed.
    pub fn grant_then_reapply(&self, page: usize) -> Result<(), ProtectionError> {
        let page_size = self.region.page_size();
        self.set_protected(page, page_size, false)?;
        if !self.grace_window.is_zero() {
            thread::sleep(self.grace_window);
        }
        self.set_protected(page, page_size, true)
    }
}

#[cfg(test)]
mod tests {
    use userfaultfd::FeatureFlags;

    use super::*;
    use crate::channel::TrackingMode;
    use crate::region::RegionManager;
    use crate::test_utils::{SimKernel, SimOp};
    use crate::uffd::Capabilities;

    const PAGE: usize = 0x1000;
    const BASE: usize = 0x20_0000;

    fn setup(mode: TrackingMode) -> (Arc<SimKernel>, ProtectionController<SimKernel>) {
        let kernel = Arc::new(SimKernel::new(PAGE));
        let caps = Capabilities {
            supported: FeatureFlags::PAGEFAULT_FLAG_WP,
            enabled: FeatureFlags::PAGEFAULT_FLAG_WP,
        };
        let region = RegionManager::new(kernel.clone(), caps, PAGE)
            .register(BASE, 2 * PAGE, mode)
            .unwrap();
        let states = Arc::new(PageStates::new(&region));
        let controller =
            ProtectionController::new(kernel.clone(), region, states, Duration::ZERO);
        (kernel, controller)
    }

    #[test]
    fn test_page_states() {
        let (kernel, controller) = setup(TrackingMode::ALL);
        let states = controller.states.clone();
        assert_eq!(states.len(), 2);
        assert_eq!(states.count(PageProtectionState::Unmapped), 2);
        assert_eq!(states.get(BASE + 0x10), Some(PageProtectionState::Unmapped));
        assert_eq!(states.get(BASE - 1), None);
        assert_eq!(states.get(BASE + 2 * PAGE), None);

        kernel.install_page(BASE, &[1; PAGE], true).unwrap();
        states.set(BASE, PageProtectionState::MappedWritable);
        controller.set_protected(BASE, 2 * PAGE, true).unwrap();
        assert_eq!(
            states.get(BASE),
            Some(PageProtectionState::MappedProtected)
        );
        // Protecting a page without content leaves it unmapped.
        assert_eq!(
            states.get(BASE + PAGE),
            Some(PageProtectionState::Unmapped)
        );
        // Protecting twice is not an error.
        controller.set_protected(BASE, PAGE, true).unwrap();
    }

    #[test]
    fn test_rejects_unaligned() {
        let (_, controller) = setup(TrackingMode::ALL);
        assert!(matches!(
            controller.set_protected(BASE + 0xf, PAGE, true),
            Err(ProtectionError::Unaligned { .. })
        ));
        assert!(matches!(
            controller.set_protected(BASE, PAGE + 1, true),
            Err(ProtectionError::Unaligned { .. })
        ));
        assert!(matches!(
            controller.set_protected(BASE + PAGE, 2 * PAGE, true),
            Err(ProtectionError::OutOfRegion { .. })
        ));
    }

    #[test]
    fn test_requires_wp_tracking() {
        let (_, controller) = setup(TrackingMode::MISSING);
        assert!(matches!(
            controller.set_protected(BASE, PAGE, true),
            Err(ProtectionError::NotTracked(BASE))
        ));
    }

    #[test]
    fn test_reapply_clears_then_sets() {
        let (kernel, controller) = setup(TrackingMode::ALL);
        kernel.install_page(BASE, &[7; PAGE], true).unwrap();
        controller.states.set(BASE, PageProtectionState::MappedWritable);
        controller.set_protected(BASE, PAGE, true).unwrap();

        controller.reapply(BASE).unwrap();

        let ops = kernel.ops();
        assert_eq!(
            &ops[ops.len() - 2..],
            &[
                SimOp::Unprotect { addr: BASE, len: PAGE },
                SimOp::Protect { addr: BASE, len: PAGE },
            ]
        );
        assert_eq!(kernel.is_protected(BASE), Some(true));
        assert_eq!(kernel.page_bytes(BASE).unwrap(), vec![7; PAGE]);
    }

    #[test]
    fn test_grant_waits_for_grace_window() {
        let (kernel, mut controller) = setup(TrackingMode::ALL);
        controller.grace_window = Duration::from_millis(20);
        kernel.install_page(BASE, &[0; PAGE], true).unwrap();
        controller.states.set(BASE, PageProtectionState::MappedWritable);

        let start = std::time::Instant::now();
        controller.grant_then_reapply(BASE).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(
            controller.states.get(BASE),
            Some(PageProtectionState::MappedProtected)
        );
        assert_eq!(controller.grace_window(), Duration::from_millis(20));
    }
}
