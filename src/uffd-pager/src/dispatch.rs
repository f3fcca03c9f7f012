// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Submits resolutions back to the fault channel.
//!
//! Every failure here is fatal for the engine: an access blocked on a page has
//! no way to resume other than a successful resolution.

use std::sync::Arc;

use log::trace;
use utils::is_aligned;

use crate::channel::{ChannelError, FaultChannel};
use crate::protection::{PageProtectionState, PageStates, ProtectionController, ProtectionError};
use crate::provider::PageFrame;
use crate::region::Region;

/// Errors associated with submitting a resolution.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ResolutionError {
    /// Destination {0:#x} is not page aligned
    Unaligned(usize),
    /// Destination {0:#x} is outside the registered region
    OutOfRegion(usize),
    /// Page {0:#x} is already installed
    AlreadyInstalled(usize),
    /// Page content is {got} bytes instead of {expected}
    FrameSize { got: usize, expected: usize },
    /// Failed to install page {addr:#x}: {source}
    Install { addr: usize, source: ChannelError },
    /// Failed to wake accesses blocked on page {addr:#x}: {source}
    Wake { addr: usize, source: ChannelError },
    /// {0}
    Protection(#[from] ProtectionError),
}

/// Resolves faults of one region.
#[derive(Debug)]
pub struct Dispatcher<C> {
    channel: Arc<C>,
    region: Region,
    states: Arc<PageStates>,
    protection: ProtectionController<C>,
}

impl<C: FaultChannel> Dispatcher<C> {
    /// Creates a dispatcher for `region`.
    pub fn new(
        channel: Arc<C>,
        region: Region,
        states: Arc<PageStates>,
        protection: ProtectionController<C>,
    ) -> Self {
        Dispatcher {
            channel,
            region,
            states,
            protection,
        }
    }

    /// The region this dispatcher resolves faults for.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Protection state of the page at `page`.
    pub fn state(&self, page: usize) -> Option<PageProtectionState> {
        self.states.get(page)
    }

    /// Whether the page at `page` already holds content.
    pub fn is_installed(&self, page: usize) -> bool {
        matches!(
            self.states.get(page),
            Some(PageProtectionState::MappedWritable | PageProtectionState::MappedProtected)
        )
    }

    fn check_destination(&self, dst: usize, frame: &PageFrame<'_>) -> Result<(), ResolutionError> {
        if !is_aligned(dst, self.region.page_size()) {
            return Err(ResolutionError::Unaligned(dst));
        }
        if !self.region.contains(dst) {
            return Err(ResolutionError::OutOfRegion(dst));
        }
        if frame.len() != self.region.page_size() {
            return Err(ResolutionError::FrameSize {
                got: frame.len(),
                expected: self.region.page_size(),
            });
        }
        if self.is_installed(dst) {
            return Err(ResolutionError::AlreadyInstalled(dst));
        }
        Ok(())
    }

    fn copy(&self, dst: usize, frame: PageFrame<'_>, wake: bool) -> Result<(), ResolutionError> {
        self.check_destination(dst, &frame)?;
        self.channel
            .install_page(dst, frame.as_slice(), wake)
            .map_err(|source| match source.errno() {
                Some(libc::EEXIST) => ResolutionError::AlreadyInstalled(dst),
                _ => ResolutionError::Install { addr: dst, source },
            })?;
        self.states.set(dst, PageProtectionState::MappedWritable);
        trace!("Installed page {:#x} (wake: {})", dst, wake);
        Ok(())
    }

    /// Copies `frame` into the page at `dst` and releases every access blocked
    /// on it. Fails if the page already holds content.
    pub fn install(&self, dst: usize, frame: PageFrame<'_>) -> Result<(), ResolutionError> {
        self.copy(dst, frame, true)
    }

    /// Installs `frame` at `dst` and write protects it before any blocked
    /// access is released, so the page is never observed writable.
    ///
    /// Regions without write-protect tracking get a plain [`Dispatcher::install`].
    pub fn install_then_protect(
        &self,
        dst: usize,
        frame: PageFrame<'_>,
    ) -> Result<(), ResolutionError> {
        if !self.region.mode().write_protect {
            return self.install(dst, frame);
        }

        let page_size = self.region.page_size();
        self.copy(dst, frame, false)?;
        self.protection.set_protected(dst, page_size, true)?;
        self.release(dst)
    }

    /// Re-arms protection on `page` without changing its content.
    pub fn reapply_protection(&self, page: usize) -> Result<(), ResolutionError> {
        Ok(self.protection.reapply(page)?)
    }

    /// Lets the pending write on `page` complete and re-arms protection after
    /// the grace window.
    pub fn grant_then_reapply(&self, page: usize) -> Result<(), ResolutionError> {
        Ok(self.protection.grant_then_reapply(page)?)
    }

    /// Releases accesses blocked on `page` without changing it.
    pub fn release(&self, page: usize) -> Result<(), ResolutionError> {
        self.channel
            .wake(page, self.region.page_size())
            .map_err(|source| ResolutionError::Wake { addr: page, source })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use userfaultfd::FeatureFlags;

    use super::*;
    use crate::channel::TrackingMode;
    use crate::region::RegionManager;
    use crate::test_utils::{SimKernel, SimOp};
    use crate::uffd::Capabilities;

    const PAGE: usize = 0x1000;
    const BASE: usize = 0x40_0000;

    fn setup(mode: TrackingMode) -> (Arc<SimKernel>, Dispatcher<SimKernel>) {
        let kernel = Arc::new(SimKernel::new(PAGE));
        let caps = Capabilities {
            supported: FeatureFlags::PAGEFAULT_FLAG_WP,
            enabled: FeatureFlags::PAGEFAULT_FLAG_WP,
        };
        let region = RegionManager::new(kernel.clone(), caps, PAGE)
            .register(BASE, 4 * PAGE, mode)
            .unwrap();
        let states = Arc::new(PageStates::new(&region));
        let protection =
            ProtectionController::new(kernel.clone(), region, states.clone(), Duration::ZERO);
        (
            kernel.clone(),
            Dispatcher::new(kernel, region, states, protection),
        )
    }

    #[test]
    fn test_install() {
        let (kernel, dispatcher) = setup(TrackingMode::MISSING);
        let content = vec![b'A'; PAGE];

        dispatcher.install(BASE, PageFrame::new(&content)).unwrap();

        assert_eq!(kernel.page_bytes(BASE).unwrap(), content);
        assert_eq!(
            dispatcher.state(BASE),
            Some(PageProtectionState::MappedWritable)
        );
        assert!(dispatcher.is_installed(BASE));
        assert!(!dispatcher.is_installed(BASE + PAGE));
    }

    #[test]
    fn test_second_install_fails() {
        let (kernel, dispatcher) = setup(TrackingMode::MISSING);
        let content = vec![b'A'; PAGE];
        dispatcher.install(BASE, PageFrame::new(&content)).unwrap();

        let other = vec![b'B'; PAGE];
        assert!(matches!(
            dispatcher.install(BASE, PageFrame::new(&other)),
            Err(ResolutionError::AlreadyInstalled(BASE))
        ));
        assert_eq!(kernel.page_bytes(BASE).unwrap(), content);
    }

    #[test]
    fn test_kernel_eexist_is_already_installed() {
        let (kernel, dispatcher) = setup(TrackingMode::MISSING);
        // Populated behind the dispatcher's back.
        kernel.install_page(BASE, &[0; PAGE], true).unwrap();
        let content = vec![1; PAGE];
        assert!(matches!(
            dispatcher.install(BASE, PageFrame::new(&content)),
            Err(ResolutionError::AlreadyInstalled(BASE))
        ));
    }

    #[test]
    fn test_install_rejects_bad_destination() {
        let (_, dispatcher) = setup(TrackingMode::MISSING);
        let content = vec![0; PAGE];
        assert!(matches!(
            dispatcher.install(BASE + 0xf, PageFrame::new(&content)),
            Err(ResolutionError::Unaligned(_))
        ));
        assert!(matches!(
            dispatcher.install(BASE + 4 * PAGE, PageFrame::new(&content)),
            Err(ResolutionError::OutOfRegion(_))
        ));
        assert!(matches!(
            dispatcher.install(BASE, PageFrame::new(&content[..16])),
            Err(ResolutionError::FrameSize { got: 16, .. })
        ));
    }

    #[test]
    fn test_install_then_protect() {
        let (kernel, dispatcher) = setup(TrackingMode::ALL);
        let content = vec![0; PAGE];

        dispatcher
            .install_then_protect(BASE + PAGE, PageFrame::new(&content))
            .unwrap();

        assert_eq!(
            dispatcher.state(BASE + PAGE),
            Some(PageProtectionState::MappedProtected)
        );
        assert_eq!(
            kernel.ops()[1..],
            [
                SimOp::Install {
                    dst: BASE + PAGE,
                    wake: false
                },
                SimOp::Protect {
                    addr: BASE + PAGE,
                    len: PAGE
                },
                SimOp::Wake {
                    addr: BASE + PAGE,
                    len: PAGE
                },
            ]
        );
    }

    #[test]
    fn test_install_then_protect_without_wp_tracking() {
        let (kernel, dispatcher) = setup(TrackingMode::MISSING);
        let content = vec![0; PAGE];
        dispatcher
            .install_then_protect(BASE, PageFrame::new(&content))
            .unwrap();

        assert_eq!(
            dispatcher.state(BASE),
            Some(PageProtectionState::MappedWritable)
        );
        assert_eq!(kernel.is_protected(BASE), Some(false));
    }

    #[test]
    fn test_reapply_keeps_content() {
        let (kernel, dispatcher) = setup(TrackingMode::ALL);
        let content = vec![b'Q'; PAGE];
        dispatcher
            .install_then_protect(BASE, PageFrame::new(&content))
            .unwrap();

        dispatcher.reapply_protection(BASE).unwrap();
        dispatcher.grant_then_reapply(BASE).unwrap();

        assert_eq!(kernel.page_bytes(BASE).unwrap(), content);
        assert_eq!(
            dispatcher.state(BASE),
            Some(PageProtectionState::MappedProtected)
        );
    }

    #[test]
    fn test_protection_error_is_resolution_error() {
        let (_, dispatcher) = setup(TrackingMode::ALL);
        assert!(matches!(
            dispatcher.reapply_protection(BASE + 1),
            Err(ResolutionError::Protection(ProtectionError::Unaligned { .. }))
        ));
    }
}
