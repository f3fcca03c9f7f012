// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The fault channel: the kernel facility that delivers fault records and
//! accepts resolutions.
//!
//! [`FaultChannel`] is the only seam between the engine and the kernel. The
//! production implementation is [`crate::uffd::UffdChannel`]; tests use
//! `SimKernel` from the `test_utils` module.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::FaultFlags;

/// Tracking modes requested when registering a range with the channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingMode {
    /// Report accesses to pages that have no content yet.
    pub missing: bool,
    /// Report writes to pages that are marked write protected.
    pub write_protect: bool,
}

impl TrackingMode {
    /// Tracks both missing pages and write-protect faults.
    pub const ALL: TrackingMode = TrackingMode {
        missing: true,
        write_protect: true,
    };

    /// Tracks missing pages only.
    pub const MISSING: TrackingMode = TrackingMode {
        missing: true,
        write_protect: false,
    };

    /// Whether no tracking mode is selected.
    pub fn is_empty(&self) -> bool {
        !self.missing && !self.write_protect
    }
}

/// One record read off the fault channel, before it is sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    /// A suspended access at a byte-exact `address`.
    Pagefault {
        /// Faulting address, not rounded to the page boundary.
        address: usize,
        /// Kernel fault flags.
        flags: FaultFlags,
    },
    /// Any non-pagefault event (fork, remap, remove, unmap).
    Unexpected(&'static str),
}

/// Outcome of waiting on the fault channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one record can be read.
    Ready,
    /// The requested timeout elapsed with nothing to read.
    TimedOut,
    /// [`FaultChannel::shutdown`] was called.
    Shutdown,
}

/// Errors reported by a fault channel.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ChannelError {
    /// Fault channel reached end of file
    Closed,
    /// Fault channel operation was interrupted by a signal
    Interrupted,
    /// Failed to poll the fault channel: {0}
    Poll(std::io::Error),
    /// Failed to signal fault channel shutdown: {0}
    Shutdown(std::io::Error),
    /// Registered range does not support the ioctls needed to resolve faults: {0:?}
    MissingIoctls(userfaultfd::IoctlFlags),
    /// Copied {copied} bytes into the faulting page instead of {expected}
    ShortCopy { copied: usize, expected: usize },
    /// Userfaultfd operation failed: {0}
    Uffd(#[from] userfaultfd::Error),
    /// Fault channel rejected the request: {0}
    Os(std::io::Error),
}

impl ChannelError {
    /// The OS error number behind this error, if there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ChannelError::Poll(err) | ChannelError::Shutdown(err) | ChannelError::Os(err) => {
                err.raw_os_error()
            }
            ChannelError::Interrupted => Some(libc::EINTR),
            ChannelError::Uffd(userfaultfd::Error::CopyFailed(errno))
            | ChannelError::Uffd(userfaultfd::Error::SystemError(errno)) => Some(*errno as i32),
            _ => None,
        }
    }

    /// Builds a [`ChannelError::Os`] from a raw error number.
    pub fn from_errno(errno: i32) -> Self {
        ChannelError::Os(std::io::Error::from_raw_os_error(errno))
    }
}

/// The kernel fault reporting and resolution contract.
///
/// Implementations must deliver each fault record to exactly one reader, keep
/// the faulting access suspended until a resolution for its page is
/// submitted, and wake every waiter on a page when that resolution completes.
pub trait FaultChannel: Send + Sync {
    /// Registers `[base, base + len)` for fault reporting.
    fn register_range(&self, base: usize, len: usize, mode: TrackingMode)
    -> Result<(), ChannelError>;

    /// Removes a registration and wakes every access still blocked in it.
    fn unregister_range(&self, base: usize, len: usize) -> Result<(), ChannelError>;

    /// Blocks until a record is readable, the timeout elapses or the channel is
    /// shut down. `None` waits indefinitely.
    fn wait_ready(&self, timeout: Option<Duration>) -> Result<Readiness, ChannelError>;

    /// Reads exactly one record. `Ok(None)` means nothing was pending.
    fn read_event(&self) -> Result<Option<RawEvent>, ChannelError>;

    /// Copies `content` into the page at `dst`. When `wake` is set, every access
    /// blocked on that page is released.
    fn install_page(&self, dst: usize, content: &[u8], wake: bool) -> Result<(), ChannelError>;

    /// Sets or clears write protection on `[addr, addr + len)`. Clearing
    /// protection releases writers blocked on the range.
    fn set_write_protect(&self, addr: usize, len: usize, protect: bool)
    -> Result<(), ChannelError>;

    /// Releases every access blocked on `[addr, addr + len)`.
    fn wake(&self, addr: usize, len: usize) -> Result<(), ChannelError>;

    /// Makes current and future [`FaultChannel::wait_ready`] calls return
    /// [`Readiness::Shutdown`].
    fn shutdown(&self) -> Result<(), ChannelError>;
}
