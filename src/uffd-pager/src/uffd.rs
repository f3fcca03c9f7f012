// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fault channel backed by Linux `userfaultfd`.

use std::fmt;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use log::{debug, info};
use userfaultfd::{
    Event, FaultKind, FeatureFlags, IoctlFlags, ReadWrite, RegisterMode, Uffd, UffdBuilder,
};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::syscall::SyscallReturnCode;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iowr_nr};

use crate::channel::{ChannelError, FaultChannel, RawEvent, Readiness, TrackingMode};
use crate::classifier::FaultFlags;

/// Userfaultfd API version this crate speaks.
pub const UFFD_API: u64 = 0xAA;

/// ioctl type of every userfaultfd ioctl.
const UFFDIO: u32 = 0xAA;

/// Restricts the descriptor to faults raised from user mode, which lets
/// unprivileged processes create it.
const UFFD_USER_MODE_ONLY: libc::c_int = 1;

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
struct uffdio_api {
    api: u64,
    features: u64,
    ioctls: u64,
}

// Handshake ioctl. Can only be issued once per descriptor, so feature
// discovery needs a throwaway descriptor.
ioctl_iowr_nr!(UFFDIO_API, UFFDIO, 0x3F, uffdio_api);

/// Result of the capability handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Every feature the host supports.
    pub supported: FeatureFlags,
    /// The subset enabled on the channel.
    pub enabled: FeatureFlags,
}

/// Errors associated with negotiating a userfaultfd channel.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum NegotiationError {
    /// Requested userfaultfd API {requested:#x}, only {supported:#x} is supported
    VersionMismatch { requested: u64, supported: u64 },
    /// Failed to open a userfaultfd descriptor: {0}
    Open(std::io::Error),
    /// UFFDIO_API handshake failed: {0}
    Handshake(std::io::Error),
    /// Host lacks required userfaultfd features: {0:?}
    MissingFeatures(FeatureFlags),
    /// Failed to create the fault channel: {0}
    Create(userfaultfd::Error),
    /// Failed to create the shutdown event: {0}
    ShutdownEvent(std::io::Error),
}

/// Opens a bare userfaultfd descriptor, preferring user-mode-only faults.
///
/// Returns the descriptor and whether it is user-mode only.
fn open_probe() -> Result<(File, bool), NegotiationError> {
    let base_flags = libc::O_CLOEXEC | libc::O_NONBLOCK;
    let mut last_err = None;

    for (flags, user_mode_only) in [(base_flags | UFFD_USER_MODE_ONLY, true), (base_flags, false)] {
        // SAFETY: The syscall only takes flags and returns a new descriptor or -1.
        let ret = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
        match RawFd::try_from(ret) {
            Ok(fd) if fd >= 0 => {
                // SAFETY: `fd` was just returned by the kernel and nothing else owns it.
                return Ok((unsafe { File::from_raw_fd(fd) }, user_mode_only));
            }
            _ => {
                let err = std::io::Error::last_os_error();
                // Kernels older than 5.11 reject UFFD_USER_MODE_ONLY.
                if err.raw_os_error() != Some(libc::EINVAL) {
                    return Err(NegotiationError::Open(err));
                }
                last_err = Some(err);
            }
        }
    }

    Err(NegotiationError::Open(last_err.unwrap_or_else(std::io::Error::last_os_error)))
}

/// First phase of the handshake: asks the host which features it supports.
fn probe_features(probe: &File) -> Result<FeatureFlags, NegotiationError> {
    let mut api = uffdio_api {
        api: UFFD_API,
        ..Default::default()
    };

    // SAFETY: `probe` is a valid userfaultfd descriptor and `api` is a properly
    // sized `uffdio_api` that outlives the call.
    SyscallReturnCode(unsafe { ioctl_with_mut_ref(probe, UFFDIO_API(), &mut api) })
        .into_empty_result()
        .map_err(NegotiationError::Handshake)?;

    Ok(FeatureFlags::from_bits_truncate(api.features))
}

/// A userfaultfd descriptor plus the event used to interrupt waits on it.
pub struct UffdChannel {
    uffd: Uffd,
    shutdown_evt: EventFd,
}

impl fmt::Debug for UffdChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UffdChannel")
            .field("uffd", &self.uffd.as_raw_fd())
            .field("shutdown_evt", &self.shutdown_evt.as_raw_fd())
            .finish()
    }
}

impl UffdChannel {
    /// Two-phase handshake: discovers the features the host supports, then
    /// creates the channel with only `required` enabled.
    pub fn negotiate(
        api_version: u64,
        required: FeatureFlags,
    ) -> Result<(Self, Capabilities), NegotiationError> {
        if api_version != UFFD_API {
            return Err(NegotiationError::VersionMismatch {
                requested: api_version,
                supported: UFFD_API,
            });
        }

        let (probe, user_mode_only) = open_probe()?;
        let supported = probe_features(&probe)?;
        drop(probe);

        let missing = required.difference(supported);
        if !missing.is_empty() {
            return Err(NegotiationError::MissingFeatures(missing));
        }

        let uffd = UffdBuilder::new()
            .close_on_exec(true)
            .non_blocking(true)
            .user_mode_only(user_mode_only)
            .require_features(required)
            .create()
            .map_err(NegotiationError::Create)?;
        let shutdown_evt =
            EventFd::new(libc::EFD_NONBLOCK).map_err(NegotiationError::ShutdownEvent)?;

        info!(
            "Negotiated userfaultfd API {:#x}: supported {:?}, enabled {:?}",
            api_version, supported, required
        );

        Ok((
            UffdChannel { uffd, shutdown_evt },
            Capabilities {
                supported,
                enabled: required,
            },
        ))
    }
}

fn fault_flags(kind: FaultKind, rw: ReadWrite) -> FaultFlags {
    let mut flags = match kind {
        FaultKind::Missing => FaultFlags::empty(),
        FaultKind::WriteProtected => FaultFlags::WP,
        _ => FaultFlags::MINOR,
    };
    if matches!(rw, ReadWrite::Write) {
        flags |= FaultFlags::WRITE;
    }
    flags
}

/// Registration mode for `mode` and the ioctls the range must then support.
fn register_flags(mode: TrackingMode) -> (RegisterMode, IoctlFlags) {
    let mut register_mode = RegisterMode::empty();
    let mut needed = IoctlFlags::COPY | IoctlFlags::WAKE;
    if mode.missing {
        register_mode |= RegisterMode::MISSING;
    }
    if mode.write_protect {
        register_mode |= RegisterMode::WRITE_PROTECT;
        needed |= IoctlFlags::WRITE_PROTECT;
    }
    (register_mode, needed)
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::Pagefault { .. } => "pagefault",
        Event::Fork { .. } => "fork",
        Event::Remap { .. } => "remap",
        Event::Remove { .. } => "remove",
        Event::Unmap { .. } => "unmap",
        #[allow(unreachable_patterns)]
        _ => "unknown",
    }
}

fn as_ptr(addr: usize) -> *mut libc::c_void {
    addr as *mut libc::c_void
}

impl FaultChannel for UffdChannel {
    fn register_range(
        &self,
        base: usize,
        len: usize,
        mode: TrackingMode,
    ) -> Result<(), ChannelError> {
        let (register_mode, needed) = register_flags(mode);
        let ioctls = self.uffd.register_with_mode(as_ptr(base), len, register_mode)?;
        if !ioctls.contains(needed) {
            self.uffd.unregister(as_ptr(base), len)?;
            return Err(ChannelError::MissingIoctls(ioctls));
        }
        Ok(())
    }

    fn unregister_range(&self, base: usize, len: usize) -> Result<(), ChannelError> {
        Ok(self.uffd.unregister(as_ptr(base), len)?)
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> Result<Readiness, ChannelError> {
        let mut fds = [
            libc::pollfd {
                fd: self.uffd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.shutdown_evt.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let timeout_ms = timeout.map_or(-1, |t| {
            libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX)
        });

        // SAFETY: `fds` is a valid array of two pollfd structures that outlives the call.
        let nready = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout_ms) };
        if nready < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.kind() {
                std::io::ErrorKind::Interrupted => ChannelError::Interrupted,
                _ => ChannelError::Poll(err),
            });
        }

        if fds[1].revents & libc::POLLIN != 0 {
            return Ok(Readiness::Shutdown);
        }
        if nready == 0 {
            return Ok(Readiness::TimedOut);
        }
        if fds[0].revents & libc::POLLHUP != 0 {
            return Err(ChannelError::Closed);
        }
        if fds[0].revents & libc::POLLERR != 0 {
            return Err(ChannelError::Poll(std::io::Error::other(
                "userfaultfd reported POLLERR",
            )));
        }
        Ok(Readiness::Ready)
    }

    fn read_event(&self) -> Result<Option<RawEvent>, ChannelError> {
        match self.uffd.read_event() {
            Ok(Some(Event::Pagefault { kind, rw, addr, .. })) => Ok(Some(RawEvent::Pagefault {
                address: addr as usize,
                flags: fault_flags(kind, rw),
            })),
            Ok(Some(event)) => Ok(Some(RawEvent::Unexpected(event_name(&event)))),
            Ok(None) => Ok(None),
            Err(userfaultfd::Error::ReadEof) => Err(ChannelError::Closed),
            Err(userfaultfd::Error::SystemError(errno)) if errno as i32 == libc::EINTR => {
                Err(ChannelError::Interrupted)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn install_page(&self, dst: usize, content: &[u8], wake: bool) -> Result<(), ChannelError> {
        // SAFETY: `content` is a live buffer of `content.len()` bytes. The
        // kernel checks that `dst` lies in a registered range.
        let copied = unsafe {
            self.uffd
                .copy(content.as_ptr().cast(), as_ptr(dst), content.len(), wake)
        }?;
        if copied != content.len() {
            return Err(ChannelError::ShortCopy {
                copied,
                expected: content.len(),
            });
        }
        Ok(())
    }

    fn set_write_protect(
        &self,
        addr: usize,
        len: usize,
        protect: bool,
    ) -> Result<(), ChannelError> {
        if protect {
            self.uffd.write_protect(as_ptr(addr), len)?;
        } else {
            self.uffd.remove_write_protection(as_ptr(addr), len, true)?;
        }
        Ok(())
    }

    fn wake(&self, addr: usize, len: usize) -> Result<(), ChannelError> {
        Ok(self.uffd.wake(as_ptr(addr), len)?)
    }

    fn shutdown(&self) -> Result<(), ChannelError> {
        debug!("Signalling fault channel shutdown");
        self.shutdown_evt.write(1).map_err(ChannelError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch() {
        let err = UffdChannel::negotiate(0xAB, FeatureFlags::empty()).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::VersionMismatch {
                requested: 0xAB,
                supported: UFFD_API
            }
        ));
    }

    #[test]
    fn test_fault_flags() {
        assert_eq!(
            fault_flags(FaultKind::Missing, ReadWrite::Read),
            FaultFlags::empty()
        );
        assert_eq!(
            fault_flags(FaultKind::Missing, ReadWrite::Write),
            FaultFlags::WRITE
        );
        assert_eq!(
            fault_flags(FaultKind::WriteProtected, ReadWrite::Read),
            FaultFlags::WP
        );
        assert_eq!(
            fault_flags(FaultKind::WriteProtected, ReadWrite::Write),
            FaultFlags::WP | FaultFlags::WRITE
        );
        assert_eq!(
            fault_flags(FaultKind::Minor, ReadWrite::Read),
            FaultFlags::MINOR
        );
    }

    #[test]
    fn test_register_flags() {
        let (mode, needed) = register_flags(TrackingMode::MISSING);
        assert_eq!(mode, RegisterMode::MISSING);
        assert_eq!(needed, IoctlFlags::COPY | IoctlFlags::WAKE);

        let (mode, needed) = register_flags(TrackingMode::ALL);
        assert_eq!(mode, RegisterMode::MISSING | RegisterMode::WRITE_PROTECT);
        assert!(needed.contains(IoctlFlags::WRITE_PROTECT | IoctlFlags::COPY));
    }

    #[test]
    fn test_uffdio_api_layout() {
        assert_eq!(std::mem::size_of::<uffdio_api>(), 24);
    }
}
