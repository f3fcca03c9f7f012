// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process model of the fault channel contract.
//!
//! [`SimKernel`] stands in for the kernel in tests: accesses made through
//! [`SimKernel::load`] and [`SimKernel::store`] fault like real ones, emit
//! exactly one record per faulting access, and stay suspended until the page
//! is woken. Resolutions follow the kernel's rules (`EEXIST` on a second
//! install, writers released when protection is cleared).

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use userfaultfd::FeatureFlags;
use utils::{align_down, is_aligned};

use crate::channel::{ChannelError, FaultChannel, RawEvent, Readiness, TrackingMode};
use crate::classifier::FaultFlags;
use crate::uffd::{Capabilities, NegotiationError, UFFD_API};

/// Resolution requests observed by a [`SimKernel`], in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    /// A range was registered.
    Register { base: usize, len: usize },
    /// A range was unregistered.
    Unregister { base: usize, len: usize },
    /// A page was copied in at `dst`, waking its waiters when `wake` is set.
    Install { dst: usize, wake: bool },
    /// Write protection was set on a range.
    Protect { addr: usize, len: usize },
    /// Write protection was cleared on a range.
    Unprotect { addr: usize, len: usize },
    /// Waiters on a range were released.
    Wake { addr: usize, len: usize },
}

#[derive(Debug)]
struct SimPage {
    bytes: Vec<u8>,
    protected: bool,
}

#[derive(Debug, Default)]
struct SimState {
    ranges: Vec<(usize, usize, TrackingMode)>,
    pages: HashMap<usize, SimPage>,
    queue: VecDeque<RawEvent>,
    delivered: Vec<RawEvent>,
    // Bumped every time waiters on a page are released.
    epochs: HashMap<usize, u64>,
    ops: Vec<SimOp>,
    pending_interrupts: usize,
    shutdown: bool,
    closed: bool,
}

impl SimState {
    fn mode_of(&self, addr: usize) -> Option<TrackingMode> {
        self.ranges
            .iter()
            .find(|(base, len, _)| addr >= *base && addr - base < *len)
            .map(|(_, _, mode)| *mode)
    }

    fn epoch(&self, page: usize) -> u64 {
        self.epochs.get(&page).copied().unwrap_or(0)
    }

    fn release(&mut self, addr: usize, len: usize, page_size: usize) {
        for page in (addr..addr + len).step_by(page_size) {
            *self.epochs.entry(page).or_insert(0) += 1;
        }
    }
}

/// Simulated fault channel with accessor entry points.
#[derive(Debug)]
pub struct SimKernel {
    page_size: usize,
    state: Mutex<SimState>,
    // Signalled when a record is queued or the channel shuts down.
    events: Condvar,
    // Signalled when waiters on some page are released.
    wakeups: Condvar,
}

impl SimKernel {
    /// Creates a channel with nothing registered. No negotiation is modelled.
    pub fn new(page_size: usize) -> Self {
        SimKernel {
            page_size,
            state: Mutex::new(SimState::default()),
            events: Condvar::new(),
            wakeups: Condvar::new(),
        }
    }

    /// Features the simulated kernel supports.
    pub fn supported_features() -> FeatureFlags {
        FeatureFlags::PAGEFAULT_FLAG_WP | FeatureFlags::THREAD_ID
    }

    /// Same handshake rules as [`crate::uffd::UffdChannel::negotiate`].
    pub fn negotiate(
        page_size: usize,
        api_version: u64,
        required: FeatureFlags,
    ) -> Result<(Self, Capabilities), NegotiationError> {
        if api_version != UFFD_API {
            return Err(NegotiationError::VersionMismatch {
                requested: api_version,
                supported: UFFD_API,
            });
        }
        let supported = Self::supported_features();
        let missing = required.difference(supported);
        if !missing.is_empty() {
            return Err(NegotiationError::MissingFeatures(missing));
        }
        Ok((
            SimKernel::new(page_size),
            Capabilities {
                supported,
                enabled: required,
            },
        ))
    }

    /// Page size used for faults and resolutions.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn access(&self, addr: usize, write: Option<u8>) -> u8 {
        let page = align_down(addr, self.page_size);
        let offset = addr - page;
        let mut state = self.lock();

        loop {
            let mode = state.mode_of(addr).unwrap_or_default();
            let fault = match state.pages.get(&page) {
                None if mode.missing => Some(if write.is_some() {
                    FaultFlags::WRITE
                } else {
                    FaultFlags::empty()
                }),
                Some(p) if write.is_some() && p.protected && mode.write_protect => {
                    Some(FaultFlags::WP | FaultFlags::WRITE)
                }
                _ => None,
            };

            let Some(flags) = fault else {
                let page_size = self.page_size;
                let entry = state.pages.entry(page).or_insert_with(|| SimPage {
                    bytes: vec![0; page_size],
                    protected: false,
                });
                if let Some(value) = write {
                    entry.bytes[offset] = value;
                }
                return entry.bytes[offset];
            };

            let epoch = state.epoch(page);
            state.queue.push_back(RawEvent::Pagefault {
                address: addr,
                flags,
            });
            self.events.notify_all();
            while state.epoch(page) == epoch && state.mode_of(addr).is_some() {
                state = self
                    .wakeups
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// Reads the byte at `addr`, faulting like a real load.
    pub fn load(&self, addr: usize) -> u8 {
        self.access(addr, None)
    }

    /// Writes the byte at `addr`, faulting like a real store.
    pub fn store(&self, addr: usize, value: u8) {
        self.access(addr, Some(value));
    }

    /// Queues a record no accessor is waiting on.
    pub fn inject_event(&self, event: RawEvent) {
        self.lock().queue.push_back(event);
        self.events.notify_all();
    }

    /// Makes the next `count` reads fail with [`ChannelError::Interrupted`].
    pub fn inject_interrupts(&self, count: usize) {
        self.lock().pending_interrupts += count;
    }

    /// Releases the channel: every registration is dropped, every blocked
    /// access resumes and readers see end of file.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.ranges.clear();
        for page in state.pages.values_mut() {
            page.protected = false;
        }
        self.events.notify_all();
        self.wakeups.notify_all();
    }

    /// Every request the channel accepted so far, in order.
    pub fn ops(&self) -> Vec<SimOp> {
        self.lock().ops.clone()
    }

    /// Every record handed to a reader, in order.
    pub fn delivered(&self) -> Vec<RawEvent> {
        self.lock().delivered.clone()
    }

    /// Records queued but not yet read.
    pub fn pending_faults(&self) -> usize {
        self.lock().queue.len()
    }

    /// Content of `page`, or `None` while it is not mapped.
    pub fn page_bytes(&self, page: usize) -> Option<Vec<u8>> {
        self.lock().pages.get(&page).map(|p| p.bytes.clone())
    }

    /// Whether `page` is write protected, or `None` while it is not mapped.
    pub fn is_protected(&self, page: usize) -> Option<bool> {
        self.lock().pages.get(&page).map(|p| p.protected)
    }

    /// Whether `addr` lies in a registered range.
    pub fn is_registered(&self, addr: usize) -> bool {
        self.lock().mode_of(addr).is_some()
    }

    /// Polls `cond` until it holds or `timeout` elapses.
    pub fn wait_until<F: Fn(&SimKernel) -> bool>(&self, timeout: Duration, cond: F) -> bool {
        let deadline = Instant::now() + timeout;
        while !cond(self) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn check_range(&self, addr: usize, len: usize) -> Result<(), ChannelError> {
        if len == 0 || !is_aligned(addr, self.page_size) || !is_aligned(len, self.page_size) {
            return Err(ChannelError::from_errno(libc::EINVAL));
        }
        Ok(())
    }
}

impl FaultChannel for SimKernel {
    fn register_range(
        &self,
        base: usize,
        len: usize,
        mode: TrackingMode,
    ) -> Result<(), ChannelError> {
        self.check_range(base, len)?;
        let mut state = self.lock();
        if state
            .ranges
            .iter()
            .any(|(b, l, _)| base < b + l && *b < base + len)
        {
            return Err(ChannelError::from_errno(libc::EBUSY));
        }
        state.ranges.push((base, len, mode));
        state.ops.push(SimOp::Register { base, len });
        Ok(())
    }

    fn unregister_range(&self, base: usize, len: usize) -> Result<(), ChannelError> {
        self.check_range(base, len)?;
        let mut state = self.lock();
        let idx = state
            .ranges
            .iter()
            .position(|(b, l, _)| *b == base && *l == len)
            .ok_or_else(|| ChannelError::from_errno(libc::EINVAL))?;
        state.ranges.swap_remove(idx);
        for (addr, page) in state.pages.iter_mut() {
            if *addr >= base && addr - base < len {
                page.protected = false;
            }
        }
        state.release(base, len, self.page_size);
        state.ops.push(SimOp::Unregister { base, len });
        self.wakeups.notify_all();
        Ok(())
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> Result<Readiness, ChannelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Ok(Readiness::Shutdown);
            }
            if !state.queue.is_empty() || state.closed || state.pending_interrupts > 0 {
                return Ok(Readiness::Ready);
            }
            match deadline {
                None => {
                    state = self
                        .events
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Readiness::TimedOut);
                    }
                    state = self
                        .events
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn read_event(&self) -> Result<Option<RawEvent>, ChannelError> {
        let mut state = self.lock();
        if state.pending_interrupts > 0 {
            state.pending_interrupts -= 1;
            return Err(ChannelError::Interrupted);
        }
        match state.queue.pop_front() {
            Some(event) => {
                state.delivered.push(event);
                Ok(Some(event))
            }
            None if state.closed => Err(ChannelError::Closed),
            None => Ok(None),
        }
    }

    fn install_page(&self, dst: usize, content: &[u8], wake: bool) -> Result<(), ChannelError> {
        self.check_range(dst, content.len())?;
        if content.len() != self.page_size {
            return Err(ChannelError::from_errno(libc::EINVAL));
        }
        let mut state = self.lock();
        if state.mode_of(dst).is_none() {
            return Err(ChannelError::from_errno(libc::ENOENT));
        }
        if state.pages.contains_key(&dst) {
            return Err(ChannelError::from_errno(libc::EEXIST));
        }
        state.pages.insert(
            dst,
            SimPage {
                bytes: content.to_vec(),
                protected: false,
            },
        );
        state.ops.push(SimOp::Install { dst, wake });
        if wake {
            state.release(dst, self.page_size, self.page_size);
            self.wakeups.notify_all();
        }
        Ok(())
    }

    fn set_write_protect(
        &self,
        addr: usize,
        len: usize,
        protect: bool,
    ) -> Result<(), ChannelError> {
        self.check_range(addr, len)?;
        let mut state = self.lock();
        if !state.mode_of(addr).is_some_and(|mode| mode.write_protect) {
            return Err(ChannelError::from_errno(libc::ENOENT));
        }
        for page in (addr..addr + len).step_by(self.page_size) {
            if let Some(p) = state.pages.get_mut(&page) {
                p.protected = protect;
            }
        }
        if protect {
            state.ops.push(SimOp::Protect { addr, len });
        } else {
            state.ops.push(SimOp::Unprotect { addr, len });
            state.release(addr, len, self.page_size);
            self.wakeups.notify_all();
        }
        Ok(())
    }

    fn wake(&self, addr: usize, len: usize) -> Result<(), ChannelError> {
        self.check_range(addr, len)?;
        let mut state = self.lock();
        state.release(addr, len, self.page_size);
        state.ops.push(SimOp::Wake { addr, len });
        self.wakeups.notify_all();
        Ok(())
    }

    fn shutdown(&self) -> Result<(), ChannelError> {
        self.lock().shutdown = true;
        self.events.notify_all();
        Ok(())
    }
}
