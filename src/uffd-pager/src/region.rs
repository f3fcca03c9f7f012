// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reservation of the monitored virtual range and its registration with a
//! fault channel.

use std::sync::Arc;

use log::info;
use serde::Serialize;
use userfaultfd::FeatureFlags;
use utils::{align_down, is_aligned};
use vm_memory::mmap::{MmapRegionBuilder, MmapRegionError};
use vm_memory::{ByteValued, MmapRegion, VolatileMemory, VolatileMemoryError};

use crate::channel::{ChannelError, FaultChannel, TrackingMode};
use crate::uffd::Capabilities;

/// Why a range cannot be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, displaydoc::Display)]
pub enum ConflictReason {
    /// range is empty
    ZeroLength,
    /// base or length is not a multiple of the page size
    Misaligned,
    /// range overlaps an existing registration
    Overlap,
    /// range wraps around the address space
    Wraps,
}

/// Errors associated with the monitored region.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum RegionError {
    /// Cannot reserve {len:#x} bytes of anonymous memory: {source}
    ResourceExhaustion { len: usize, source: MmapRegionError },
    /// Cannot register range {base:#x}+{len:#x}: {reason}
    RegistrationConflict { base: usize, len: usize, reason: ConflictReason },
    /// No tracking mode selected for range {0:#x}
    NoTracking(usize),
    /// Write-protect tracking requested but not negotiated with the fault channel
    WriteProtectNotNegotiated,
    /// Fault channel refused to register range {base:#x}+{len:#x}: {source}
    Register { base: usize, len: usize, source: ChannelError },
    /// Fault channel refused to unregister range {base:#x}+{len:#x}: {source}
    Unregister { base: usize, len: usize, source: ChannelError },
    /// Range {0:#x} is not registered
    NotRegistered(usize),
    /// Access outside the reserved memory: {0}
    Access(#[from] VolatileMemoryError),
}

/// Anonymous, demand-paged memory backing the monitored region.
///
/// The mapping is released when the reservation is dropped, so it must outlive
/// its registration.
#[derive(Debug)]
pub struct Reservation {
    mapping: MmapRegion,
}

impl Reservation {
    /// Reserves `len` bytes of private anonymous memory. No page is populated.
    pub fn reserve(len: usize) -> Result<Self, RegionError> {
        let mapping: MmapRegion = MmapRegionBuilder::new(len)
            .with_mmap_prot(libc::PROT_READ | libc::PROT_WRITE)
            .with_mmap_flags(libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE)
            .build()
            .map_err(|source| RegionError::ResourceExhaustion { len, source })?;

        Ok(Reservation { mapping })
    }

    /// Start address of the reservation.
    pub fn base(&self) -> usize {
        self.mapping.as_ptr() as usize
    }

    /// Size of the reservation in bytes.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Whether the reservation is empty.
    pub fn is_empty(&self) -> bool {
        self.mapping.len() == 0
    }

    /// Volatile load of a `T` at `offset`. Blocks while the page is unresolved.
    pub fn load<T: ByteValued>(&self, offset: usize) -> Result<T, RegionError> {
        Ok(self.mapping.get_ref::<T>(offset)?.load())
    }

    /// Volatile store of `value` at `offset`. Blocks while the page is
    /// unresolved or write protected.
    pub fn store<T: ByteValued>(&self, offset: usize, value: T) -> Result<(), RegionError> {
        self.mapping.get_ref::<T>(offset)?.store(value);
        Ok(())
    }
}

/// A page-aligned range registered for fault reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    base: usize,
    len: usize,
    page_size: usize,
    mode: TrackingMode,
}

impl Region {
    /// Start address of the region.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false, registered regions are never empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Page size the region is aligned to.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Tracking modes the region was registered with.
    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    /// Number of pages in the region.
    pub fn page_count(&self) -> usize {
        self.len / self.page_size
    }

    /// Whether `addr` falls inside the region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.len
    }

    /// Whether `[addr, addr + len)` falls inside the region.
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        self.contains(addr) && len <= self.len - (addr - self.base)
    }

    /// Page-aligned address of the page holding `addr`.
    pub fn page_of(&self, addr: usize) -> Option<usize> {
        self.contains(addr)
            .then(|| align_down(addr, self.page_size))
    }

    /// Index of the page holding `addr`.
    pub fn page_index(&self, addr: usize) -> Option<usize> {
        self.contains(addr)
            .then(|| (addr - self.base) / self.page_size)
    }

    fn overlaps(&self, base: usize, len: usize) -> bool {
        base < self.base + self.len && self.base < base + len
    }
}

/// Registers ranges with a negotiated fault channel.
///
/// A manager can only be built from the [`Capabilities`] returned by
/// negotiation, so registration always follows the handshake.
#[derive(Debug)]
pub struct RegionManager<C> {
    channel: Arc<C>,
    capabilities: Capabilities,
    page_size: usize,
    registered: Vec<Region>,
}

impl<C: FaultChannel> RegionManager<C> {
    /// Creates a manager for a channel negotiated with `capabilities`.
    pub fn new(channel: Arc<C>, capabilities: Capabilities, page_size: usize) -> Self {
        RegionManager {
            channel,
            capabilities,
            page_size,
            registered: Vec::new(),
        }
    }

    /// Regions registered so far.
    pub fn regions(&self) -> &[Region] {
        &self.registered
    }

    /// Registers `[base, base + len)` with the channel.
    pub fn register(
        &mut self,
        base: usize,
        len: usize,
        mode: TrackingMode,
    ) -> Result<Region, RegionError> {
        let conflict = |reason| RegionError::RegistrationConflict { base, len, reason };

        if len == 0 {
            return Err(conflict(ConflictReason::ZeroLength));
        }
        if !is_aligned(base, self.page_size) || !is_aligned(len, self.page_size) {
            return Err(conflict(ConflictReason::Misaligned));
        }
        if base.checked_add(len).is_none() {
            return Err(conflict(ConflictReason::Wraps));
        }
        if self.registered.iter().any(|r| r.overlaps(base, len)) {
            return Err(conflict(ConflictReason::Overlap));
        }
        if mode.is_empty() {
            return Err(RegionError::NoTracking(base));
        }
        if mode.write_protect
            && !self
                .capabilities
                .enabled
                .contains(FeatureFlags::PAGEFAULT_FLAG_WP)
        {
            return Err(RegionError::WriteProtectNotNegotiated);
        }

        self.channel
            .register_range(base, len, mode)
            .map_err(|source| RegionError::Register { base, len, source })?;

        let region = Region {
            base,
            len,
            page_size: self.page_size,
            mode,
        };
        info!(
            "Registered {} pages at {:#x} (missing: {}, write-protect: {})",
            region.page_count(),
            base,
            mode.missing,
            mode.write_protect
        );
        self.registered.push(region);

        Ok(region)
    }

    /// Registers the whole of `reservation`.
    pub fn register_reservation(
        &mut self,
        reservation: &Reservation,
        mode: TrackingMode,
    ) -> Result<Region, RegionError> {
        self.register(reservation.base(), reservation.len(), mode)
    }

    /// Removes `region`, waking any access still blocked inside it.
    pub fn unregister(&mut self, region: &Region) -> Result<(), RegionError> {
        let idx = self
            .registered
            .iter()
            .position(|r| r == region)
            .ok_or(RegionError::NotRegistered(region.base))?;

        self.channel
            .unregister_range(region.base, region.len)
            .map_err(|source| RegionError::Unregister {
                base: region.base,
                len: region.len,
                source,
            })?;
        self.registered.swap_remove(idx);
        info!("Unregistered range at {:#x}", region.base);

        Ok(())
    }
}
