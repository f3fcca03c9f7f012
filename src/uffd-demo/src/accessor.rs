// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accessor threads: ordinary loads and stores on the monitored region.
//!
//! None of this code knows about faults. An access to an unresolved page
//! simply blocks until the monitor thread resolves it.

use std::mem::size_of;
use std::thread;

use log::{debug, info};
use uffd_pager::Reservation;
use uffd_pager::region::RegionError;

/// First byte touched in read mode. Deliberately not page aligned.
pub const READ_OFFSET: usize = 0xf;

/// What accessors do with the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AccessMode {
    /// Read one byte every stride.
    Read,
    /// Increment the first `u32` of every stride.
    Write,
}

/// Errors associated with accessing the region.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum AccessError {
    /// Stride {0} must be a non-zero multiple of 4
    InvalidStride(usize),
    /// At least one accessor is required
    NoAccessors,
    /// {0}
    Region(#[from] RegionError),
    /// Counter at offset {offset:#x} is {found}, expected {expected}
    Mismatch { offset: usize, expected: u32, found: u32 },
    /// Accessor thread panicked
    AccessorPanicked,
}

/// How the accessors walk the region.
#[derive(Debug, Clone, Copy)]
pub struct AccessPlan {
    pub mode: AccessMode,
    pub accessors: usize,
    pub stride: usize,
    pub rounds: u32,
}

impl AccessPlan {
    fn validate(&self) -> Result<(), AccessError> {
        if self.stride == 0 || self.stride % size_of::<u32>() != 0 {
            return Err(AccessError::InvalidStride(self.stride));
        }
        if self.accessors == 0 {
            return Err(AccessError::NoAccessors);
        }
        Ok(())
    }

    /// Offsets touched by accessor `id`. Accessors split the strides round robin.
    fn offsets(&self, id: usize, len: usize, first: usize) -> impl Iterator<Item = usize> {
        (first..len)
            .step_by(self.stride)
            .skip(id)
            .step_by(self.accessors)
    }
}

type Worker = fn(&Reservation, &AccessPlan, usize) -> Result<u64, AccessError>;

fn read_worker(
    reservation: &Reservation,
    plan: &AccessPlan,
    id: usize,
) -> Result<u64, AccessError> {
    let mut touches = 0;
    for offset in plan.offsets(id, reservation.len(), READ_OFFSET) {
        let byte: u8 = reservation.load(offset)?;
        info!(
            "Accessor {} read {:?} at offset {:#x}",
            id,
            char::from(byte),
            offset
        );
        touches += 1;
    }
    Ok(touches)
}

fn write_worker(
    reservation: &Reservation,
    plan: &AccessPlan,
    id: usize,
) -> Result<u64, AccessError> {
    let mut touches = 0;
    for round in 0..plan.rounds {
        for offset in plan.offsets(id, reservation.len(), 0) {
            let value: u32 = reservation.load(offset)?;
            reservation.store(offset, value.wrapping_add(1))?;
            touches += 1;
        }
        debug!("Accessor {} finished round {}", id, round);
    }

    for offset in plan.offsets(id, reservation.len(), 0) {
        let found: u32 = reservation.load(offset)?;
        if found != plan.rounds {
            return Err(AccessError::Mismatch {
                offset,
                expected: plan.rounds,
                found,
            });
        }
    }
    Ok(touches)
}

/// Runs `plan.accessors` threads over `reservation` and returns the number of
/// accesses they made. The reservation is expected to start zeroed.
pub fn run(reservation: &Reservation, plan: &AccessPlan) -> Result<u64, AccessError> {
    plan.validate()?;

    let worker: Worker = match plan.mode {
        AccessMode::Read => read_worker,
        AccessMode::Write => write_worker,
    };

    thread::scope(|s| {
        let threads: Vec<_> = (0..plan.accessors)
            .map(|id| s.spawn(move || worker(reservation, plan, id)))
            .collect();

        threads
            .into_iter()
            .try_fold(0, |total, thread| -> Result<u64, AccessError> {
                let touches = thread.join().map_err(|_| AccessError::AccessorPanicked)??;
                Ok(total + touches)
            })
    })
}
