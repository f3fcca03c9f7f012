// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reads fault records off the channel, one at a time and in delivery order.

use std::sync::Arc;

use log::debug;

use crate::channel::{ChannelError, FaultChannel, RawEvent, Readiness};
use crate::classifier::FaultFlags;

/// A sequenced fault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    /// Position of this record in the stream read by one monitor, starting at 0.
    pub sequence: u64,
    /// Byte-exact faulting address.
    pub address: usize,
    /// Kernel fault flags.
    pub flags: FaultFlags,
}

/// Errors associated with reading fault records.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MonitorError {
    /// Fault channel closed unexpectedly
    ChannelClosed,
    /// Received a {0} event, only page faults are handled
    UnexpectedEventKind(&'static str),
    /// Failed waiting for a fault record: {0}
    Wait(ChannelError),
    /// Failed reading a fault record: {0}
    Read(ChannelError),
}

/// Single consumer of a fault channel.
///
/// The monitor owns the sequence counter, so records observed through one
/// monitor carry strictly increasing sequence numbers without gaps.
#[derive(Debug)]
pub struct FaultMonitor<C> {
    channel: Arc<C>,
    next_sequence: u64,
}

impl<C: FaultChannel> FaultMonitor<C> {
    /// Creates a monitor reading from `channel`.
    pub fn new(channel: Arc<C>) -> Self {
        FaultMonitor {
            channel,
            next_sequence: 0,
        }
    }

    /// Sequence number the next record will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Blocks until a record is available. Returns `false` once the channel has
    /// been shut down.
    pub fn wait_ready(&self) -> Result<bool, MonitorError> {
        loop {
            match self.channel.wait_ready(None) {
                Ok(Readiness::Ready) => return Ok(true),
                Ok(Readiness::Shutdown) => return Ok(false),
                Ok(Readiness::TimedOut) | Err(ChannelError::Interrupted) => continue,
                Err(ChannelError::Closed) => return Err(MonitorError::ChannelClosed),
                Err(err) => return Err(MonitorError::Wait(err)),
            }
        }
    }

    /// Reads exactly one record. `Ok(None)` means the readiness was spurious.
    pub fn read_one(&mut self) -> Result<Option<FaultEvent>, MonitorError> {
        loop {
            match self.channel.read_event() {
                Ok(Some(RawEvent::Pagefault { address, flags })) => {
                    let event = FaultEvent {
                        sequence: self.next_sequence,
                        address,
                        flags,
                    };
                    self.next_sequence += 1;
                    return Ok(Some(event));
                }
                Ok(Some(RawEvent::Unexpected(kind))) => {
                    return Err(MonitorError::UnexpectedEventKind(kind));
                }
                Ok(None) => return Ok(None),
                Err(ChannelError::Interrupted) => {
                    debug!("Fault channel read interrupted, retrying");
                }
                Err(ChannelError::Closed) => return Err(MonitorError::ChannelClosed),
                Err(err) => return Err(MonitorError::Read(err)),
            }
        }
    }

    /// Waits for and returns the next record, or `None` after shutdown.
    pub fn next_event(&mut self) -> Result<Option<FaultEvent>, MonitorError> {
        loop {
            if !self.wait_ready()? {
                return Ok(None);
            }
            if let Some(event) = self.read_one()? {
                return Ok(Some(event));
            }
        }
    }
}
