// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! User-space page fault handling engine.
//!
//! A region of anonymous memory is registered with a fault channel (Linux
//! `userfaultfd`) for missing-page and/or write-protect tracking. A single
//! monitor thread reads fault records one at a time, classifies them, and
//! resolves each one by installing page content or toggling write protection,
//! which resumes the suspended access.
//!
//! The crate is organized bottom up:
//! - [`region`] reserves and registers the monitored range.
//! - [`monitor`] waits for and reads fault records in delivery order.
//! - [`classifier`] maps fault flags to a [`classifier::Resolution`].
//! - [`provider`] produces page content for missing-page resolutions.
//! - [`protection`] toggles the write-protect bit and tracks per-page state.
//! - [`dispatch`] submits resolutions back to the channel.
//! - [`engine`] ties everything together in the monitor loop.

pub mod channel;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod monitor;
pub mod protection;
pub mod provider;
pub mod region;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod uffd;

pub use crate::channel::{FaultChannel, RawEvent, Readiness, TrackingMode};
pub use crate::config::PagerConfig;
pub use crate::engine::{EngineError, EngineHandle, FaultEngine};
pub use crate::region::{Region, RegionManager, Reservation};
pub use crate::uffd::{Capabilities, UFFD_API, UffdChannel};
