// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The fault engine: intercept a fault, resolve it, resume the access.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::channel::{ChannelError, FaultChannel};
use crate::classifier::{ClassifyError, Resolution, classify};
use crate::config::PagerConfig;
use crate::dispatch::{Dispatcher, ResolutionError};
use crate::monitor::{FaultEvent, FaultMonitor, MonitorError};
use crate::protection::{PageStates, ProtectionController};
use crate::provider::{PageContentProvider, PatternProvider};
use crate::region::Region;

/// Name of the monitor thread.
const MONITOR_THREAD_NAME: &str = "fault_monitor";

/// Errors that stop the fault engine. All of them are fatal for the accesses
/// still blocked on the region.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum EngineError {
    /// {0}
    Monitor(#[from] MonitorError),
    /// Fault #{sequence} at {address:#x}: {source}
    Classify { sequence: u64, address: usize, source: ClassifyError },
    /// Fault #{sequence} at {address:#x} is outside the monitored region
    OutOfRegion { sequence: u64, address: usize },
    /// Failed to resolve fault #{sequence} at {address:#x}: {source}
    Resolution { sequence: u64, address: usize, source: ResolutionError },
    /// Failed to spawn the fault monitor thread: {0}
    Spawn(std::io::Error),
    /// Failed to shut the fault channel down: {0}
    Shutdown(ChannelError),
    /// Fault monitor thread panicked
    MonitorPanicked,
}

/// Counters updated by the monitor thread.
#[derive(Debug, Default)]
pub struct FaultStats {
    faults: AtomicU64,
    installs: AtomicU64,
    reapplies: AtomicU64,
    grants: AtomicU64,
    duplicates: AtomicU64,
}

/// Point-in-time copy of [`FaultStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaultStatsSnapshot {
    /// Fault records handled.
    pub faults: u64,
    /// Pages installed.
    pub installs: u64,
    /// Protections re-armed without a write.
    pub reapplies: u64,
    /// Writes let through a protected page.
    pub grants: u64,
    /// Missing faults for pages that were already installed.
    pub duplicates: u64,
}

impl FaultStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> FaultStatsSnapshot {
        FaultStatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            installs: self.installs.load(Ordering::Relaxed),
            reapplies: self.reapplies.load(Ordering::Relaxed),
            grants: self.grants.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

/// Resolves the faults of one region, one record at a time.
#[derive(Debug)]
pub struct FaultEngine<C> {
    channel: Arc<C>,
    monitor: FaultMonitor<C>,
    dispatcher: Dispatcher<C>,
    provider: Box<dyn PageContentProvider>,
    states: Arc<PageStates>,
    stats: Arc<FaultStats>,
}

impl<C: FaultChannel> FaultEngine<C> {
    /// Builds an engine for `region`, which must be registered on `channel`.
    pub fn new(channel: Arc<C>, region: Region, config: &PagerConfig) -> Self {
        let states = Arc::new(PageStates::new(&region));
        let protection = ProtectionController::new(
            channel.clone(),
            region,
            states.clone(),
            config.grace_window(),
        );

        FaultEngine {
            monitor: FaultMonitor::new(channel.clone()),
            dispatcher: Dispatcher::new(channel.clone(), region, states.clone(), protection),
            provider: Box::new(PatternProvider::new(config.fill, region.page_size())),
            channel,
            states,
            stats: Arc::new(FaultStats::default()),
        }
    }

    /// Replaces the page content provider.
    pub fn with_provider(mut self, provider: Box<dyn PageContentProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// The monitored region.
    pub fn region(&self) -> &Region {
        self.dispatcher.region()
    }

    /// Fault counters, shared with the monitor thread.
    pub fn stats(&self) -> Arc<FaultStats> {
        self.stats.clone()
    }

    /// Per-page protection state, shared with the monitor thread.
    pub fn page_states(&self) -> Arc<PageStates> {
        self.states.clone()
    }

    /// Classifies and resolves one fault record.
    pub fn handle_event(&mut self, event: &FaultEvent) -> Result<Resolution, EngineError> {
        let FaultEvent {
            sequence, address, ..
        } = *event;
        FaultStats::inc(&self.stats.faults);

        let resolution = classify(event).map_err(|source| EngineError::Classify {
            sequence,
            address,
            source,
        })?;
        let page = self
            .dispatcher
            .region()
            .page_of(address)
            .ok_or(EngineError::OutOfRegion { sequence, address })?;
        debug!(
            "Fault #{} at {:#x} ({:?}): {:?}",
            sequence, address, event.flags, resolution
        );

        let result = match resolution {
            Resolution::Reapply => self
                .dispatcher
                .reapply_protection(page)
                .map(|()| FaultStats::inc(&self.stats.reapplies)),
            Resolution::GrantThenReapply => self
                .dispatcher
                .grant_then_reapply(page)
                .map(|()| FaultStats::inc(&self.stats.grants)),
            Resolution::InstallThenProtect if self.dispatcher.is_installed(page) => {
                // Another access to the same page faulted before the install.
                warn!("Page {:#x} already installed, waking", page);
                self.dispatcher
                    .release(page)
                    .map(|()| FaultStats::inc(&self.stats.duplicates))
            }
            Resolution::InstallThenProtect => {
                let frame = self.provider.fill(sequence);
                self.dispatcher
                    .install_then_protect(page, frame)
                    .map(|()| FaultStats::inc(&self.stats.installs))
            }
        };
        result.map_err(|source| EngineError::Resolution {
            sequence,
            address,
            source,
        })?;

        Ok(resolution)
    }

    /// Waits for one record and resolves it. Returns `false` after shutdown.
    pub fn poll_once(&mut self) -> Result<bool, EngineError> {
        match self.monitor.next_event()? {
            Some(event) => {
                self.handle_event(&event)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resolves faults until the channel is shut down or an error occurs.
    pub fn run(mut self) -> Result<(), EngineError> {
        info!(
            "Fault monitor started for {} pages at {:#x}",
            self.region().page_count(),
            self.region().base()
        );
        while self.poll_once()? {}
        info!(
            "Fault monitor stopped after {} faults",
            self.monitor.next_sequence()
        );
        Ok(())
    }
}

impl<C: FaultChannel + 'static> FaultEngine<C> {
    /// Runs the engine on a dedicated monitor thread.
    pub fn spawn(self) -> Result<EngineHandle<C>, EngineError> {
        self.spawn_with_fatal_hook(|_| {})
    }

    /// Runs the engine on a dedicated monitor thread. `on_fatal` is called on
    /// that thread if the engine stops with an error.
    pub fn spawn_with_fatal_hook<F>(self, on_fatal: F) -> Result<EngineHandle<C>, EngineError>
    where
        F: FnOnce(&EngineError) + Send + 'static,
    {
        let channel = self.channel.clone();
        let stats = self.stats.clone();
        let states = self.states.clone();

        let thread = thread::Builder::new()
            .name(MONITOR_THREAD_NAME.into())
            .spawn(move || {
                let result = self.run();
                if let Err(err) = &result {
                    error!("Fault monitor failed: {}", err);
                    on_fatal(err);
                }
                result
            })
            .map_err(EngineError::Spawn)?;

        Ok(EngineHandle {
            channel,
            thread,
            stats,
            states,
        })
    }
}

/// Handle to an engine running on its monitor thread.
#[derive(Debug)]
pub struct EngineHandle<C> {
    channel: Arc<C>,
    thread: JoinHandle<Result<(), EngineError>>,
    stats: Arc<FaultStats>,
    states: Arc<PageStates>,
}

impl<C: FaultChannel> EngineHandle<C> {
    /// Fault counters.
    pub fn stats(&self) -> Arc<FaultStats> {
        self.stats.clone()
    }

    /// Per-page protection state.
    pub fn page_states(&self) -> Arc<PageStates> {
        self.states.clone()
    }

    /// Whether the monitor thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stops the monitor at its next wait and joins it.
    pub fn shutdown(self) -> Result<(), EngineError> {
        self.channel.shutdown().map_err(EngineError::Shutdown)?;
        self.join()
    }

    /// Joins the monitor thread without asking it to stop.
    pub fn join(self) -> Result<(), EngineError> {
        self.thread
            .join()
            .map_err(|_| EngineError::MonitorPanicked)?
    }
}
