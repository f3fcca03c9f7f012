// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Demonstrates user-space page fault handling on an anonymous region.
//!
//! The region is reserved without populating any page and registered with a
//! userfaultfd. A monitor thread resolves every fault while accessor threads
//! read or write the region as if it were ordinary memory.

mod accessor;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use serde::Serialize;
use uffd_pager::config::ConfigError;
use uffd_pager::engine::{EngineError, FaultStatsSnapshot};
use uffd_pager::monitor::MonitorError;
use uffd_pager::provider::FillPolicy;
use uffd_pager::region::{ConflictReason, RegionError};
use uffd_pager::uffd::NegotiationError;
use uffd_pager::{
    FaultEngine, PagerConfig, Region, RegionManager, Reservation, UFFD_API, UffdChannel,
};
use utils::PageSizeError;

use crate::accessor::{AccessError, AccessMode, AccessPlan};

#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum MainError {
    /// Invalid configuration: {0}
    Config(#[from] ConfigError),
    /// Cannot determine the page size: {0}
    PageSize(#[from] PageSizeError),
    /// Region of {0} pages is too large
    RegionTooLarge(usize),
    /// {0}
    Region(#[from] RegionError),
    /// {0}
    Negotiation(#[from] NegotiationError),
    /// {0}
    Engine(#[from] EngineError),
    /// {0}
    Access(#[from] AccessError),
    /// Cannot serialize statistics: {0}
    Stats(#[from] serde_json::Error),
}

/// Process exit codes. Each fatal error kind gets its own code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum DemoExitCode {
    Ok = 0,
    GenericError = 1,
    ResourceExhaustion = 10,
    NegotiationFailure = 11,
    RegistrationConflict = 12,
    ChannelClosed = 13,
    UnexpectedEventKind = 14,
    ResolutionFailure = 15,
    AccessCheckFailed = 16,
    BadConfiguration = 152,
}

impl From<&EngineError> for DemoExitCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Monitor(MonitorError::ChannelClosed) => DemoExitCode::ChannelClosed,
            EngineError::Monitor(MonitorError::UnexpectedEventKind(_))
            | EngineError::Classify { .. }
            | EngineError::OutOfRegion { .. } => DemoExitCode::UnexpectedEventKind,
            EngineError::Resolution { .. } => DemoExitCode::ResolutionFailure,
            _ => DemoExitCode::GenericError,
        }
    }
}

impl From<&MainError> for DemoExitCode {
    fn from(err: &MainError) -> Self {
        match err {
            MainError::Config(_) => DemoExitCode::BadConfiguration,
            MainError::RegionTooLarge(_) => DemoExitCode::ResourceExhaustion,
            MainError::Region(RegionError::ResourceExhaustion { .. }) => {
                DemoExitCode::ResourceExhaustion
            }
            MainError::Region(_) => DemoExitCode::RegistrationConflict,
            MainError::Negotiation(_) => DemoExitCode::NegotiationFailure,
            MainError::Engine(err) => DemoExitCode::from(err),
            MainError::Access(AccessError::Mismatch { .. }) => DemoExitCode::AccessCheckFailed,
            MainError::Access(AccessError::InvalidStride(_) | AccessError::NoAccessors) => {
                DemoExitCode::BadConfiguration
            }
            _ => DemoExitCode::GenericError,
        }
    }
}

/// Fill accessor-visible memory on demand from a user-space fault handler.
#[derive(Debug, Parser)]
#[command(name = "uffd-demo", version)]
struct Cli {
    /// Number of pages in the monitored region.
    pages: usize,

    /// What the accessor threads do with the region.
    #[arg(long, value_enum, default_value_t = AccessMode::Read)]
    mode: AccessMode,

    /// Number of accessor threads.
    #[arg(long, default_value_t = 1)]
    accessors: usize,

    /// Bytes between two accesses.
    #[arg(long, default_value_t = 1024)]
    stride: usize,

    /// Passes over the region in write mode.
    #[arg(long, default_value_t = 1)]
    rounds: u32,

    /// Content of newly installed pages. Overrides the configuration file.
    #[arg(long, value_enum)]
    fill: Option<FillArg>,

    /// Time a page stays writable after a granted write, in microseconds.
    /// Overrides the configuration file.
    #[arg(long)]
    grace_window_us: Option<u64>,

    /// Only track missing pages. Overrides the configuration file.
    #[arg(long)]
    no_write_protect: bool,

    /// JSON file with the engine configuration.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Log level. `RUST_LOG` is used when not set.
    #[arg(long)]
    log_level: Option<log::LevelFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum FillArg {
    Zero,
    Alphabet,
}

impl From<FillArg> for FillPolicy {
    fn from(arg: FillArg) -> Self {
        match arg {
            FillArg::Zero => FillPolicy::Zero,
            FillArg::Alphabet => FillPolicy::Alphabet,
        }
    }
}

impl Cli {
    /// Loads the configuration file, if any, and applies command line overrides.
    fn pager_config(&self) -> Result<PagerConfig, ConfigError> {
        let mut config = match &self.config_file {
            Some(path) => PagerConfig::from_file(path)?,
            None => PagerConfig::default(),
        };
        if let Some(fill) = self.fill {
            config.fill = fill.into();
        }
        if let Some(grace_window_us) = self.grace_window_us {
            config.grace_window_us = grace_window_us;
        }
        if self.no_write_protect {
            config.track_write_protect = false;
        }
        config.validate()?;
        Ok(config)
    }

    fn access_plan(&self) -> AccessPlan {
        AccessPlan {
            mode: self.mode,
            accessors: self.accessors,
            stride: self.stride,
            rounds: self.rounds,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    region: Region,
    accesses: u64,
    stats: FaultStatsSnapshot,
}

fn init_logger(level: Option<log::LevelFilter>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder.init();
}

/// Size in bytes of a region of `pages` pages.
fn region_len(pages: usize, page_size: usize) -> Result<usize, MainError> {
    if pages == 0 {
        return Err(MainError::Region(RegionError::RegistrationConflict {
            base: 0,
            len: 0,
            reason: ConflictReason::ZeroLength,
        }));
    }
    pages
        .checked_mul(page_size)
        .ok_or(MainError::RegionTooLarge(pages))
}

fn main_exec(cli: &Cli) -> Result<RunSummary, MainError> {
    let config = cli.pager_config()?;
    let page_size = utils::get_page_size()?;
    let len = region_len(cli.pages, page_size)?;

    let reservation = Reservation::reserve(len)?;
    let (channel, capabilities) = UffdChannel::negotiate(UFFD_API, config.required_features())?;
    let channel = Arc::new(channel);
    let mut manager = RegionManager::new(channel.clone(), capabilities, page_size);
    let region = manager.register_reservation(&reservation, config.tracking_mode())?;

    let handle = FaultEngine::new(channel, region, &config).spawn_with_fatal_hook(|err| {
        let code = DemoExitCode::from(err);
        error!("Fault engine failed, exiting. exit_code={}", code as u8);
        // Blocked accessors cannot resume without a resolution.
        #[allow(clippy::exit)]
        std::process::exit(i32::from(code as u8));
    })?;

    let accesses = accessor::run(&reservation, &cli.access_plan())?;

    let stats = handle.stats();
    handle.shutdown()?;
    manager.unregister(&region)?;
    info!("Accessors made {} accesses", accesses);

    Ok(RunSummary {
        region,
        accesses,
        stats: stats.snapshot(),
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.log_level);

    let summary = main_exec(&cli).and_then(|summary| {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(summary)
    });

    match summary {
        Ok(_) => ExitCode::from(DemoExitCode::Ok as u8),
        Err(err) => {
            let code = DemoExitCode::from(&err);
            error!("{}", err);
            eprintln!("Error: {:?}", err);
            error!("uffd-demo exiting with error. exit_code={}", code as u8);
            ExitCode::from(code as u8)
        }
    }
}
