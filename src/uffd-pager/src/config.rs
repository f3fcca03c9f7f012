// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use userfaultfd::FeatureFlags;

use crate::channel::TrackingMode;
use crate::provider::FillPolicy;

/// Default grace window, in microseconds.
pub const DEFAULT_GRACE_WINDOW_US: u64 = 1;

/// Errors associated with loading a [`PagerConfig`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Cannot read configuration file: {0}
    Io(#[from] std::io::Error),
    /// Cannot parse configuration: {0}
    Parse(#[from] serde_json::Error),
    /// At least one of `track_missing` and `track_write_protect` must be set
    NoTracking,
}

/// Knobs of the fault engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PagerConfig {
    /// Resolve accesses to pages that have no content yet.
    #[serde(default = "default_true")]
    pub track_missing: bool,
    /// Keep installed pages write protected and resolve writes to them.
    #[serde(default = "default_true")]
    pub track_write_protect: bool,
    /// Time a page stays writable after a write is granted.
    #[serde(default = "default_grace_window_us")]
    pub grace_window_us: u64,
    /// Content policy for installed pages.
    #[serde(default)]
    pub fill: FillPolicy,
}

fn default_true() -> bool {
    true
}

fn default_grace_window_us() -> u64 {
    DEFAULT_GRACE_WINDOW_US
}

impl Default for PagerConfig {
    fn default() -> Self {
        PagerConfig {
            track_missing: true,
            track_write_protect: true,
            grace_window_us: DEFAULT_GRACE_WINDOW_US,
            fill: FillPolicy::default(),
        }
    }
}

impl PagerConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: PagerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Checks that the configuration describes something to monitor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracking_mode().is_empty() {
            return Err(ConfigError::NoTracking);
        }
        Ok(())
    }

    /// Tracking modes to register the region with.
    pub fn tracking_mode(&self) -> TrackingMode {
        TrackingMode {
            missing: self.track_missing,
            write_protect: self.track_write_protect,
        }
    }

    /// Features the fault channel must enable.
    pub fn required_features(&self) -> FeatureFlags {
        if self.track_write_protect {
            FeatureFlags::PAGEFAULT_FLAG_WP
        } else {
            FeatureFlags::empty()
        }
    }

    /// The grace window as a [`Duration`].
    pub fn grace_window(&self) -> Duration {
        Duration::from_micros(self.grace_window_us)
    }
}
