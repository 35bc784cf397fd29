//! Runtime Configuration Module
//!
//! Loads the object runtime settings from an optional TOML file with
//! `PLANT_*` environment variable overrides on top.

use crate::defaults;
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// How an object is published to the remote directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// Reference is bound to the object's name and survives restarts
    #[default]
    StableName,
    /// Reference gets a fresh transport-generated handle on every activation
    GeneratedHandle,
}

/// A setting the runtime cannot work with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} {reason}")]
pub struct InvalidSetting {
    pub field: &'static str,
    pub reason: &'static str,
}

impl InvalidSetting {
    fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

/// Settings shared by every object of one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub node_id: i64,

    /// Attempts for registration and reference creation
    pub repeat_count: u32,
    pub repeat_timeout_ms: u64,

    /// Per-priority mailbox capacity
    pub mailbox_capacity: usize,
    /// Messages dropped when compaction cannot make room (default: capacity / 4)
    pub overflow_drop: Option<usize>,

    pub terminate_timeout_ms: u64,

    pub identity_mode: IdentityMode,
    /// Replace a stale directory entry under the same key instead of failing
    pub evict_on_conflict: bool,
    /// Give every activated object its own worker thread
    pub create_threads: bool,
    /// Install process signal handlers in `ProcessRuntime::run`
    pub handle_signals: bool,

    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_id: defaults::NODE_ID,
            repeat_count: defaults::retry::REPEAT_COUNT,
            repeat_timeout_ms: defaults::retry::REPEAT_TIMEOUT_MS,
            mailbox_capacity: defaults::mailbox::CAPACITY,
            overflow_drop: None,
            terminate_timeout_ms: defaults::termination::TERMINATE_TIMEOUT_MS,
            identity_mode: IdentityMode::default(),
            evict_on_conflict: true,
            create_threads: true,
            handle_signals: true,
            log_level: defaults::LOG_LEVEL.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from an optional file with `PLANT_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, defaults::ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading runtime config");
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(?config, "Runtime config loaded");
        Ok(config)
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> std::result::Result<(), InvalidSetting> {
        if self.mailbox_capacity == 0 {
            return Err(InvalidSetting::new("mailbox_capacity", "must be at least 1"));
        }
        if self.overflow_drop == Some(0) {
            return Err(InvalidSetting::new("overflow_drop", "must be at least 1 when set"));
        }
        if self.terminate_timeout_ms == 0 {
            return Err(InvalidSetting::new(
                "terminate_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Attempts per retried operation; a configured zero still means one
    pub fn attempts(&self) -> u32 {
        self.repeat_count.max(1)
    }

    pub fn repeat_timeout(&self) -> Duration {
        Duration::from_millis(self.repeat_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn overflow_drop(&self) -> usize {
        self.overflow_drop
            .unwrap_or_else(|| defaults::mailbox::overflow_drop(self.mailbox_capacity))
    }
}
