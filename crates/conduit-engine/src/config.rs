//! Engine configuration.

use conduit_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory scanned for workflow definitions.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,
    /// Interval of the background sweep/dispatch loop.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// How long a running job may ignore a cancel signal.
    #[serde(default = "default_cancel_ack_timeout")]
    pub cancel_ack_timeout_secs: u64,
    /// Runners silent for longer than this are considered lost.
    #[serde(default = "default_heartbeat_timeout")]
    pub runner_heartbeat_timeout_secs: u64,
    /// Finished runs are forgotten this long after completion.
    #[serde(default = "default_run_retention")]
    pub run_retention_secs: u64,
    /// Ref used for schedule-triggered runs.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Re-read changed definition files on every tick.
    #[serde(default = "default_true")]
    pub reload_definitions: bool,
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from(".conduit/workflows")
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_cancel_ack_timeout() -> u64 {
    60
}

fn default_heartbeat_timeout() -> u64 {
    90
}

fn default_run_retention() -> u64 {
    3600
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            tick_interval_ms: default_tick_interval(),
            cancel_ack_timeout_secs: default_cancel_ack_timeout(),
            runner_heartbeat_timeout_secs: default_heartbeat_timeout(),
            run_retention_secs: default_run_retention(),
            default_branch: default_branch(),
            reload_definitions: default_true(),
        }
    }
}

impl EngineConfig {
    /// Load from an optional file, then `CONDUIT__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("CONDUIT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn cancel_ack_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cancel_ack_timeout_secs as i64)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.runner_heartbeat_timeout_secs as i64)
    }

    pub fn run_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.run_retention_secs as i64)
    }
}
