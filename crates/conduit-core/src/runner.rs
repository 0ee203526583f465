//! Runner types.

use crate::ids::{JobKey, RunId, RunnerId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    pub labels: BTreeSet<String>,
    pub status: RunnerStatus,
    pub assignment: Option<Assignment>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Runner {
    /// Whether this runner advertises every required label.
    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.labels)
    }
}

/// The job a busy runner is working on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Assignment {
    pub run_id: RunId,
    pub job: JobKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Busy,
    Draining,
    Offline,
}

impl RunnerStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, RunnerStatus::Idle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunnerRegistration {
    pub name: String,
    pub labels: Vec<String>,
}

impl RunnerRegistration {
    pub fn new<I, S>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Graceful,
    HeartbeatTimeout,
    TransportError,
}
