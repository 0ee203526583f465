//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and its external
//! collaborators: runner agents, the secret store and reporting sinks.

use crate::events::Event;
use crate::ids::{DispatchId, JobKey, RunId, RunnerId};
use crate::secrets::SecretValue;
use crate::workflow::PermissionLevel;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Transport to runner agents.
///
/// Dispatch does not wait for the job to finish; results come back through
/// the engine's reporting entry points.
#[async_trait]
pub trait RunnerTransport: Send + Sync {
    /// Send a job to a runner.
    async fn dispatch(&self, runner: RunnerId, request: DispatchRequest) -> Result<()>;

    /// Ask a runner to stop a job. Termination is acknowledged asynchronously.
    async fn cancel(&self, runner: RunnerId, run_id: RunId, job: &JobKey) -> Result<()>;
}

/// Resolves opaque secret references.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<SecretValue>;
}

/// Receives status transition events (badges, notifications, artifact stores).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// A job handed to a runner.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub dispatch_id: DispatchId,
    pub run_id: RunId,
    pub job: JobKey,
    pub attempt: u32,
    pub steps: Vec<DispatchStep>,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, SecretValue>,
    pub permissions: BTreeMap<String, PermissionLevel>,
    pub timeout_minutes: u32,
}

/// A step with its expressions already interpolated.
#[derive(Debug, Clone)]
pub struct DispatchStep {
    pub index: usize,
    pub name: String,
    pub uses: Option<String>,
    pub run: Option<String>,
    pub with: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub continue_on_error: bool,
}

/// Secret provider that knows no secrets.
pub struct NoSecrets;

#[async_trait]
impl SecretProvider for NoSecrets {
    async fn resolve(&self, name: &str) -> Result<SecretValue> {
        Err(crate::Error::SecretNotFound(name.to_string()))
    }
}

/// Event sink that drops everything.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}
