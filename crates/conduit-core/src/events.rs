//! Status transition events emitted to external observers.

use crate::ids::{JobKey, RunId, RunnerId};
use crate::run::{CancelCause, JobReason, JobStatus, RunStatus, StepStatus};
use crate::runner::DisconnectReason;
use crate::workflow::EventKind;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events published by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),
    RunCancelled(RunCancelledPayload),

    // Job lifecycle
    JobQueued(JobQueuedPayload),
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),
    JobRetried(JobRetriedPayload),

    // Step lifecycle
    StepCompleted(StepCompletedPayload),

    // Approval
    ApprovalRequested(ApprovalRequestedPayload),

    // Runner
    RunnerRegistered(RunnerRegisteredPayload),
    RunnerDisconnected(RunnerDisconnectedPayload),
}

impl Event {
    /// Dotted subject used for routing, e.g. `run.<id>.job.build.completed`.
    pub fn subject(&self) -> String {
        match self {
            Event::RunQueued(p) => format!("run.queued.{}", p.workflow),
            Event::RunStarted(p) => format!("run.started.{}.{}", p.workflow, p.run_id),
            Event::RunCompleted(p) => format!("run.completed.{}.{}", p.workflow, p.run_id),
            Event::RunCancelled(p) => format!("run.cancelled.{}.{}", p.workflow, p.run_id),
            Event::JobQueued(p) => format!("run.{}.job.{}.queued", p.run_id, p.job),
            Event::JobStarted(p) => format!("run.{}.job.{}.started", p.run_id, p.job),
            Event::JobCompleted(p) => format!("run.{}.job.{}.completed", p.run_id, p.job),
            Event::JobRetried(p) => format!("run.{}.job.{}.retried", p.run_id, p.job),
            Event::StepCompleted(p) => {
                format!("run.{}.job.{}.step.{}.completed", p.run_id, p.job, p.index)
            }
            Event::ApprovalRequested(p) => format!("approval.requested.{}", p.gate),
            Event::RunnerRegistered(p) => format!("runner.{}.registered", p.runner_id),
            Event::RunnerDisconnected(p) => format!("runner.{}.disconnected", p.runner_id),
        }
    }

    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Event::RunQueued(p) => Some(p.run_id),
            Event::RunStarted(p) => Some(p.run_id),
            Event::RunCompleted(p) => Some(p.run_id),
            Event::RunCancelled(p) => Some(p.run_id),
            Event::JobQueued(p) => Some(p.run_id),
            Event::JobStarted(p) => Some(p.run_id),
            Event::JobCompleted(p) => Some(p.run_id),
            Event::JobRetried(p) => Some(p.run_id),
            Event::StepCompleted(p) => Some(p.run_id),
            Event::ApprovalRequested(p) => Some(p.run_id),
            Event::RunnerRegistered(_) | Event::RunnerDisconnected(_) => None,
        }
    }
}

// === Run Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub run_number: u32,
    pub trigger: EventKind,
    pub git_ref: String,
    pub concurrency_key: Option<String>,
    /// True when the run waits for its concurrency group.
    pub waiting_for_group: bool,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub run_number: u32,
    pub job_count: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub run_number: u32,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub jobs_succeeded: u32,
    pub jobs_failed: u32,
    pub jobs_skipped: u32,
    pub jobs_cancelled: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub cause: CancelCause,
    pub cancelled_at: DateTime<Utc>,
}

// === Job Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobQueuedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub labels: Vec<String>,
    pub attempt: u32,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub runner_id: RunnerId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub status: JobStatus,
    pub reason: JobReason,
    pub duration_ms: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRetriedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub reason: JobReason,
    pub attempt: u32,
}

// === Step Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub completed_at: DateTime<Utc>,
}

// === Approval Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRequestedPayload {
    pub run_id: RunId,
    pub job: JobKey,
    pub gate: String,
    pub requested_at: DateTime<Utc>,
}

// === Runner Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunnerRegisteredPayload {
    pub runner_id: RunnerId,
    pub name: String,
    pub labels: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunnerDisconnectedPayload {
    pub runner_id: RunnerId,
    pub reason: DisconnectReason,
    pub disconnected_at: DateTime<Utc>,
}
