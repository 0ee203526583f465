//! Run and job execution types.

use crate::ids::{JobKey, RunId, RunnerId};
use crate::trigger::RepoEvent;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub workflow: String,
    pub run_number: u32,
    pub status: RunStatus,
    pub event: RepoEvent,
    pub concurrency_key: Option<String>,
    pub cancel_cause: Option<CancelCause>,
    pub jobs: BTreeMap<JobKey, JobExecution>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn job(&self, key: &JobKey) -> Option<&JobExecution> {
        self.jobs.get(key)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as u64)
    }
}

/// `pending → running → {succeeded, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobExecution {
    pub key: JobKey,
    /// Id of the job definition this execution was expanded from.
    pub job_id: String,
    pub display_name: String,
    pub status: JobStatus,
    pub reason: Option<JobReason>,
    /// Optional jobs (`continue_on_error`) never fail the run.
    pub required: bool,
    pub runner_id: Option<RunnerId>,
    pub attempt: u32,
    pub matrix: BTreeMap<String, String>,
    pub steps: Vec<StepResult>,
    pub outputs: BTreeMap<String, String>,
    /// Set while a cooperative cancel awaits the runner's acknowledgement.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobExecution {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Skipped
        )
    }

    /// Result string exposed to expressions as `needs.<id>.result`.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "success",
            JobStatus::Failed => "failure",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job execution reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobReason {
    Completed,
    StepFailed {
        step: usize,
        exit_code: Option<i32>,
    },
    Timeout,
    RunnerLost,
    SecretUnavailable {
        name: String,
    },
    DependencyFailed,
    ConditionFalse,
    ApprovalRejected {
        gate: String,
    },
    Cancelled {
        cause: CancelCause,
    },
}

impl fmt::Display for JobReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobReason::Completed => write!(f, "Completed"),
            JobReason::StepFailed { step, exit_code } => match exit_code {
                Some(code) => write!(f, "StepFailed(step {}, exit code {})", step + 1, code),
                None => write!(f, "StepFailed(step {})", step + 1),
            },
            JobReason::Timeout => write!(f, "Timeout"),
            JobReason::RunnerLost => write!(f, "RunnerLost"),
            JobReason::SecretUnavailable { name } => write!(f, "SecretUnavailable({})", name),
            JobReason::DependencyFailed => write!(f, "DependencyFailed"),
            JobReason::ConditionFalse => write!(f, "ConditionFalse"),
            JobReason::ApprovalRejected { gate } => write!(f, "ApprovalRejected({})", gate),
            JobReason::Cancelled { cause } => write!(f, "{}", cause),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum CancelCause {
    UserRequested { by: Option<String> },
    CancelledByGroup { superseded_by: RunId },
    RunTimeout,
    FailFast { failed: JobKey },
}

impl CancelCause {
    /// Terminal run status produced by this cancellation.
    pub fn run_status(&self) -> RunStatus {
        match self {
            CancelCause::RunTimeout => RunStatus::Failed,
            _ => RunStatus::Cancelled,
        }
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::UserRequested { by: Some(by) } => write!(f, "CancelledBy({})", by),
            CancelCause::UserRequested { by: None } => write!(f, "Cancelled"),
            CancelCause::CancelledByGroup { superseded_by } => {
                write!(f, "CancelledByGroup({})", superseded_by)
            }
            CancelCause::RunTimeout => write!(f, "RunTimeout"),
            CancelCause::FailFast { failed } => write!(f, "FailFast({})", failed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepResult {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Final report a runner sends when a job finishes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobReport {
    pub run_id: RunId,
    pub job: JobKey,
    pub runner_id: RunnerId,
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}
