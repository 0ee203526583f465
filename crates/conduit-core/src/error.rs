//! Error types for Conduit.

use crate::ids::{JobKey, RunId, RunnerId};
use thiserror::Error;

/// Reasons a workflow definition is rejected at load time.
///
/// A definition that fails with any of these never produces a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Failed to parse workflow: {0}")]
    Parse(String),

    #[error("Workflow {0} defines no jobs")]
    EmptyWorkflow(String),

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("Duplicate workflow name: {0}")]
    DuplicateWorkflow(String),

    #[error("Job {job} depends on unknown job {dependency}")]
    UnknownDependency { job: String, dependency: String },

    #[error("Cycle detected in job dependencies: {}", .jobs.join(" -> "))]
    CycleDetected { jobs: Vec<String> },

    #[error("Job {job} step {step}: {message}")]
    InvalidStep {
        job: String,
        step: usize,
        message: String,
    },

    #[error("Job {job} has no steps")]
    NoSteps { job: String },

    #[error("Invalid expression in {location}: {message}")]
    InvalidExpression { location: String, message: String },

    #[error("Invalid cron expression {expression:?}: {message}")]
    InvalidCron { expression: String, message: String },

    #[error("Invalid matrix for job {job}: {message}")]
    InvalidMatrix { job: String, message: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run already completed: {0}")]
    RunAlreadyCompleted(RunId),

    #[error("Job {job} not found in run {run_id}")]
    JobNotFound { run_id: RunId, job: JobKey },

    #[error("Invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        job: JobKey,
        from: String,
        to: String,
    },

    #[error("Job {job} is not ready: {reason}")]
    DependencyNotSatisfied { job: JobKey, reason: String },

    // Runner errors
    #[error("Runner not found: {0}")]
    RunnerNotFound(RunnerId),

    #[error("No eligible runner for labels: {0:?}")]
    NoEligibleRunner(Vec<String>),

    #[error("Runner transport error: {0}")]
    Transport(String),

    // Secret errors
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret provider error: {0}")]
    SecretProvider(String),

    // Infrastructure errors
    #[error("Event sink error: {0}")]
    EventSink(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
