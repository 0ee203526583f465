//! Workflow definition types.
//!
//! These types represent the user-authored workflow YAML. They are immutable
//! once loaded; the engine works on validated, expanded copies.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,
    /// Upper bound for the whole run.
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    /// Default permissions for jobs that do not declare their own.
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionLevel>,
    pub jobs: Vec<JobDefinition>,
}

impl WorkflowDefinition {
    pub fn job(&self, id: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Cron expressions of all schedule triggers.
    pub fn schedules(&self) -> impl Iterator<Item = &str> {
        self.triggers
            .iter()
            .filter(|t| t.kind == EventKind::Schedule)
            .filter_map(|t| t.cron.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub paths_ignore: Vec<String>,
    /// Event actions to accept, e.g. `opened` or `published`.
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub cron: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Schedule,
    Release,
    Manual,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::Schedule => "schedule",
            EventKind::Release => "release",
            EventKind::Manual => "manual",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            "schedule" => Ok(EventKind::Schedule),
            "release" => Ok(EventKind::Release),
            "manual" => Ok(EventKind::Manual),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Labels a runner must advertise to take this job.
    #[serde(default)]
    pub runs_on: Vec<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(rename = "if", default)]
    pub condition: Option<String>,
    pub steps: Vec<StepDefinition>,
    #[serde(default = "default_job_timeout")]
    pub timeout_minutes: u32,
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionLevel>,
    /// A failing optional job does not fail the run and does not block dependents.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Secret names resolved at dispatch time.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Manual approval gate that must be granted before the job is queued.
    #[serde(default)]
    pub approval: Option<String>,
    /// Job outputs, usually `${{ steps.<id>.outputs.<name> }}` templates.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

fn default_job_timeout() -> u32 {
    360
}

impl JobDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn labels(&self) -> BTreeSet<String> {
        self.runs_on.iter().cloned().collect()
    }

    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.timeout_minutes))
    }

    /// Whether a retry policy allows another attempt after `cause`.
    pub fn retries_on(&self, cause: RetryOn, attempt: u32) -> bool {
        self.retry
            .as_ref()
            .is_some_and(|r| attempt < r.max_attempts && r.on.contains(&cause))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Action reference, e.g. `actions/checkout@v4`.
    #[serde(default)]
    pub uses: Option<String>,
    /// Inline shell command.
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub with: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl StepDefinition {
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .or_else(|| self.id.clone())
            .or_else(|| self.uses.clone())
            .unwrap_or_else(|| format!("step-{}", index + 1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_on")]
    pub on: Vec<RetryOn>,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_on() -> Vec<RetryOn> {
    vec![RetryOn::RunnerLost]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    RunnerLost,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyConfig {
    /// Group template; defaults to `<workflow>-<ref>`. May contain `${{ }}`.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub cancel_in_progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub include: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    None,
    Read,
    Write,
}
