//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use conduit_core::workflow::EventKind;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate workflow definitions
    Validate {
        /// Definition files or directories
        #[arg(default_value = ".conduit/workflows")]
        paths: Vec<PathBuf>,
    },

    /// Show the job graph of a workflow
    Plan {
        /// Path to the definition file
        path: PathBuf,
    },

    /// List the workflows an event would start
    Match {
        /// Directory of workflow definitions
        #[arg(short, long, default_value = ".conduit/workflows")]
        dir: PathBuf,

        /// Event type
        #[arg(short, long, value_enum, default_value = "push")]
        event: EventArg,

        /// Git ref, e.g. refs/heads/main
        #[arg(short = 'r', long = "ref", default_value = "refs/heads/main")]
        git_ref: String,

        /// Target branch of a pull request
        #[arg(long)]
        base_ref: Option<String>,

        /// Activity type, e.g. opened
        #[arg(short, long)]
        action: Option<String>,

        /// Changed file paths
        #[arg(short, long = "path")]
        paths: Vec<String>,
    },

    /// Print the JSON schema of workflow definitions
    Schema {
        /// Print the event schema instead
        #[arg(long)]
        events: bool,
    },

    /// Run a workflow on local runners
    Run {
        /// Path to the definition file
        path: PathBuf,

        /// Event type
        #[arg(short, long, value_enum, default_value = "manual")]
        event: EventArg,

        /// Git ref, e.g. refs/heads/main
        #[arg(short = 'r', long = "ref", default_value = "refs/heads/main")]
        git_ref: String,

        /// Number of local runners
        #[arg(short = 'n', long, default_value_t = 2)]
        runners: usize,

        /// Runner labels (defaults to every label the workflow asks for)
        #[arg(short, long, value_delimiter = ',')]
        labels: Vec<String>,

        /// Approval gates to grant up front
        #[arg(long)]
        approve: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventArg {
    Push,
    PullRequest,
    Schedule,
    Release,
    Manual,
}

impl From<EventArg> for EventKind {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Push => EventKind::Push,
            EventArg::PullRequest => EventKind::PullRequest,
            EventArg::Schedule => EventKind::Schedule,
            EventArg::Release => EventKind::Release,
            EventArg::Manual => EventKind::Manual,
        }
    }
}
