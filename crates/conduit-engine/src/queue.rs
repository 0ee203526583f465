//! Dispatch queue for ready jobs.

use crate::registry::RunnerRegistry;
use chrono::{DateTime, Utc};
use conduit_core::runner::Assignment;
use conduit_core::{JobKey, RunId, RunnerId};
use std::collections::{BTreeSet, VecDeque};

/// A job waiting for a runner.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub run_id: RunId,
    pub job: JobKey,
    pub labels: BTreeSet<String>,
    pub queued_at: DateTime<Utc>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.run_id == other.run_id && self.job == other.job
    }
}

impl Eq for QueuedJob {}

/// FIFO queue of jobs awaiting a runner.
///
/// An entry nobody can take stays put without blocking the entries behind
/// it.
#[derive(Default)]
pub struct DispatchQueue {
    entries: VecDeque<QueuedJob>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job to the queue. Returns false if it is already queued.
    pub fn enqueue(&mut self, job: QueuedJob) -> bool {
        if self.entries.contains(&job) {
            return false;
        }
        self.entries.push_back(job);
        true
    }

    pub fn remove(&mut self, run_id: RunId, job: &JobKey) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.run_id == run_id && entry.job == *job));
        self.entries.len() != before
    }

    /// Drop every entry of a run.
    pub fn remove_run(&mut self, run_id: RunId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.run_id != run_id);
        before - self.entries.len()
    }

    /// Pair queued jobs with idle runners, first-fit, in queue order. Matched
    /// runners are marked busy and the entries leave the queue.
    pub fn take_dispatchable(&mut self, registry: &mut RunnerRegistry) -> Vec<(QueuedJob, RunnerId)> {
        let mut matched = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.entries.len());

        while let Some(entry) = self.entries.pop_front() {
            let assigned = registry.find_eligible(&entry.labels).and_then(|runner| {
                registry
                    .assign(
                        runner,
                        Assignment {
                            run_id: entry.run_id,
                            job: entry.job.clone(),
                        },
                    )
                    .ok()
                    .map(|_| runner)
            });
            match assigned {
                Some(runner) => matched.push((entry, runner)),
                None => remaining.push_back(entry),
            }
        }

        self.entries = remaining;
        matched
    }

    /// Get the position of a job in the queue.
    pub fn position(&self, run_id: RunId, job: &JobKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.run_id == run_id && entry.job == *job)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedJob> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
