//! Concurrency groups.
//!
//! At most one run per group is active. A new run either waits its turn or,
//! with cancel-in-progress, supersedes the active run and every waiting one.

use conduit_core::RunId;
use conduit_core::expr::{ExprContext, interpolate};
use conduit_core::trigger::RepoEvent;
use conduit_core::workflow::WorkflowDefinition;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The group was free; the run may start.
    Admitted,
    /// The run may start; these older runs must be cancelled.
    Supersede(Vec<RunId>),
    /// The run waits until the group frees up.
    Queued,
}

#[derive(Debug, Default)]
struct Group {
    active: Option<RunId>,
    waiting: VecDeque<RunId>,
}

#[derive(Default)]
pub struct ConcurrencyManager {
    groups: HashMap<String, Group>,
}

impl ConcurrencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<workflow>-<ref>`, or the workflow's interpolated `group` template.
    pub fn key_for(definition: &WorkflowDefinition, event: &RepoEvent) -> String {
        let default = format!("{}-{}", definition.name, event.git_ref);
        let Some(template) = definition.concurrency.as_ref().and_then(|c| c.group.as_deref())
        else {
            return default;
        };

        let ctx = ExprContext::new(event).with_env(&definition.env);
        match interpolate(template, &ctx) {
            Ok(key) if !key.trim().is_empty() => key,
            Ok(_) => default,
            Err(e) => {
                warn!(workflow = %definition.name, error = %e, "Invalid concurrency group, using default");
                default
            }
        }
    }

    pub fn admit(&mut self, key: &str, run: RunId, cancel_in_progress: bool) -> Admission {
        let group = self.groups.entry(key.to_string()).or_default();

        let Some(active) = group.active else {
            group.active = Some(run);
            debug!(group = key, run_id = %run, "Run admitted");
            return Admission::Admitted;
        };

        if cancel_in_progress {
            let mut superseded = vec![active];
            superseded.extend(group.waiting.drain(..));
            group.active = Some(run);
            debug!(group = key, run_id = %run, superseded = superseded.len(), "Run supersedes group");
            return Admission::Supersede(superseded);
        }

        group.waiting.push_back(run);
        debug!(group = key, run_id = %run, position = group.waiting.len(), "Run waiting for group");
        Admission::Queued
    }

    /// Free the group slot held by `run`, or drop it from the wait list.
    /// Returns the waiting run that now holds the slot.
    pub fn release(&mut self, key: &str, run: RunId) -> Option<RunId> {
        let group = self.groups.get_mut(key)?;

        let next = if group.active == Some(run) {
            group.active = group.waiting.pop_front();
            group.active
        } else {
            group.waiting.retain(|id| *id != run);
            None
        };

        if group.active.is_none() && group.waiting.is_empty() {
            self.groups.remove(key);
        }
        next
    }

    pub fn active(&self, key: &str) -> Option<RunId> {
        self.groups.get(key).and_then(|g| g.active)
    }

    pub fn waiting(&self, key: &str) -> Vec<RunId> {
        self.groups
            .get(key)
            .map(|g| g.waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
