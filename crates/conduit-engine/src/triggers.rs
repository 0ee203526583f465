//! Trigger matching and schedule evaluation.

use crate::store::WorkflowStore;
use chrono::{DateTime, Utc};
use conduit_core::trigger::RepoEvent;
use conduit_core::workflow::{EventKind, TriggerConfig, WorkflowDefinition};
use cron::Schedule;
use std::str::FromStr;
use tracing::{debug, warn};

/// Matcher for determining if a workflow should be triggered.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if a workflow should be triggered by an event.
    pub fn matches(&self, workflow: &WorkflowDefinition, event: &RepoEvent) -> bool {
        if workflow.triggers.is_empty() {
            // Default: trigger on push to any branch
            return event.kind == EventKind::Push && event.tag().is_none();
        }

        workflow
            .triggers
            .iter()
            .any(|trigger| self.trigger_matches(trigger, event))
    }

    /// Names of all workflows in `store` matching `event`.
    pub fn matching(&self, store: &WorkflowStore, event: &RepoEvent) -> Vec<String> {
        let names: Vec<String> = store
            .iter()
            .filter(|w| self.matches(&w.definition, event))
            .map(|w| w.definition.name.clone())
            .collect();
        if names.is_empty() {
            debug!(kind = %event.kind, git_ref = %event.git_ref, "No workflow matches event");
        }
        names
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, event: &RepoEvent) -> bool {
        if trigger.kind != event.kind {
            return false;
        }

        match event.kind {
            EventKind::Push => {
                let refs_match = match event.tag() {
                    Some(tag) => self.tag_matches(&trigger.tags, tag),
                    None => {
                        // A tags-only trigger ignores branch pushes
                        let tags_only = !trigger.tags.is_empty()
                            && trigger.branches.is_empty()
                            && trigger.branches_ignore.is_empty();
                        !tags_only
                            && self.branch_matches(
                                &trigger.branches,
                                &trigger.branches_ignore,
                                event.ref_name(),
                            )
                    }
                };
                refs_match
                    && self.paths_match(&trigger.paths, &trigger.paths_ignore, &event.paths_changed)
            }
            EventKind::PullRequest => {
                let target = event.base_branch().unwrap_or_else(|| event.ref_name());
                self.types_match(&trigger.types, event.action.as_deref())
                    && self.branch_matches(&trigger.branches, &trigger.branches_ignore, target)
                    && self.paths_match(&trigger.paths, &trigger.paths_ignore, &event.paths_changed)
            }
            EventKind::Release => {
                let tag_ok = trigger.tags.is_empty()
                    || event
                        .tag()
                        .is_some_and(|tag| self.tag_matches(&trigger.tags, tag));
                tag_ok && self.types_match(&trigger.types, event.action.as_deref())
            }
            EventKind::Manual => {
                self.branch_matches(&trigger.branches, &trigger.branches_ignore, event.ref_name())
            }
            // Schedules fire from the cron poller, never from event arrival
            EventKind::Schedule => false,
        }
    }

    fn branch_matches(&self, patterns: &[String], ignore: &[String], branch: &str) -> bool {
        if ignore.iter().any(|p| glob(p, branch)) {
            return false;
        }
        if patterns.is_empty() {
            return true; // Match all branches if no patterns specified
        }
        filter_matches(patterns, branch)
    }

    fn tag_matches(&self, patterns: &[String], tag: &str) -> bool {
        if patterns.is_empty() {
            return false; // Don't match tags unless explicitly specified
        }
        filter_matches(patterns, tag)
    }

    fn types_match(&self, types: &[String], action: Option<&str>) -> bool {
        types.is_empty() || action.is_some_and(|a| types.iter().any(|t| t == a))
    }

    fn paths_match(&self, include: &[String], exclude: &[String], changed: &[String]) -> bool {
        if (include.is_empty() && exclude.is_empty()) || changed.is_empty() {
            return true; // No path filtering, or nothing known about the change
        }

        let included = include.is_empty() || changed.iter().any(|path| filter_matches(include, path));

        let excluded = !exclude.is_empty()
            && changed
                .iter()
                .all(|path| exclude.iter().any(|p| glob(p, path)));

        included && !excluded
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a pattern list where `!pattern` negates and the last matching
/// pattern decides.
fn filter_matches(patterns: &[String], text: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(negated) if glob(negated, text) => matched = false,
            Some(_) => {}
            None if glob(pattern, text) => matched = true,
            None => {}
        }
    }
    matched
}

fn glob(pattern: &str, text: &str) -> bool {
    glob_match::glob_match(pattern, text)
}

/// Parse a cron expression. Five-field POSIX expressions get a leading
/// seconds field.
pub fn parse_schedule(expression: &str) -> Result<Schedule, cron::error::Error> {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {}", expression))
    } else {
        Schedule::from_str(expression)
    }
}

/// A schedule that came due.
#[derive(Debug, Clone, PartialEq)]
pub struct CronFire {
    pub workflow: String,
    pub expression: String,
    pub scheduled_at: DateTime<Utc>,
}

struct CronEntry {
    workflow: String,
    expression: String,
    schedule: Schedule,
}

/// Time-based trigger evaluation for `schedule` triggers (UTC).
pub struct CronPoller {
    entries: Vec<CronEntry>,
    last_tick: Option<DateTime<Utc>>,
}

impl CronPoller {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_tick: None,
        }
    }

    /// Start evaluating from `start` instead of the first tick.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            entries: Vec::new(),
            last_tick: Some(start),
        }
    }

    /// Re-register the schedules of every loaded workflow.
    pub fn rebuild(&mut self, store: &WorkflowStore) {
        self.entries.clear();
        for workflow in store.iter() {
            for expression in workflow.definition.schedules() {
                match parse_schedule(expression) {
                    Ok(schedule) => self.entries.push(CronEntry {
                        workflow: workflow.definition.name.clone(),
                        expression: expression.to_string(),
                        schedule,
                    }),
                    Err(e) => {
                        warn!(workflow = %workflow.definition.name, expression, error = %e, "Skipping schedule")
                    }
                }
            }
        }
    }

    /// Schedules whose next fire time fell in `(last tick, now]`. Several
    /// missed fire times of one schedule collapse into a single fire.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<CronFire> {
        let Some(last) = self.last_tick else {
            self.last_tick = Some(now);
            return Vec::new();
        };
        if now <= last {
            return Vec::new();
        }
        self.last_tick = Some(now);

        self.entries
            .iter()
            .filter_map(|entry| {
                let next = entry.schedule.after(&last).next()?;
                (next <= now).then(|| CronFire {
                    workflow: entry.workflow.clone(),
                    expression: entry.expression.clone(),
                    scheduled_at: next,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CronPoller {
    fn default() -> Self {
        Self::new()
    }
}
