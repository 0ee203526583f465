//! Runner registry.
//!
//! The single owner of runner state. Runners are kept in registration order,
//! which is also the order used for first-fit matching.

use chrono::{DateTime, Duration, Utc};
use conduit_core::runner::{Assignment, Runner, RunnerRegistration, RunnerStatus};
use conduit_core::{Error, Result, RunnerId};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

#[derive(Default)]
pub struct RunnerRegistry {
    runners: Vec<Runner>,
    draining: HashSet<RunnerId>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: RunnerRegistration, now: DateTime<Utc>) -> Runner {
        let runner = Runner {
            id: RunnerId::new(),
            name: registration.name,
            labels: registration.labels.into_iter().collect(),
            status: RunnerStatus::Idle,
            assignment: None,
            registered_at: now,
            last_heartbeat_at: now,
        };
        info!(runner_id = %runner.id, name = %runner.name, labels = ?runner.labels, "Runner registered");
        self.runners.push(runner.clone());
        runner
    }

    /// Remove a runner. The returned runner still carries its assignment.
    pub fn deregister(&mut self, id: RunnerId) -> Result<Runner> {
        let pos = self
            .runners
            .iter()
            .position(|r| r.id == id)
            .ok_or(Error::RunnerNotFound(id))?;
        self.draining.remove(&id);
        let runner = self.runners.remove(pos);
        info!(runner_id = %id, busy = runner.assignment.is_some(), "Runner deregistered");
        Ok(runner)
    }

    /// Record a heartbeat. An offline runner that reports again is idle.
    pub fn heartbeat(&mut self, id: RunnerId, now: DateTime<Utc>) -> Result<()> {
        let draining = self.draining.contains(&id);
        let runner = self.get_mut(id)?;
        runner.last_heartbeat_at = now;
        if runner.status == RunnerStatus::Offline {
            runner.status = if draining {
                RunnerStatus::Draining
            } else {
                RunnerStatus::Idle
            };
            info!(runner_id = %id, "Runner back online");
        }
        Ok(())
    }

    /// Stop handing new jobs to a runner. A busy runner finishes its job.
    pub fn drain(&mut self, id: RunnerId) -> Result<()> {
        let runner = self.get_mut(id)?;
        if runner.status == RunnerStatus::Idle {
            runner.status = RunnerStatus::Draining;
        }
        self.draining.insert(id);
        info!(runner_id = %id, "Runner draining");
        Ok(())
    }

    pub fn get(&self, id: RunnerId) -> Option<&Runner> {
        self.runners.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: RunnerId) -> Result<&mut Runner> {
        self.runners
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(Error::RunnerNotFound(id))
    }

    pub fn list(&self) -> &[Runner] {
        &self.runners
    }

    /// First idle runner, in registration order, advertising every label.
    pub fn find_eligible(&self, labels: &BTreeSet<String>) -> Option<RunnerId> {
        self.runners
            .iter()
            .find(|r| r.status.is_available() && r.satisfies(labels))
            .map(|r| r.id)
    }

    /// Whether any registered runner could ever take a job with `labels`.
    pub fn has_capable(&self, labels: &BTreeSet<String>) -> bool {
        self.runners
            .iter()
            .any(|r| r.status != RunnerStatus::Offline && r.satisfies(labels))
    }

    pub fn assign(&mut self, id: RunnerId, assignment: Assignment) -> Result<()> {
        let runner = self.get_mut(id)?;
        if !runner.status.is_available() {
            return Err(Error::InvalidTransition {
                job: assignment.job,
                from: format!("{:?}", runner.status),
                to: "Busy".to_string(),
            });
        }
        debug!(runner_id = %id, run_id = %assignment.run_id, job = %assignment.job, "Runner assigned");
        runner.status = RunnerStatus::Busy;
        runner.assignment = Some(assignment);
        Ok(())
    }

    /// Free a runner after its job ended. Returns the cleared assignment.
    pub fn release(&mut self, id: RunnerId) -> Option<Assignment> {
        let draining = self.draining.contains(&id);
        let runner = self.get_mut(id).ok()?;
        let assignment = runner.assignment.take();
        if runner.status == RunnerStatus::Busy {
            runner.status = if draining {
                RunnerStatus::Draining
            } else {
                RunnerStatus::Idle
            };
        }
        assignment
    }

    /// Take a runner out of rotation after a transport failure or missed
    /// heartbeats. Returns the assignment it was working on.
    pub fn mark_offline(&mut self, id: RunnerId) -> Option<Assignment> {
        let runner = self.get_mut(id).ok()?;
        if runner.status != RunnerStatus::Offline {
            warn!(runner_id = %id, "Runner offline");
        }
        runner.status = RunnerStatus::Offline;
        runner.assignment.take()
    }

    /// Runners whose last heartbeat is older than `threshold`.
    pub fn stale(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<RunnerId> {
        self.runners
            .iter()
            .filter(|r| r.status != RunnerStatus::Offline)
            .filter(|r| now - r.last_heartbeat_at > threshold)
            .map(|r| r.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{JobKey, RunId};

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn assignment(job: &str) -> Assignment {
        Assignment {
            run_id: RunId::new(),
            job: JobKey::new(job),
        }
    }

    #[test]
    fn test_find_by_labels() {
        let mut registry = RunnerRegistry::new();
        let now = Utc::now();
        registry.register(RunnerRegistration::new("linux-nix", ["linux", "nix"]), now);
        let docker = registry.register(RunnerRegistration::new("linux-docker", ["linux", "docker"]), now);

        assert_eq!(registry.find_eligible(&labels(&["linux", "docker"])), Some(docker.id));
        assert_eq!(registry.find_eligible(&labels(&["macos"])), None);
    }

    #[test]
    fn test_first_fit_in_registration_order() {
        let mut registry = RunnerRegistry::new();
        let now = Utc::now();
        let first = registry.register(RunnerRegistration::new("a", ["linux"]), now);
        let second = registry.register(RunnerRegistration::new("b", ["linux", "gpu"]), now);

        assert_eq!(registry.find_eligible(&labels(&["linux"])), Some(first.id));
        registry.assign(first.id, assignment("build")).unwrap();
        assert_eq!(registry.find_eligible(&labels(&["linux"])), Some(second.id));
    }

    #[test]
    fn test_assign_and_release() {
        let mut registry = RunnerRegistry::new();
        let runner = registry.register(RunnerRegistration::new("a", ["linux"]), Utc::now());

        registry.assign(runner.id, assignment("build")).unwrap();
        assert!(registry.assign(runner.id, assignment("test")).is_err());

        let released = registry.release(runner.id).unwrap();
        assert_eq!(released.job, JobKey::new("build"));
        assert_eq!(registry.get(runner.id).unwrap().status, RunnerStatus::Idle);
    }

    #[test]
    fn test_drain_busy_runner() {
        let mut registry = RunnerRegistry::new();
        let runner = registry.register(RunnerRegistration::new("a", ["linux"]), Utc::now());
        registry.assign(runner.id, assignment("build")).unwrap();

        registry.drain(runner.id).unwrap();
        assert_eq!(registry.get(runner.id).unwrap().status, RunnerStatus::Busy);

        registry.release(runner.id);
        assert_eq!(registry.get(runner.id).unwrap().status, RunnerStatus::Draining);
        assert_eq!(registry.find_eligible(&labels(&["linux"])), None);
    }

    #[test]
    fn test_stale_runners() {
        let mut registry = RunnerRegistry::new();
        let start = Utc::now();
        let quiet = registry.register(RunnerRegistration::new("quiet", ["linux"]), start);
        let chatty = registry.register(RunnerRegistration::new("chatty", ["linux"]), start);

        let later = start + Duration::seconds(120);
        registry.heartbeat(chatty.id, later).unwrap();

        assert_eq!(registry.stale(Duration::seconds(90), later), vec![quiet.id]);

        registry.mark_offline(quiet.id);
        assert!(registry.stale(Duration::seconds(90), later).is_empty());

        registry.heartbeat(quiet.id, later).unwrap();
        assert_eq!(registry.get(quiet.id).unwrap().status, RunnerStatus::Idle);
    }

    #[test]
    fn test_deregister_unknown() {
        let mut registry = RunnerRegistry::new();
        assert!(matches!(
            registry.deregister(RunnerId::new()),
            Err(Error::RunnerNotFound(_))
        ));
    }
}
