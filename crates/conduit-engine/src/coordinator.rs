//! Per-run job lifecycle.
//!
//! `RunState` owns one run and decides every job transition. It never does
//! I/O itself: each operation returns the [`Effect`]s the engine must carry
//! out (queue changes, runner signals, events).

use crate::dag::{BlockReason, JobGraph, JobNode, Readiness, RunView, aggregate_needs};
use chrono::{DateTime, Duration, Utc};
use conduit_core::events::{
    ApprovalRequestedPayload, Event, JobCompletedPayload, JobQueuedPayload, JobRetriedPayload,
    JobStartedPayload, RunCancelledPayload, RunCompletedPayload, RunQueuedPayload,
    RunStartedPayload, StepCompletedPayload,
};
use conduit_core::expr::{ExprContext, NeedResult, interpolate};
use conduit_core::ports::{DispatchRequest, DispatchStep};
use conduit_core::run::{
    CancelCause, JobExecution, JobReason, JobReport, JobStatus, Run, RunStatus, StepResult,
    StepStatus,
};
use conduit_core::secrets::SecretValue;
use conduit_core::trigger::RepoEvent;
use conduit_core::workflow::{PermissionLevel, RetryOn, WorkflowDefinition};
use conduit_core::{DefinitionError, DispatchId, Error, JobKey, Result, RunId, RunnerId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Side effect requested by a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Put a job on the dispatch queue.
    Enqueue { job: JobKey, labels: BTreeSet<String> },
    /// Drop a job from the dispatch queue.
    Dequeue { job: JobKey },
    /// Ask a runner to stop a job.
    SignalCancel { runner: RunnerId, job: JobKey },
    /// Free a runner if it still holds `job`.
    ReleaseRunner { runner: RunnerId, job: JobKey },
    Emit(Event),
    /// Every job is terminal; the run is over.
    Finished { status: RunStatus },
}

/// Live state of one run.
pub struct RunState {
    run: Run,
    definition: Arc<WorkflowDefinition>,
    graph: Arc<JobGraph>,
    approvals: BTreeSet<String>,
    rejections: BTreeSet<String>,
    requested_approvals: BTreeSet<String>,
    cancel_causes: BTreeMap<JobKey, CancelCause>,
    /// Runners told to stop a timed-out attempt, held until they confirm.
    stopping: BTreeMap<(JobKey, RunnerId), DateTime<Utc>>,
}

impl RunState {
    pub fn new(
        id: RunId,
        run_number: u32,
        definition: Arc<WorkflowDefinition>,
        graph: Arc<JobGraph>,
        event: RepoEvent,
        concurrency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let jobs = graph
            .nodes()
            .map(|node| {
                (
                    node.key.clone(),
                    JobExecution {
                        key: node.key.clone(),
                        job_id: node.job_id.clone(),
                        display_name: node.display_name.clone(),
                        status: JobStatus::Pending,
                        reason: None,
                        required: node.is_required(),
                        runner_id: None,
                        attempt: 1,
                        matrix: node.matrix.clone(),
                        steps: Vec::new(),
                        outputs: BTreeMap::new(),
                        cancel_requested_at: None,
                        queued_at: None,
                        started_at: None,
                        completed_at: None,
                    },
                )
            })
            .collect();

        let run = Run {
            id,
            workflow: definition.name.clone(),
            run_number,
            status: RunStatus::Pending,
            event,
            concurrency_key,
            cancel_cause: None,
            jobs,
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        Self {
            run,
            definition,
            graph,
            approvals: BTreeSet::new(),
            rejections: BTreeSet::new(),
            requested_approvals: BTreeSet::new(),
            cancel_causes: BTreeMap::new(),
            stopping: BTreeMap::new(),
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn id(&self) -> RunId {
        self.run.id
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// True once `Finished` has been produced.
    pub fn is_finished(&self) -> bool {
        self.run.completed_at.is_some()
    }

    /// Whether a runner is still stopping a timed-out job of this run.
    pub fn holds_runners(&self) -> bool {
        !self.stopping.is_empty()
    }

    /// Release runners stopping `key`, all of them or just `runner`.
    fn release_stopping(&mut self, key: &JobKey, runner: Option<RunnerId>) -> Vec<Effect> {
        let held: Vec<(JobKey, RunnerId)> = self
            .stopping
            .keys()
            .filter(|(job, r)| job == key && runner.is_none_or(|wanted| wanted == *r))
            .cloned()
            .collect();
        held.into_iter()
            .map(|(job, runner)| {
                self.stopping.remove(&(job.clone(), runner));
                debug!(run_id = %self.run.id, job = %job, runner_id = %runner, "Runner stopped");
                Effect::ReleaseRunner { runner, job }
            })
            .collect()
    }

    /// Approval gates requested and not yet decided.
    pub fn pending_approvals(&self) -> Vec<String> {
        self.requested_approvals
            .iter()
            .filter(|gate| !self.approvals.contains(*gate) && !self.rejections.contains(*gate))
            .cloned()
            .collect()
    }

    /// Deadline from the workflow-level timeout, once the run has started.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let minutes = self.definition.timeout_minutes?;
        Some(self.run.started_at? + Duration::minutes(i64::from(minutes)))
    }

    pub fn queued_event(&self, waiting_for_group: bool) -> Event {
        Event::RunQueued(RunQueuedPayload {
            run_id: self.run.id,
            workflow: self.run.workflow.clone(),
            run_number: self.run.run_number,
            trigger: self.run.event.kind,
            git_ref: self.run.event.git_ref.clone(),
            concurrency_key: self.run.concurrency_key.clone(),
            waiting_for_group,
            queued_at: self.run.created_at,
        })
    }

    /// Move a pending run to running and queue its root jobs.
    pub fn start(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if self.run.status != RunStatus::Pending {
            return Vec::new();
        }
        self.run.status = RunStatus::Running;
        self.run.started_at = Some(now);
        info!(run_id = %self.run.id, workflow = %self.run.workflow, jobs = self.run.jobs.len(), "Run started");

        let mut effects = vec![Effect::Emit(Event::RunStarted(RunStartedPayload {
            run_id: self.run.id,
            workflow: self.run.workflow.clone(),
            run_number: self.run.run_number,
            job_count: self.run.jobs.len() as u32,
            started_at: now,
        }))];
        effects.extend(self.evaluate(now));
        effects
    }

    fn view(&self) -> RunView<'_> {
        RunView {
            event: &self.run.event,
            env: &self.definition.env,
            jobs: &self.run.jobs,
            approvals: &self.approvals,
            rejections: &self.rejections,
            cancelled: self.run.cancel_cause.is_some(),
        }
    }

    fn status_of(&self, key: &JobKey) -> Option<JobStatus> {
        self.run.jobs.get(key).map(|exec| exec.status)
    }

    /// Re-check every pending job. Safe to call at any time; unchanged state
    /// produces no effects.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.run.status == RunStatus::Running {
            let graph = Arc::clone(&self.graph);
            for node in graph.nodes() {
                if self.status_of(&node.key) != Some(JobStatus::Pending) {
                    continue;
                }
                match graph.readiness(&node.key, &self.view()) {
                    Readiness::Ready => self.queue_job(node, now, &mut effects),
                    Readiness::Skip(reason) => {
                        self.finish_job(&node.key, JobStatus::Skipped, reason, now, &mut effects)
                    }
                    Readiness::Blocked(BlockReason::Approval(gate)) => {
                        if self.requested_approvals.insert(gate.clone()) {
                            info!(run_id = %self.run.id, job = %node.key, gate = %gate, "Approval requested");
                            effects.push(Effect::Emit(Event::ApprovalRequested(
                                ApprovalRequestedPayload {
                                    run_id: self.run.id,
                                    job: node.key.clone(),
                                    gate,
                                    requested_at: now,
                                },
                            )));
                        }
                    }
                    Readiness::Blocked(_) => {}
                }
            }
        }

        effects.extend(self.check_completion(now));
        effects
    }

    fn queue_job(&mut self, node: &JobNode, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        let run_id = self.run.id;
        let Some(exec) = self.run.jobs.get_mut(&node.key) else {
            return;
        };
        exec.status = JobStatus::Queued;
        exec.queued_at = Some(now);
        debug!(run_id = %run_id, job = %node.key, attempt = exec.attempt, "Job queued");

        effects.push(Effect::Emit(Event::JobQueued(JobQueuedPayload {
            run_id,
            job: node.key.clone(),
            labels: node.labels.iter().cloned().collect(),
            attempt: exec.attempt,
            queued_at: now,
        })));
        effects.push(Effect::Enqueue {
            job: node.key.clone(),
            labels: node.labels.clone(),
        });
    }

    fn finish_job(
        &mut self,
        key: &JobKey,
        status: JobStatus,
        reason: JobReason,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let run_id = self.run.id;
        let Some(exec) = self.run.jobs.get_mut(key) else {
            return;
        };
        if exec.is_terminal() {
            return;
        }

        exec.status = status;
        exec.reason = Some(reason.clone());
        exec.cancel_requested_at = None;
        exec.completed_at = Some(now);
        let duration_ms = exec
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);

        if let Some(runner) = exec.runner_id
            && exec.started_at.is_some()
            && !self.stopping.contains_key(&(key.clone(), runner))
        {
            effects.push(Effect::ReleaseRunner {
                runner,
                job: key.clone(),
            });
        }

        info!(run_id = %run_id, job = %key, status = %status, reason = %reason, "Job finished");
        effects.push(Effect::Emit(Event::JobCompleted(JobCompletedPayload {
            run_id,
            job: key.clone(),
            status,
            reason,
            duration_ms,
            completed_at: now,
        })));
    }

    /// Stop a job that has not finished. Pending and queued jobs end at
    /// once; running jobs get a cooperative cancel request.
    fn cancel_job(
        &mut self,
        key: &JobKey,
        cause: CancelCause,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(status) = self.status_of(key) else {
            return;
        };
        match status {
            JobStatus::Pending => {
                self.finish_job(key, JobStatus::Cancelled, JobReason::Cancelled { cause }, now, effects);
            }
            JobStatus::Queued => {
                effects.push(Effect::Dequeue { job: key.clone() });
                self.finish_job(key, JobStatus::Cancelled, JobReason::Cancelled { cause }, now, effects);
            }
            JobStatus::Running => {
                let run_id = self.run.id;
                let Some(exec) = self.run.jobs.get_mut(key) else {
                    return;
                };
                if exec.cancel_requested_at.is_some() {
                    return;
                }
                exec.cancel_requested_at = Some(now);
                if let Some(runner) = exec.runner_id {
                    effects.push(Effect::SignalCancel {
                        runner,
                        job: key.clone(),
                    });
                }
                debug!(run_id = %run_id, job = %key, cause = %cause, "Cancel requested");
                self.cancel_causes.insert(key.clone(), cause);
            }
            _ => {}
        }
    }

    fn take_cancel_cause(&mut self, key: &JobKey) -> CancelCause {
        self.cancel_causes
            .remove(key)
            .or_else(|| self.run.cancel_cause.clone())
            .unwrap_or(CancelCause::UserRequested { by: None })
    }

    /// A runner picked up a queued job.
    pub fn mark_dispatched(
        &mut self,
        key: &JobKey,
        runner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        if self.is_finished() {
            return Err(Error::RunAlreadyCompleted(self.run.id));
        }
        let status = self.status_of(key).ok_or_else(|| Error::JobNotFound {
            run_id: self.run.id,
            job: key.clone(),
        })?;
        if status != JobStatus::Queued {
            return Err(Error::InvalidTransition {
                job: key.clone(),
                from: status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }

        if let Some(node) = self.graph.node(key) {
            let tolerant = node.condition.tolerates_failure();
            for dep in self.graph.dependencies(key) {
                let dep_status = self.status_of(&dep.key).unwrap_or(JobStatus::Pending);
                let satisfied = dep_status == JobStatus::Succeeded
                    || (dep_status == JobStatus::Failed && !dep.is_required());
                if !dep_status.is_terminal() || !(satisfied || tolerant) {
                    return Err(Error::DependencyNotSatisfied {
                        job: key.clone(),
                        reason: format!("{} is {}", dep.key, dep_status),
                    });
                }
            }
        }

        let run_id = self.run.id;
        let Some(exec) = self.run.jobs.get_mut(key) else {
            return Ok(Vec::new());
        };
        exec.status = JobStatus::Running;
        exec.runner_id = Some(runner);
        exec.started_at = Some(now);
        info!(run_id = %run_id, job = %key, runner_id = %runner, attempt = exec.attempt, "Job started");

        Ok(vec![Effect::Emit(Event::JobStarted(JobStartedPayload {
            run_id,
            job: key.clone(),
            runner_id: runner,
            attempt: exec.attempt,
            started_at: now,
        }))])
    }

    /// Everything needed to build the dispatch request for a queued job.
    pub fn dispatch_plan(&self, key: &JobKey) -> Result<DispatchPlan> {
        let (Some(node), Some(exec)) = (self.graph.node(key), self.run.jobs.get(key)) else {
            return Err(Error::JobNotFound {
                run_id: self.run.id,
                job: key.clone(),
            });
        };
        let permissions = if node.definition.permissions.is_empty() {
            self.definition.permissions.clone()
        } else {
            node.definition.permissions.clone()
        };

        Ok(DispatchPlan {
            run_id: self.run.id,
            job: key.clone(),
            attempt: exec.attempt,
            node: node.clone(),
            event: self.run.event.clone(),
            workflow_env: self.definition.env.clone(),
            permissions,
            needs: aggregate_needs(&self.graph.dependencies(key), &self.run.jobs),
        })
    }

    /// Record a finished step of a running job.
    pub fn record_step(&mut self, key: &JobKey, step: StepResult) -> Result<Vec<Effect>> {
        let run_id = self.run.id;
        let exec = self.run.jobs.get_mut(key).ok_or_else(|| Error::JobNotFound {
            run_id,
            job: key.clone(),
        })?;
        if exec.status != JobStatus::Running {
            debug!(run_id = %run_id, job = %key, step = step.index, "Ignoring step for job that is not running");
            return Ok(Vec::new());
        }

        let event = Event::StepCompleted(StepCompletedPayload {
            run_id,
            job: key.clone(),
            index: step.index,
            name: step.name.clone(),
            status: step.status,
            exit_code: step.exit_code,
            completed_at: step.completed_at.unwrap_or_else(Utc::now),
        });
        match exec.steps.iter_mut().find(|s| s.index == step.index) {
            Some(existing) => *existing = step,
            None => {
                exec.steps.push(step);
                exec.steps.sort_by_key(|s| s.index);
            }
        }
        Ok(vec![Effect::Emit(event)])
    }

    /// Apply a runner's final report.
    ///
    /// Reports for finished jobs, or from a runner that no longer holds the
    /// job, are ignored.
    pub fn complete_job(&mut self, report: JobReport, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        let key = report.job.clone();
        let exec = self.run.jobs.get(&key).ok_or_else(|| Error::JobNotFound {
            run_id: self.run.id,
            job: key.clone(),
        })?;
        let stale = exec.is_terminal()
            || exec.status != JobStatus::Running
            || exec.runner_id != Some(report.runner_id);
        if stale && self.stopping.contains_key(&(key.clone(), report.runner_id)) {
            return Ok(self.release_stopping(&key, Some(report.runner_id)));
        }
        if exec.is_terminal() {
            warn!(run_id = %self.run.id, job = %key, "Ignoring report for finished job");
            return Ok(Vec::new());
        }
        if exec.status != JobStatus::Running || exec.runner_id != Some(report.runner_id) {
            warn!(run_id = %self.run.id, job = %key, runner_id = %report.runner_id, "Ignoring report from runner not assigned to job");
            return Ok(Vec::new());
        }
        let cancelling = exec.cancel_requested_at.is_some();

        let mut effects = Vec::new();

        if cancelling {
            let cause = self.take_cancel_cause(&key);
            if let Some(exec) = self.run.jobs.get_mut(&key) {
                exec.steps = report.steps;
            }
            self.finish_job(&key, JobStatus::Cancelled, JobReason::Cancelled { cause }, now, &mut effects);
            effects.extend(self.evaluate(now));
            return Ok(effects);
        }

        let graph = Arc::clone(&self.graph);
        let Some(node) = graph.node(&key) else {
            return Ok(effects);
        };

        let failed_step = report.steps.iter().find(|step| {
            step.status == StepStatus::Failed
                && !node
                    .definition
                    .steps
                    .get(step.index)
                    .is_some_and(|def| def.continue_on_error)
        });
        let (status, reason) = match failed_step {
            Some(step) => (
                JobStatus::Failed,
                JobReason::StepFailed {
                    step: step.index,
                    exit_code: step.exit_code,
                },
            ),
            None => (JobStatus::Succeeded, JobReason::Completed),
        };

        let outputs = self.job_outputs(node, &report);
        if let Some(exec) = self.run.jobs.get_mut(&key) {
            exec.steps = report.steps;
            exec.outputs = outputs;
        }
        self.finish_job(&key, status, reason, now, &mut effects);

        if status == JobStatus::Failed {
            self.fail_fast(node, now, &mut effects);
        }
        effects.extend(self.evaluate(now));
        Ok(effects)
    }

    /// Reported outputs plus the job's declared outputs, rendered against
    /// the step outputs of this report.
    fn job_outputs(&self, node: &JobNode, report: &JobReport) -> BTreeMap<String, String> {
        let mut outputs = report.outputs.clone();
        if node.definition.outputs.is_empty() {
            return outputs;
        }

        let steps: BTreeMap<String, BTreeMap<String, String>> = report
            .steps
            .iter()
            .filter_map(|step| {
                let id = node.definition.steps.get(step.index)?.id.clone()?;
                Some((id, step.outputs.clone()))
            })
            .collect();
        let ctx = ExprContext::new(&self.run.event)
            .with_env(&self.definition.env)
            .with_env(&node.definition.env)
            .with_matrix(&node.matrix)
            .with_steps(&steps);

        for (name, template) in &node.definition.outputs {
            match interpolate(template, &ctx) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(e) => {
                    warn!(run_id = %self.run.id, job = %node.key, output = %name, error = %e, "Failed to render job output")
                }
            }
        }
        outputs
    }

    fn fail_fast(&mut self, node: &JobNode, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        if !node.is_required() || !node.fail_fast() {
            return;
        }
        let graph = Arc::clone(&self.graph);
        for sibling in graph.siblings(&node.key) {
            self.cancel_job(
                &sibling.key,
                CancelCause::FailFast {
                    failed: node.key.clone(),
                },
                now,
                effects,
            );
        }
    }

    /// End a job for a reason the runner did not report: timeout, lost
    /// runner or an unresolvable secret. Retries when the job's policy
    /// allows it.
    pub fn fail_job(
        &mut self,
        key: &JobKey,
        reason: JobReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        let run_id = self.run.id;
        let running = self.run.status == RunStatus::Running;
        let graph = Arc::clone(&self.graph);
        let exec = self.run.jobs.get_mut(key).ok_or_else(|| Error::JobNotFound {
            run_id,
            job: key.clone(),
        })?;
        if exec.is_terminal() {
            return Ok(Vec::new());
        }

        let mut effects = Vec::new();
        let runner = exec.runner_id.filter(|_| exec.started_at.is_some());
        if reason == JobReason::Timeout
            && let Some(runner) = runner
        {
            effects.push(Effect::SignalCancel {
                runner,
                job: key.clone(),
            });
            self.stopping.insert((key.clone(), runner), now);
        }

        let retry_on = match reason {
            JobReason::Timeout => Some(RetryOn::Timeout),
            JobReason::RunnerLost => Some(RetryOn::RunnerLost),
            _ => None,
        };
        let retry = running
            && exec.cancel_requested_at.is_none()
            && retry_on.is_some_and(|on| {
                graph
                    .node(key)
                    .is_some_and(|node| node.definition.retries_on(on, exec.attempt))
            });

        if retry {
            if let Some(runner) = runner
                && !self.stopping.contains_key(&(key.clone(), runner))
            {
                effects.push(Effect::ReleaseRunner {
                    runner,
                    job: key.clone(),
                });
            }
            exec.attempt += 1;
            exec.runner_id = None;
            exec.steps.clear();
            exec.outputs.clear();
            exec.started_at = None;
            exec.status = JobStatus::Pending;
            info!(run_id = %run_id, job = %key, reason = %reason, attempt = exec.attempt, "Retrying job");
            effects.push(Effect::Emit(Event::JobRetried(JobRetriedPayload {
                run_id,
                job: key.clone(),
                reason,
                attempt: exec.attempt,
            })));
            if let Some(node) = graph.node(key) {
                self.queue_job(node, now, &mut effects);
            }
            return Ok(effects);
        }

        if exec.cancel_requested_at.is_some() {
            let cause = self.take_cancel_cause(key);
            self.finish_job(key, JobStatus::Cancelled, JobReason::Cancelled { cause }, now, &mut effects);
        } else {
            self.finish_job(key, JobStatus::Failed, reason, now, &mut effects);
            if let Some(node) = graph.node(key) {
                self.fail_fast(node, now, &mut effects);
            }
        }
        effects.extend(self.evaluate(now));
        Ok(effects)
    }

    /// Cancel the whole run. The run's status is final immediately; running
    /// jobs finish once their runners acknowledge.
    pub fn request_cancel(&mut self, cause: CancelCause, now: DateTime<Utc>) -> Vec<Effect> {
        if self.run.status.is_terminal() {
            return Vec::new();
        }
        self.run.status = cause.run_status();
        self.run.cancel_cause = Some(cause.clone());
        info!(run_id = %self.run.id, cause = %cause, "Run cancelled");

        let mut effects = vec![Effect::Emit(Event::RunCancelled(RunCancelledPayload {
            run_id: self.run.id,
            workflow: self.run.workflow.clone(),
            cause: cause.clone(),
            cancelled_at: now,
        }))];
        let keys: Vec<JobKey> = self.run.jobs.keys().cloned().collect();
        for key in keys {
            self.cancel_job(&key, cause.clone(), now, &mut effects);
        }
        effects.extend(self.check_completion(now));
        effects
    }

    /// The runner confirmed it stopped a job.
    pub fn acknowledge_cancel(&mut self, key: &JobKey, now: DateTime<Utc>) -> Result<Vec<Effect>> {
        let released = self.release_stopping(key, None);
        if !released.is_empty() {
            return Ok(released);
        }

        let exec = self.run.jobs.get(key).ok_or_else(|| Error::JobNotFound {
            run_id: self.run.id,
            job: key.clone(),
        })?;
        if exec.is_terminal() {
            return Ok(Vec::new());
        }
        if exec.cancel_requested_at.is_none() {
            return Err(Error::InvalidTransition {
                job: key.clone(),
                from: exec.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }

        let mut effects = Vec::new();
        let cause = self.take_cancel_cause(key);
        self.finish_job(key, JobStatus::Cancelled, JobReason::Cancelled { cause }, now, &mut effects);
        effects.extend(self.evaluate(now));
        Ok(effects)
    }

    /// Apply run and job timeouts as of `now`. Cancel requests that go
    /// unacknowledged for `ack_timeout` are forced.
    pub fn expire(&mut self, now: DateTime<Utc>, ack_timeout: Duration) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.run.status == RunStatus::Running
            && let Some(deadline) = self.deadline()
            && now >= deadline
        {
            warn!(run_id = %self.run.id, "Run exceeded its timeout");
            effects.extend(self.request_cancel(CancelCause::RunTimeout, now));
        }

        let running: Vec<JobKey> = self
            .run
            .jobs
            .values()
            .filter(|exec| exec.status == JobStatus::Running)
            .map(|exec| exec.key.clone())
            .collect();

        for key in running {
            let Some(exec) = self.run.jobs.get(&key) else {
                continue;
            };
            if let Some(requested) = exec.cancel_requested_at {
                if now - requested >= ack_timeout {
                    warn!(run_id = %self.run.id, job = %key, "Cancel not acknowledged, forcing");
                    let cause = self.take_cancel_cause(&key);
                    self.finish_job(&key, JobStatus::Cancelled, JobReason::Cancelled { cause }, now, &mut effects);
                }
                continue;
            }

            let timed_out = match (exec.started_at, self.graph.node(&key)) {
                (Some(started), Some(node)) => now - started >= node.definition.timeout(),
                _ => false,
            };
            if timed_out {
                warn!(run_id = %self.run.id, job = %key, "Job timed out");
                if let Ok(more) = self.fail_job(&key, JobReason::Timeout, now) {
                    effects.extend(more);
                }
            }
        }

        let overdue: Vec<(JobKey, RunnerId)> = self
            .stopping
            .iter()
            .filter(|(_, since)| now - **since >= ack_timeout)
            .map(|(held, _)| held.clone())
            .collect();
        for (key, runner) in overdue {
            warn!(run_id = %self.run.id, job = %key, runner_id = %runner, "Runner did not confirm stop, releasing");
            effects.extend(self.release_stopping(&key, Some(runner)));
        }

        effects.extend(self.evaluate(now));
        effects
    }

    /// A runner disappeared. Fails the job it held unless it was only
    /// stopping a timed-out attempt.
    pub fn runner_lost(
        &mut self,
        key: &JobKey,
        runner: RunnerId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        if self.stopping.remove(&(key.clone(), runner)).is_some() {
            debug!(run_id = %self.run.id, job = %key, runner_id = %runner, "Stopping runner lost");
            return Ok(Vec::new());
        }
        let holds = self
            .run
            .jobs
            .get(key)
            .is_some_and(|exec| exec.runner_id == Some(runner));
        if !holds {
            return Ok(Vec::new());
        }
        self.fail_job(key, JobReason::RunnerLost, now)
    }

    pub fn approve(&mut self, gate: &str, now: DateTime<Utc>) -> Vec<Effect> {
        info!(run_id = %self.run.id, gate = %gate, "Approval granted");
        self.rejections.remove(gate);
        self.approvals.insert(gate.to_string());
        self.evaluate(now)
    }

    pub fn reject(&mut self, gate: &str, now: DateTime<Utc>) -> Vec<Effect> {
        info!(run_id = %self.run.id, gate = %gate, "Approval rejected");
        self.approvals.remove(gate);
        self.rejections.insert(gate.to_string());
        self.evaluate(now)
    }

    fn check_completion(&mut self, now: DateTime<Utc>) -> Vec<Effect> {
        if self.is_finished() || !self.run.jobs.values().all(JobExecution::is_terminal) {
            return Vec::new();
        }

        let status = match &self.run.cancel_cause {
            Some(cause) => cause.run_status(),
            None if self.run.jobs.values().any(failed_required) => RunStatus::Failed,
            None => RunStatus::Succeeded,
        };
        self.run.status = status;
        self.run.completed_at = Some(now);

        let count = |wanted: JobStatus| {
            self.run
                .jobs
                .values()
                .filter(|exec| exec.status == wanted)
                .count() as u32
        };
        let payload = RunCompletedPayload {
            run_id: self.run.id,
            workflow: self.run.workflow.clone(),
            run_number: self.run.run_number,
            status,
            duration_ms: self.run.duration_ms().unwrap_or(0),
            jobs_succeeded: count(JobStatus::Succeeded),
            jobs_failed: count(JobStatus::Failed),
            jobs_skipped: count(JobStatus::Skipped),
            jobs_cancelled: count(JobStatus::Cancelled),
            completed_at: now,
        };
        info!(run_id = %self.run.id, workflow = %self.run.workflow, status = %status, "Run completed");

        vec![
            Effect::Emit(Event::RunCompleted(payload)),
            Effect::Finished { status },
        ]
    }
}

/// A required job that failed, or was cancelled because another job failed
/// or the run timed out.
fn failed_required(exec: &JobExecution) -> bool {
    if !exec.required {
        return false;
    }
    match (&exec.status, &exec.reason) {
        (JobStatus::Failed, _) => true,
        (
            JobStatus::Cancelled,
            Some(JobReason::Cancelled {
                cause: CancelCause::FailFast { .. } | CancelCause::RunTimeout,
            }),
        ) => true,
        _ => false,
    }
}

/// Snapshot of a queued job taken under the run lock, rendered into a
/// [`DispatchRequest`] once its secrets are resolved.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub run_id: RunId,
    pub job: JobKey,
    pub attempt: u32,
    pub node: JobNode,
    pub event: RepoEvent,
    pub workflow_env: BTreeMap<String, String>,
    pub permissions: BTreeMap<String, PermissionLevel>,
    pub needs: BTreeMap<String, NeedResult>,
}

impl DispatchPlan {
    pub fn secret_names(&self) -> &[String] {
        &self.node.definition.secrets
    }

    /// Interpolate every step against the run's context.
    pub fn into_request(self, secrets: BTreeMap<String, SecretValue>) -> Result<DispatchRequest> {
        let definition = &self.node.definition;
        let (env, steps) = {
            let mut ctx = ExprContext::new(&self.event)
                .with_env(&self.workflow_env)
                .with_env(&definition.env)
                .with_matrix(&self.node.matrix)
                .with_secrets(&secrets);
            for (job_id, need) in &self.needs {
                ctx = ctx.with_need(job_id.clone(), need.clone());
            }

            let render = |template: &str, location: String| {
                interpolate(template, &ctx).map_err(|e| {
                    Error::Definition(DefinitionError::InvalidExpression {
                        location,
                        message: e.to_string(),
                    })
                })
            };
            let render_map = |map: &BTreeMap<String, String>, location: &str| {
                map.iter()
                    .map(|(k, v)| -> Result<(String, String)> {
                        Ok((k.clone(), render(v, format!("{location}.{k}"))?))
                    })
                    .collect::<Result<BTreeMap<_, _>>>()
            };

            let mut env = render_map(&self.workflow_env, "env")?;
            env.extend(render_map(&definition.env, &format!("jobs.{}.env", self.node.job_id))?);

            let mut steps = Vec::with_capacity(definition.steps.len());
            for (index, step) in definition.steps.iter().enumerate() {
                let location = format!("jobs.{}.steps[{}]", self.node.job_id, index);
                steps.push(DispatchStep {
                    index,
                    name: step.label(index),
                    uses: step.uses.clone(),
                    run: step
                        .run
                        .as_deref()
                        .map(|run| render(run, format!("{location}.run")))
                        .transpose()?,
                    with: render_map(&step.with, &format!("{location}.with"))?,
                    env: render_map(&step.env, &format!("{location}.env"))?,
                    continue_on_error: step.continue_on_error,
                });
            }
            (env, steps)
        };

        Ok(DispatchRequest {
            dispatch_id: DispatchId::new(),
            run_id: self.run_id,
            job: self.job,
            attempt: self.attempt,
            steps,
            env,
            secrets,
            permissions: self.permissions,
            timeout_minutes: definition.timeout_minutes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkflowStore;
    use pretty_assertions::assert_eq;

    fn state(yaml: &str) -> RunState {
        let definition = WorkflowStore::parse(yaml).unwrap();
        let graph = WorkflowStore::new().validate(&definition).unwrap();
        RunState::new(
            RunId::new(),
            1,
            Arc::new(definition),
            Arc::new(graph),
            RepoEvent::push("refs/heads/main"),
            None,
            Utc::now(),
        )
    }

    fn status(state: &RunState, job: &str) -> JobStatus {
        state.run().job(&JobKey::new(job)).unwrap().status
    }

    fn enqueued(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Enqueue { job, .. } => Some(job.to_string()),
                _ => None,
            })
            .collect()
    }

    fn finished(effects: &[Effect]) -> Option<RunStatus> {
        effects.iter().find_map(|e| match e {
            Effect::Finished { status } => Some(*status),
            _ => None,
        })
    }

    fn report(state: &RunState, job: &str, runner: RunnerId, step_status: StepStatus) -> JobReport {
        JobReport {
            run_id: state.id(),
            job: JobKey::new(job),
            runner_id: runner,
            steps: vec![StepResult {
                index: 0,
                name: "step-1".to_string(),
                status: step_status,
                exit_code: Some(if step_status == StepStatus::Failed { 1 } else { 0 }),
                outputs: BTreeMap::new(),
                started_at: None,
                completed_at: None,
            }],
            outputs: BTreeMap::new(),
        }
    }

    /// Dispatch and complete a job in one go.
    fn run_job(state: &mut RunState, job: &str, step_status: StepStatus) -> Vec<Effect> {
        let runner = RunnerId::new();
        let now = Utc::now();
        state.mark_dispatched(&JobKey::new(job), runner, now).unwrap();
        let report = report(state, job, runner, step_status);
        state.complete_job(report, now).unwrap()
    }

    const LINEAR: &str = r#"
name: ci
jobs:
  - id: build
    steps: [{run: make}]
  - id: test
    needs: [build]
    steps: [{run: make test}]
"#;

    #[test]
    fn test_start_queues_roots() {
        let mut state = state(LINEAR);
        let effects = state.start(Utc::now());

        assert_eq!(enqueued(&effects), vec!["build"]);
        assert_eq!(state.run().status, RunStatus::Running);
        assert_eq!(status(&state, "test"), JobStatus::Pending);
        assert!(state.start(Utc::now()).is_empty());
    }

    #[test]
    fn test_success_flows_downstream() {
        let mut state = state(LINEAR);
        state.start(Utc::now());

        let effects = run_job(&mut state, "build", StepStatus::Succeeded);
        assert_eq!(enqueued(&effects), vec!["test"]);

        let effects = run_job(&mut state, "test", StepStatus::Succeeded);
        assert_eq!(finished(&effects), Some(RunStatus::Succeeded));
        assert_eq!(state.run().status, RunStatus::Succeeded);
    }

    #[test]
    fn test_failure_skips_dependents() {
        let mut state = state(LINEAR);
        state.start(Utc::now());

        let effects = run_job(&mut state, "build", StepStatus::Failed);

        assert_eq!(status(&state, "build"), JobStatus::Failed);
        assert_eq!(status(&state, "test"), JobStatus::Skipped);
        assert_eq!(
            state.run().job(&JobKey::new("test")).unwrap().reason,
            Some(JobReason::DependencyFailed)
        );
        assert_eq!(finished(&effects), Some(RunStatus::Failed));
    }

    #[test]
    fn test_dispatch_requires_queued_job() {
        let mut state = state(LINEAR);
        state.start(Utc::now());

        let err = state
            .mark_dispatched(&JobKey::new("test"), RunnerId::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_duplicate_report_is_ignored() {
        let mut state = state(LINEAR);
        state.start(Utc::now());
        let runner = RunnerId::new();
        let now = Utc::now();
        state.mark_dispatched(&JobKey::new("build"), runner, now).unwrap();

        let first = report(&state, "build", runner, StepStatus::Succeeded);
        let second = report(&state, "build", runner, StepStatus::Failed);
        assert!(!state.complete_job(first, now).unwrap().is_empty());
        assert!(state.complete_job(second, now).unwrap().is_empty());
        assert_eq!(status(&state, "build"), JobStatus::Succeeded);
    }

    #[test]
    fn test_continue_on_error_step() {
        let mut state = state(
            r#"
name: ci
jobs:
  - id: lint
    steps: [{run: lint, continue_on_error: true}]
"#,
        );
        state.start(Utc::now());

        let effects = run_job(&mut state, "lint", StepStatus::Failed);
        assert_eq!(status(&state, "lint"), JobStatus::Succeeded);
        assert_eq!(finished(&effects), Some(RunStatus::Succeeded));
    }

    #[test]
    fn test_optional_job_failure_does_not_fail_run() {
        let mut state = state(
            r#"
name: ci
jobs:
  - id: flaky
    continue_on_error: true
    steps: [{run: flaky}]
  - id: report
    needs: [flaky]
    steps: [{run: report}]
"#,
        );
        state.start(Utc::now());

        let effects = run_job(&mut state, "flaky", StepStatus::Failed);
        assert_eq!(enqueued(&effects), vec!["report"]);

        let effects = run_job(&mut state, "report", StepStatus::Succeeded);
        assert_eq!(finished(&effects), Some(RunStatus::Succeeded));
    }

    #[test]
    fn test_cancel_is_cooperative() {
        let mut state = state(LINEAR);
        let now = Utc::now();
        state.start(now);
        let runner = RunnerId::new();
        state.mark_dispatched(&JobKey::new("build"), runner, now).unwrap();

        let effects = state.request_cancel(CancelCause::UserRequested { by: Some("ana".into()) }, now);
        assert_eq!(state.run().status, RunStatus::Cancelled);
        assert!(effects.iter().any(|e| matches!(e, Effect::SignalCancel { .. })));
        assert_eq!(status(&state, "build"), JobStatus::Running);
        assert_eq!(status(&state, "test"), JobStatus::Cancelled);
        assert_eq!(finished(&effects), None);

        let effects = state.acknowledge_cancel(&JobKey::new("build"), now).unwrap();
        assert_eq!(status(&state, "build"), JobStatus::Cancelled);
        assert_eq!(finished(&effects), Some(RunStatus::Cancelled));
    }

    #[test]
    fn test_unacknowledged_cancel_is_forced() {
        let mut state = state(LINEAR);
        let now = Utc::now();
        state.start(now);
        state.mark_dispatched(&JobKey::new("build"), RunnerId::new(), now).unwrap();
        state.request_cancel(CancelCause::UserRequested { by: None }, now);

        assert!(finished(&state.expire(now + Duration::seconds(30), Duration::seconds(60))).is_none());
        let effects = state.expire(now + Duration::seconds(61), Duration::seconds(60));
        assert_eq!(finished(&effects), Some(RunStatus::Cancelled));
        assert!(effects.iter().any(|e| matches!(e, Effect::ReleaseRunner { .. })));
    }

    fn released(effects: &[Effect]) -> Vec<RunnerId> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::ReleaseRunner { runner, .. } => Some(*runner),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_job_timeout() {
        let mut state = state(
            r#"
name: ci
jobs:
  - id: slow
    timeout_minutes: 5
    steps: [{run: sleep 1000}]
"#,
        );
        let now = Utc::now();
        let runner = RunnerId::new();
        state.start(now);
        state.mark_dispatched(&JobKey::new("slow"), runner, now).unwrap();

        assert!(state.expire(now + Duration::minutes(4), Duration::seconds(60)).is_empty());

        let effects = state.expire(now + Duration::minutes(5), Duration::seconds(60));
        assert_eq!(status(&state, "slow"), JobStatus::Failed);
        assert_eq!(
            state.run().job(&JobKey::new("slow")).unwrap().reason,
            Some(JobReason::Timeout)
        );
        assert!(effects.iter().any(|e| matches!(e, Effect::SignalCancel { .. })));
        assert!(released(&effects).is_empty());
        assert_eq!(finished(&effects), Some(RunStatus::Failed));
        assert!(state.holds_runners());

        let effects = state.acknowledge_cancel(&JobKey::new("slow"), now).unwrap();
        assert_eq!(released(&effects), vec![runner]);
        assert!(!state.holds_runners());
    }

    #[test]
    fn test_timed_out_runner_released_after_ack_timeout() {
        let mut state = state(
            r#"
name: ci
jobs:
  - id: slow
    timeout_minutes: 1
    steps: [{run: sleep 1000}]
"#,
        );
        let now = Utc::now();
        let runner = RunnerId::new();
        state.start(now);
        state.mark_dispatched(&JobKey::new("slow"), runner, now).unwrap();

        let timed_out = now + Duration::minutes(1);
        let effects = state.expire(timed_out, Duration::seconds(30));
        assert!(released(&effects).is_empty());

        let effects = state.expire(timed_out + Duration::seconds(10), Duration::seconds(30));
        assert!(released(&effects).is_empty());

        let effects = state.expire(timed_out + Duration::seconds(30), Duration::seconds(30));
        assert_eq!(released(&effects), vec![runner]);
        assert!(!state.holds_runners());
    }

    #[test]
    fn test_late_report_releases_timed_out_runner() {
        let mut state = state(
            r#"
name: ci
jobs:
  - id: slow
    timeout_minutes: 1
    retry:
      max_attempts: 2
      on: [timeout]
    steps: [{run: sleep 1000}]
"#,
        );
        let now = Utc::now();
        let key = JobKey::new("slow");
        let first = RunnerId::new();
        state.start(now);
        state.mark_dispatched(&key, first, now).unwrap();

        let effects = state.expire(now + Duration::minutes(1), Duration::seconds(60));
        assert_eq!(enqueued(&effects), vec!["slow"]);
        assert!(released(&effects).is_empty());

        let second = RunnerId::new();
        state.mark_dispatched(&key, second, now).unwrap();

        let late = report(&state, "slow", first, StepStatus::Succeeded);
        let effects = state.complete_job(late, now).unwrap();
        assert_eq!(released(&effects), vec![first]);
        // The old runner no longer speaks for the job.
        assert!(state.runner_lost(&key, first, now).unwrap().is_empty());
        assert_eq!(status(&state, "slow"), JobStatus::Running);
        assert_eq!(state.run().job(&key).unwrap().runner_id, Some(second));
    }

    #[test]
    fn test_run_timeout_fails_run() {
        let mut state = state(
            r#"
name: ci
timeout_minutes: 10
jobs:
  - id: build
    steps: [{run: make}]
"#,
        );
        let now = Utc::now();
        state.start(now);

        let effects = state.expire(now + Duration::minutes(10), Duration::seconds(60));
        assert_eq!(state.run().cancel_cause, Some(CancelCause::RunTimeout));
        assert!(effects.iter().any(|e| matches!(e, Effect::Dequeue { .. })));
        assert_eq!(finished(&effects), Some(RunStatus::Failed));
    }

    #[test]
    fn test_runner_lost_retries() {
        let mut state = state(
            r#"
name: ci
jobs:
  - id: build
    retry: {max_attempts: 2}
    steps: [{run: make}]
"#,
        );
        let now = Utc::now();
        state.start(now);
        let key = JobKey::new("build");

        state.mark_dispatched(&key, RunnerId::new(), now).unwrap();
        let effects = state.fail_job(&key, JobReason::RunnerLost, now).unwrap();
        assert_eq!(enqueued(&effects), vec!["build"]);
        assert_eq!(state.run().job(&key).unwrap().attempt, 2);
        assert_eq!(status(&state, "build"), JobStatus::Queued);

        state.mark_dispatched(&key, RunnerId::new(), now).unwrap();
        let effects = state.fail_job(&key, JobReason::RunnerLost, now).unwrap();
        assert_eq!(status(&state, "build"), JobStatus::Failed);
        assert_eq!(finished(&effects), Some(RunStatus::Failed));
    }

    #[test]
    fn test_fail_fast_cancels_siblings() {
        let mut state = state(
            r#"
name: ci
jobs:
  - id: test
    matrix:
      dimensions:
        os: [linux, macos]
    steps: [{run: make test}]
"#,
        );
        let now = Utc::now();
        state.start(now);

        let runner = RunnerId::new();
        state.mark_dispatched(&JobKey::new("test[0]"), runner, now).unwrap();
        let other = RunnerId::new();
        state.mark_dispatched(&JobKey::new("test[1]"), other, now).unwrap();

        let failure = report(&state, "test[0]", runner, StepStatus::Failed);
        let effects = state.complete_job(failure, now).unwrap();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SignalCancel { runner, .. } if *runner == other
        )));

        let effects = state.acknowledge_cancel(&JobKey::new("test[1]"), now).unwrap();
        assert_eq!(
            state.run().job(&JobKey::new("test[1]")).unwrap().reason,
            Some(JobReason::Cancelled {
                cause: CancelCause::FailFast {
                    failed: JobKey::new("test[0]")
                }
            })
        );
        assert_eq!(finished(&effects), Some(RunStatus::Failed));
    }

    #[test]
    fn test_approval_gate() {
        let mut state = state(
            r#"
name: release
jobs:
  - id: build
    steps: [{run: make}]
  - id: deploy
    needs: [build]
    approval: production
    steps: [{run: deploy}]
"#,
        );
        state.start(Utc::now());

        let effects = run_job(&mut state, "build", StepStatus::Succeeded);
        assert!(effects.iter().any(|e| matches!(e, Effect::Emit(Event::ApprovalRequested(_)))));
        assert_eq!(state.pending_approvals(), vec!["production"]);
        assert!(state.evaluate(Utc::now()).is_empty());

        let effects = state.approve("production", Utc::now());
        assert_eq!(enqueued(&effects), vec!["deploy"]);
        assert!(state.pending_approvals().is_empty());
    }

    #[test]
    fn test_rejected_approval_skips_job() {
        let mut state = state(
            r#"
name: release
jobs:
  - id: deploy
    approval: production
    steps: [{run: deploy}]
"#,
        );
        state.start(Utc::now());

        let effects = state.reject("production", Utc::now());
        assert_eq!(status(&state, "deploy"), JobStatus::Skipped);
        assert_eq!(finished(&effects), Some(RunStatus::Succeeded));
    }

    #[test]
    fn test_job_outputs_reach_dependents() {
        let mut state = state(
            r#"
name: release
jobs:
  - id: version
    outputs:
      tag: "${{ steps.compute.outputs.tag }}"
    steps: [{id: compute, run: ./version.sh}]
  - id: publish
    needs: [version]
    steps: [{run: "publish ${{ needs.version.outputs.tag }}"}]
"#,
        );
        let now = Utc::now();
        state.start(now);

        let runner = RunnerId::new();
        state.mark_dispatched(&JobKey::new("version"), runner, now).unwrap();
        let mut done = report(&state, "version", runner, StepStatus::Succeeded);
        done.steps[0].outputs.insert("tag".into(), "v1.2.0".into());
        state.complete_job(done, now).unwrap();

        let plan = state.dispatch_plan(&JobKey::new("publish")).unwrap();
        let request = plan.into_request(BTreeMap::new()).unwrap();
        assert_eq!(request.steps[0].run.as_deref(), Some("publish v1.2.0"));
    }

    #[test]
    fn test_dispatch_request_renders_secrets_and_env() {
        let state = state(
            r#"
name: deploy
env:
  STAGE: prod
jobs:
  - id: ship
    secrets: [TOKEN]
    env:
      TARGET: "${{ env.STAGE }}-eu"
    steps:
      - run: "deploy --token ${{ secrets.TOKEN }}"
        with:
          ref: "${{ github.ref_name }}"
"#,
        );
        let plan = state.dispatch_plan(&JobKey::new("ship")).unwrap();
        assert_eq!(plan.secret_names(), ["TOKEN"]);

        let secrets = BTreeMap::from([("TOKEN".to_string(), SecretValue::new("s3cr3t"))]);
        let request = plan.into_request(secrets).unwrap();

        assert_eq!(request.env["TARGET"], "prod-eu");
        assert_eq!(request.steps[0].run.as_deref(), Some("deploy --token s3cr3t"));
        assert_eq!(request.steps[0].with["ref"], "main");
    }
}
