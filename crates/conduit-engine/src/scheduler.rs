//! Engine service: event intake, run admission, dispatch and the background
//! sweep loop.

use crate::concurrency::{Admission, ConcurrencyManager};
use crate::config::EngineConfig;
use crate::coordinator::{Effect, RunState};
use crate::queue::{DispatchQueue, QueuedJob};
use crate::registry::RunnerRegistry;
use crate::store::{LoadReport, WorkflowStore};
use crate::triggers::{CronPoller, TriggerMatcher};
use chrono::{DateTime, Utc};
use conduit_core::events::{Event, RunnerDisconnectedPayload, RunnerRegisteredPayload};
use conduit_core::ports::{EventSink, NoSecrets, NullSink, RunnerTransport, SecretProvider};
use conduit_core::run::{CancelCause, JobReason, JobReport, Run, StepResult};
use conduit_core::runner::{Assignment, DisconnectReason, Runner, RunnerRegistration};
use conduit_core::trigger::RepoEvent;
use conduit_core::workflow::EventKind;
use conduit_core::{Error, JobKey, Result, RunId, RunnerId};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

/// The orchestration engine.
///
/// Locks are taken in the order queue, registry, run and are never held
/// across transport or sink calls.
pub struct Engine {
    config: EngineConfig,
    store: RwLock<WorkflowStore>,
    matcher: TriggerMatcher,
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunState>>>>,
    registry: Mutex<RunnerRegistry>,
    queue: Mutex<DispatchQueue>,
    concurrency: Mutex<ConcurrencyManager>,
    cron: Mutex<CronPoller>,
    run_numbers: Mutex<HashMap<String, u32>>,
    transport: Arc<dyn RunnerTransport>,
    secrets: Arc<dyn SecretProvider>,
    sink: Arc<dyn EventSink>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: WorkflowStore, transport: Arc<dyn RunnerTransport>) -> Self {
        let mut cron = CronPoller::new();
        cron.rebuild(&store);

        Self {
            config,
            store: RwLock::new(store),
            matcher: TriggerMatcher::new(),
            runs: RwLock::new(HashMap::new()),
            registry: Mutex::new(RunnerRegistry::new()),
            queue: Mutex::new(DispatchQueue::new()),
            concurrency: Mutex::new(ConcurrencyManager::new()),
            cron: Mutex::new(cron),
            run_numbers: Mutex::new(HashMap::new()),
            transport,
            secrets: Arc::new(NoSecrets),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // === Events and runs ===

    /// Start a run for every workflow whose triggers match `event`.
    pub async fn handle_event(&self, event: RepoEvent) -> Result<Vec<RunId>> {
        let names = {
            let store = self.store.read().await;
            self.matcher.matching(&store, &event)
        };
        if names.is_empty() {
            debug!(kind = %event.kind.as_str(), git_ref = %event.git_ref, "No workflow matched event");
            return Ok(Vec::new());
        }

        let mut started = Vec::with_capacity(names.len());
        for name in names {
            started.push(self.start_run(&name, event.clone()).await?);
        }
        self.dispatch_pending().await?;
        Ok(started)
    }

    /// Start a run of `workflow` regardless of its triggers.
    pub async fn trigger(&self, workflow: &str, event: RepoEvent) -> Result<RunId> {
        let run_id = self.start_run(workflow, event).await?;
        self.dispatch_pending().await?;
        Ok(run_id)
    }

    async fn start_run(&self, workflow: &str, event: RepoEvent) -> Result<RunId> {
        let loaded = self
            .store
            .read()
            .await
            .get(workflow)
            .cloned()
            .ok_or_else(|| Error::WorkflowNotFound(workflow.to_string()))?;
        let definition = loaded.definition;

        let run_number = {
            let mut numbers = self.run_numbers.lock().await;
            let counter = numbers.entry(definition.name.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let group = definition.concurrency.as_ref().map(|c| {
            (
                ConcurrencyManager::key_for(&definition, &event),
                c.cancel_in_progress,
            )
        });

        let run_id = RunId::new();
        let now = Utc::now();
        let state = RunState::new(
            run_id,
            run_number,
            Arc::clone(&definition),
            loaded.graph,
            event,
            group.as_ref().map(|(key, _)| key.clone()),
            now,
        );
        let state = Arc::new(Mutex::new(state));
        self.runs.write().await.insert(run_id, Arc::clone(&state));

        let admission = match &group {
            Some((key, cancel_in_progress)) => {
                self.concurrency
                    .lock()
                    .await
                    .admit(key, run_id, *cancel_in_progress)
            }
            None => Admission::Admitted,
        };

        let queued = state.lock().await.queued_event(admission == Admission::Queued);
        self.publish(queued).await;
        info!(run_id = %run_id, workflow = %definition.name, run_number, "Run created");

        match admission {
            Admission::Admitted => {}
            Admission::Supersede(previous) => {
                for old in previous {
                    info!(run_id = %old, superseded_by = %run_id, "Cancelling superseded run");
                    let cause = CancelCause::CancelledByGroup { superseded_by: run_id };
                    if let Err(e) = self.cancel_with(old, cause).await {
                        debug!(run_id = %old, error = %e, "Superseded run already finished");
                    }
                }
            }
            Admission::Queued => {
                info!(run_id = %run_id, "Run waiting for concurrency group");
                return Ok(run_id);
            }
        }

        let effects = state.lock().await.start(now);
        self.apply(run_id, effects).await;
        Ok(run_id)
    }

    /// Cancel a run on behalf of a user.
    pub async fn cancel_run(&self, run_id: RunId, by: Option<String>) -> Result<()> {
        self.cancel_with(run_id, CancelCause::UserRequested { by }).await?;
        self.dispatch_pending().await?;
        Ok(())
    }

    async fn cancel_with(&self, run_id: RunId, cause: CancelCause) -> Result<()> {
        let state = self.run_state(run_id).await?;
        let effects = {
            let mut state = state.lock().await;
            if state.run().status.is_terminal() {
                return Err(Error::RunAlreadyCompleted(run_id));
            }
            state.request_cancel(cause, Utc::now())
        };
        self.apply(run_id, effects).await;
        Ok(())
    }

    pub async fn approve(&self, run_id: RunId, gate: &str) -> Result<()> {
        let state = self.run_state(run_id).await?;
        let effects = state.lock().await.approve(gate, Utc::now());
        self.apply(run_id, effects).await;
        self.dispatch_pending().await?;
        Ok(())
    }

    pub async fn reject(&self, run_id: RunId, gate: &str) -> Result<()> {
        let state = self.run_state(run_id).await?;
        let effects = state.lock().await.reject(gate, Utc::now());
        self.apply(run_id, effects).await;
        self.dispatch_pending().await?;
        Ok(())
    }

    /// Current state of a run.
    pub async fn snapshot(&self, run_id: RunId) -> Option<Run> {
        let state = self.run_state(run_id).await.ok()?;
        let run = state.lock().await.run().clone();
        Some(run)
    }

    /// All known runs, oldest first.
    pub async fn runs(&self) -> Vec<Run> {
        let states: Vec<_> = self.runs.read().await.values().cloned().collect();
        let mut runs = join_all(
            states
                .iter()
                .map(|state| async move { state.lock().await.run().clone() }),
        )
        .await;
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    pub async fn pending_approvals(&self, run_id: RunId) -> Result<Vec<String>> {
        let state = self.run_state(run_id).await?;
        let gates = state.lock().await.pending_approvals();
        Ok(gates)
    }

    async fn run_state(&self, run_id: RunId) -> Result<Arc<Mutex<RunState>>> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(Error::RunNotFound(run_id))
    }

    // === Runner reports ===

    pub async fn report_step(&self, run_id: RunId, job: &JobKey, step: StepResult) -> Result<()> {
        let state = self.run_state(run_id).await?;
        let effects = state.lock().await.record_step(job, step)?;
        self.apply(run_id, effects).await;
        Ok(())
    }

    pub async fn report_job(&self, report: JobReport) -> Result<()> {
        let run_id = report.run_id;
        let state = self.run_state(run_id).await?;
        let effects = state.lock().await.complete_job(report, Utc::now())?;
        self.apply(run_id, effects).await;
        self.dispatch_pending().await?;
        Ok(())
    }

    pub async fn acknowledge_cancel(&self, run_id: RunId, job: &JobKey) -> Result<()> {
        let state = self.run_state(run_id).await?;
        let effects = state.lock().await.acknowledge_cancel(job, Utc::now())?;
        self.apply(run_id, effects).await;
        self.dispatch_pending().await?;
        Ok(())
    }

    // === Runners ===

    pub async fn register_runner(&self, registration: RunnerRegistration) -> Result<Runner> {
        let now = Utc::now();
        let runner = self.registry.lock().await.register(registration, now);
        self.publish(Event::RunnerRegistered(RunnerRegisteredPayload {
            runner_id: runner.id,
            name: runner.name.clone(),
            labels: runner.labels.iter().cloned().collect(),
            registered_at: now,
        }))
        .await;
        self.dispatch_pending().await?;
        Ok(runner)
    }

    /// Remove a runner. A job it was running fails with `RunnerLost`.
    pub async fn deregister_runner(&self, id: RunnerId) -> Result<()> {
        let runner = self.registry.lock().await.deregister(id)?;
        self.publish(Event::RunnerDisconnected(RunnerDisconnectedPayload {
            runner_id: id,
            reason: DisconnectReason::Graceful,
            disconnected_at: Utc::now(),
        }))
        .await;
        if let Some(assignment) = runner.assignment {
            self.runner_lost(id, assignment).await?;
        }
        self.dispatch_pending().await?;
        Ok(())
    }

    pub async fn heartbeat(&self, id: RunnerId) -> Result<()> {
        self.registry.lock().await.heartbeat(id, Utc::now())?;
        self.dispatch_pending().await?;
        Ok(())
    }

    pub async fn drain_runner(&self, id: RunnerId) -> Result<()> {
        self.registry.lock().await.drain(id)
    }

    pub async fn runners(&self) -> Vec<Runner> {
        self.registry.lock().await.list().to_vec()
    }

    async fn runner_lost(&self, runner: RunnerId, assignment: Assignment) -> Result<()> {
        warn!(run_id = %assignment.run_id, job = %assignment.job, runner_id = %runner, "Runner lost while running job");
        let state = self.run_state(assignment.run_id).await?;
        let effects = state
            .lock()
            .await
            .runner_lost(&assignment.job, runner, Utc::now())?;
        self.apply(assignment.run_id, effects).await;
        Ok(())
    }

    // === Dispatch ===

    /// Hand queued jobs to idle runners. Returns the number dispatched.
    pub async fn dispatch_pending(&self) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            let matched = {
                let mut queue = self.queue.lock().await;
                let mut registry = self.registry.lock().await;
                queue.take_dispatchable(&mut registry)
            };
            if matched.is_empty() {
                break;
            }
            for (entry, runner) in matched {
                if self.dispatch(entry, runner).await? {
                    dispatched += 1;
                }
            }
        }
        Ok(dispatched)
    }

    async fn dispatch(&self, entry: QueuedJob, runner: RunnerId) -> Result<bool> {
        let run_id = entry.run_id;
        let job = entry.job;

        let Ok(state) = self.run_state(run_id).await else {
            self.release_runner(runner, run_id, &job).await;
            return Ok(false);
        };
        let plan = state.lock().await.dispatch_plan(&job);
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                warn!(run_id = %run_id, job = %job, error = %e, "Dropping queued job");
                self.release_runner(runner, run_id, &job).await;
                return Ok(false);
            }
        };

        let mut secrets = BTreeMap::new();
        for name in plan.secret_names() {
            match self.secrets.resolve(name).await {
                Ok(value) => {
                    secrets.insert(name.clone(), value);
                }
                Err(e) => {
                    warn!(run_id = %run_id, job = %job, secret = %name, error = %e, "Secret unavailable");
                    self.release_runner(runner, run_id, &job).await;
                    let reason = JobReason::SecretUnavailable { name: name.clone() };
                    let effects = state.lock().await.fail_job(&job, reason, Utc::now())?;
                    self.apply(run_id, effects).await;
                    return Ok(false);
                }
            }
        }

        let request = match plan.into_request(secrets) {
            Ok(request) => request,
            Err(e) => {
                error!(run_id = %run_id, job = %job, error = %e, "Failed to render job");
                self.release_runner(runner, run_id, &job).await;
                let reason = JobReason::StepFailed {
                    step: 0,
                    exit_code: None,
                };
                let effects = state.lock().await.fail_job(&job, reason, Utc::now())?;
                self.apply(run_id, effects).await;
                return Ok(false);
            }
        };

        let started = state.lock().await.mark_dispatched(&job, runner, Utc::now());
        match started {
            Ok(effects) => self.apply(run_id, effects).await,
            Err(e) => {
                debug!(run_id = %run_id, job = %job, error = %e, "Job no longer dispatchable");
                self.release_runner(runner, run_id, &job).await;
                return Ok(false);
            }
        }

        debug!(run_id = %run_id, job = %job, runner_id = %runner, dispatch_id = %request.dispatch_id, "Dispatching job");
        if let Err(e) = self.transport.dispatch(runner, request).await {
            warn!(runner_id = %runner, error = %e, "Dispatch failed, marking runner offline");
            self.registry.lock().await.mark_offline(runner);
            self.publish(Event::RunnerDisconnected(RunnerDisconnectedPayload {
                runner_id: runner,
                reason: DisconnectReason::TransportError,
                disconnected_at: Utc::now(),
            }))
            .await;
            let effects = state
                .lock()
                .await
                .fail_job(&job, JobReason::RunnerLost, Utc::now())?;
            self.apply(run_id, effects).await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Free `runner` if it still holds `job`.
    async fn release_runner(&self, runner: RunnerId, run_id: RunId, job: &JobKey) {
        let mut registry = self.registry.lock().await;
        let holds = registry
            .get(runner)
            .and_then(|r| r.assignment.as_ref())
            .is_some_and(|a| a.run_id == run_id && a.job == *job);
        if holds {
            registry.release(runner);
        }
    }

    // === Effects ===

    /// Carry out effects produced by run state transitions. Finishing a run
    /// may start the next run of its concurrency group, whose effects are
    /// applied in the same pass.
    async fn apply(&self, run_id: RunId, effects: Vec<Effect>) {
        let mut work: VecDeque<(RunId, Effect)> =
            effects.into_iter().map(|effect| (run_id, effect)).collect();

        while let Some((run_id, effect)) = work.pop_front() {
            match effect {
                Effect::Enqueue { job, labels } => {
                    self.queue.lock().await.enqueue(QueuedJob {
                        run_id,
                        job,
                        labels,
                        queued_at: Utc::now(),
                    });
                }
                Effect::Dequeue { job } => {
                    self.queue.lock().await.remove(run_id, &job);
                }
                Effect::SignalCancel { runner, job } => {
                    if let Err(e) = self.transport.cancel(runner, run_id, &job).await {
                        warn!(run_id = %run_id, job = %job, runner_id = %runner, error = %e, "Failed to signal cancel");
                    }
                }
                Effect::ReleaseRunner { runner, job } => {
                    self.release_runner(runner, run_id, &job).await;
                }
                Effect::Emit(event) => self.publish(event).await,
                Effect::Finished { status } => {
                    debug!(run_id = %run_id, status = %status, "Run finished");
                    self.queue.lock().await.remove_run(run_id);
                    if let Some((next, effects)) = self.release_group(run_id).await {
                        work.extend(effects.into_iter().map(|effect| (next, effect)));
                    }
                }
            }
        }
    }

    /// Free the concurrency slot of a finished run and start the next
    /// waiting run, if any.
    async fn release_group(&self, run_id: RunId) -> Option<(RunId, Vec<Effect>)> {
        let state = self.run_state(run_id).await.ok()?;
        let key = state.lock().await.run().concurrency_key.clone()?;
        let next = self.concurrency.lock().await.release(&key, run_id)?;

        info!(group = %key, run_id = %next, "Concurrency group handed to waiting run");
        let next_state = self.run_state(next).await.ok()?;
        let effects = next_state.lock().await.start(Utc::now());
        Some((next, effects))
    }

    async fn publish(&self, event: Event) {
        let subject = event.subject();
        if let Err(e) = self.sink.publish(event).await {
            warn!(subject = %subject, error = %e, "Failed to publish event");
        }
    }

    // === Background ===

    /// Enforce timeouts, expire silent runners, fire due schedules and
    /// dispatch.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<()> {
        let states: Vec<(RunId, Arc<Mutex<RunState>>)> = self
            .runs
            .read()
            .await
            .iter()
            .map(|(id, state)| (*id, Arc::clone(state)))
            .collect();
        let ack_timeout = self.config.cancel_ack_timeout();
        let retention = self.config.run_retention();
        let mut expired = Vec::new();
        for (run_id, state) in states {
            let effects = {
                let mut state = state.lock().await;
                if state.is_finished() && !state.holds_runners() {
                    if state.run().completed_at.is_some_and(|done| now - done >= retention) {
                        expired.push(run_id);
                    }
                    continue;
                }
                state.expire(now, ack_timeout)
            };
            self.apply(run_id, effects).await;
        }
        if !expired.is_empty() {
            let mut runs = self.runs.write().await;
            for run_id in &expired {
                runs.remove(run_id);
            }
            debug!(count = expired.len(), "Evicted finished runs");
        }

        let stale = self
            .registry
            .lock()
            .await
            .stale(self.config.heartbeat_timeout(), now);
        for runner in stale {
            let assignment = self.registry.lock().await.mark_offline(runner);
            self.publish(Event::RunnerDisconnected(RunnerDisconnectedPayload {
                runner_id: runner,
                reason: DisconnectReason::HeartbeatTimeout,
                disconnected_at: now,
            }))
            .await;
            if let Some(assignment) = assignment {
                self.runner_lost(runner, assignment).await?;
            }
        }

        let fires = self.cron.lock().await.due(now);
        for fire in fires {
            info!(workflow = %fire.workflow, expression = %fire.expression, "Schedule fired");
            let event = RepoEvent::new(
                EventKind::Schedule,
                format!("refs/heads/{}", self.config.default_branch),
            );
            if let Err(e) = self.start_run(&fire.workflow, event).await {
                warn!(workflow = %fire.workflow, error = %e, "Failed to start scheduled run");
            }
        }

        self.dispatch_pending().await?;
        Ok(())
    }

    /// Re-read changed definition files and re-register schedules.
    pub async fn reload_definitions(&self) -> Result<LoadReport> {
        let report = {
            let mut store = self.store.write().await;
            let report = store.refresh(&self.config.workflows_dir)?;
            if !report.loaded.is_empty() || !report.removed.is_empty() {
                self.cron.lock().await.rebuild(&store);
            }
            if !report.removed.is_empty() {
                let mut numbers = self.run_numbers.lock().await;
                numbers.retain(|name, _| store.get(name).is_some());
            }
            report
        };
        for (path, e) in &report.failed {
            warn!(path = %path.display(), error = %e, "Rejected workflow definition");
        }
        Ok(report)
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        info!(interval_ms = self.config.tick_interval_ms, "Engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.config.reload_definitions
                        && let Err(e) = self.reload_definitions().await
                    {
                        warn!(error = %e, "Failed to reload definitions");
                    }
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Engine shutting down");
                        break;
                    }
                }
            }
        }
    }
}
