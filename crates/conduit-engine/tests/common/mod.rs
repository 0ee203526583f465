//! In-memory ports for engine tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use conduit_core::events::Event;
use conduit_core::ports::{DispatchRequest, EventSink, RunnerTransport, SecretProvider};
use conduit_core::run::{JobReport, StepResult, StepStatus};
use conduit_core::secrets::SecretValue;
use conduit_core::{Error, JobKey, Result, RunId, RunnerId};
use conduit_engine::{Engine, EngineConfig, WorkflowStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Records dispatches and cancel signals instead of talking to runners.
#[derive(Default)]
pub struct RecordingTransport {
    dispatched: Mutex<Vec<(RunnerId, DispatchRequest)>>,
    cancelled: Mutex<Vec<(RunnerId, RunId, JobKey)>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn fail_dispatches(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> Vec<(RunnerId, DispatchRequest)> {
        self.dispatched.lock().unwrap().clone()
    }

    /// The most recent dispatch of `job` in `run_id`.
    pub fn request_for(&self, run_id: RunId, job: &str) -> Option<(RunnerId, DispatchRequest)> {
        self.dispatched()
            .into_iter()
            .rev()
            .find(|(_, r)| r.run_id == run_id && r.job.as_str() == job)
    }

    pub fn cancelled(&self) -> Vec<(RunnerId, RunId, JobKey)> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunnerTransport for RecordingTransport {
    async fn dispatch(&self, runner: RunnerId, request: DispatchRequest) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".into()));
        }
        self.dispatched.lock().unwrap().push((runner, request));
        Ok(())
    }

    async fn cancel(&self, runner: RunnerId, run_id: RunId, job: &JobKey) -> Result<()> {
        self.cancelled.lock().unwrap().push((runner, run_id, job.clone()));
        Ok(())
    }
}

/// Fixed set of secrets.
#[derive(Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecrets {
    async fn resolve(&self, name: &str) -> Result<SecretValue> {
        self.values
            .get(name)
            .map(SecretValue::new)
            .ok_or_else(|| Error::SecretNotFound(name.to_string()))
    }
}

/// Keeps every published event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.events().iter().map(Event::subject).collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub transport: Arc<RecordingTransport>,
    pub sink: Arc<RecordingSink>,
}

pub fn config() -> EngineConfig {
    EngineConfig {
        runner_heartbeat_timeout_secs: 3600,
        reload_definitions: false,
        ..EngineConfig::default()
    }
}

pub fn engine(workflows: &[&str]) -> TestEngine {
    engine_with_secrets(workflows, StaticSecrets::default())
}

pub fn engine_with_secrets(workflows: &[&str], secrets: StaticSecrets) -> TestEngine {
    let mut store = WorkflowStore::new();
    for source in workflows {
        let definition = WorkflowStore::parse(source).unwrap();
        store.insert(definition).unwrap();
    }

    let transport = Arc::new(RecordingTransport::default());
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::new(config(), store, transport.clone())
        .with_secrets(Arc::new(secrets))
        .with_sink(sink.clone());

    TestEngine {
        engine,
        transport,
        sink,
    }
}

/// A report where every dispatched step ends with `status`.
pub fn report(runner: RunnerId, request: &DispatchRequest, status: StepStatus) -> JobReport {
    let now = Utc::now();
    JobReport {
        run_id: request.run_id,
        job: request.job.clone(),
        runner_id: runner,
        steps: request
            .steps
            .iter()
            .map(|step| StepResult {
                index: step.index,
                name: step.name.clone(),
                status,
                exit_code: Some(if status == StepStatus::Failed { 1 } else { 0 }),
                outputs: BTreeMap::new(),
                started_at: Some(now),
                completed_at: Some(now),
            })
            .collect(),
        outputs: BTreeMap::new(),
    }
}
