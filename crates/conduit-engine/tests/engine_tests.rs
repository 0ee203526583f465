//! End-to-end scheduling scenarios against in-memory ports.

mod common;

use chrono::{Duration, Utc};
use common::{RecordingTransport, StaticSecrets, engine, engine_with_secrets, report};
use conduit_core::RunId;
use conduit_core::events::Event;
use conduit_core::run::{CancelCause, JobReason, JobStatus, RunStatus, StepStatus};
use conduit_core::runner::{RunnerRegistration, RunnerStatus};
use conduit_core::trigger::RepoEvent;
use conduit_core::{Error, JobKey};
use conduit_engine::{Engine, EngineConfig, WorkflowStore};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const BUILD_AND_TEST: &str = r#"
name: ci
triggers:
  - type: push
    branches: [main]
jobs:
  - id: build
    runs_on: [linux]
    steps:
      - run: make
  - id: test
    runs_on: [linux]
    needs: [build]
    steps:
      - run: make test
"#;

async fn job_status(engine: &conduit_engine::Engine, run_id: RunId, job: &str) -> JobStatus {
    engine
        .snapshot(run_id)
        .await
        .unwrap()
        .job(&JobKey::new(job))
        .unwrap()
        .status
}

#[tokio::test]
async fn test_failed_dependency_skips_dependent() {
    let t = engine(&[BUILD_AND_TEST]);
    let runner = t
        .engine
        .register_runner(RunnerRegistration::new("linux-1", ["linux"]))
        .await
        .unwrap();

    let runs = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run_id = runs[0];

    let (assigned, request) = t.transport.request_for(run_id, "build").unwrap();
    assert_eq!(assigned, runner.id);
    t.engine
        .report_job(report(assigned, &request, StepStatus::Failed))
        .await
        .unwrap();

    let run = t.engine.snapshot(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.job(&JobKey::new("build")).unwrap().status, JobStatus::Failed);
    let test = run.job(&JobKey::new("test")).unwrap();
    assert_eq!(test.status, JobStatus::Skipped);
    assert_eq!(test.reason, Some(JobReason::DependencyFailed));
    assert!(t.transport.request_for(run_id, "test").is_none());
}

#[tokio::test]
async fn test_successful_run_publishes_lifecycle() {
    let t = engine(&[BUILD_AND_TEST]);
    t.engine
        .register_runner(RunnerRegistration::new("linux-1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    for job in ["build", "test"] {
        let (runner, request) = t.transport.request_for(run_id, job).unwrap();
        t.engine
            .report_job(report(runner, &request, StepStatus::Succeeded))
            .await
            .unwrap();
    }

    assert_eq!(t.engine.snapshot(run_id).await.unwrap().status, RunStatus::Succeeded);
    let subjects = t.sink.subjects();
    assert!(subjects[0].ends_with(".registered"));
    assert!(subjects.contains(&format!("run.started.ci.{}", run_id)));
    assert!(subjects.contains(&format!("run.{}.job.test.completed", run_id)));
    assert_eq!(
        subjects.last().map(String::as_str),
        Some(format!("run.completed.ci.{}", run_id).as_str())
    );
}

#[tokio::test]
async fn test_finished_runs_are_evicted_after_retention() {
    let t = engine(&[BUILD_AND_TEST]);
    t.engine
        .register_runner(RunnerRegistration::new("linux-1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];
    let (runner, request) = t.transport.request_for(run_id, "build").unwrap();
    t.engine
        .report_job(report(runner, &request, StepStatus::Failed))
        .await
        .unwrap();

    let retention = t.engine.config().run_retention();
    t.engine
        .sweep(Utc::now() + retention - Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(t.engine.snapshot(run_id).await.unwrap().status, RunStatus::Failed);

    t.engine
        .sweep(Utc::now() + retention + Duration::seconds(1))
        .await
        .unwrap();
    assert!(t.engine.snapshot(run_id).await.is_none());
    assert!(t.engine.runs().await.is_empty());

    // Numbering carries on past evicted runs.
    let next = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];
    assert_eq!(t.engine.snapshot(next).await.unwrap().run_number, 2);
}

#[tokio::test]
async fn test_reload_forgets_counters_of_removed_workflows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ci.yml");
    std::fs::write(&path, BUILD_AND_TEST).unwrap();
    let config = EngineConfig {
        workflows_dir: dir.path().to_path_buf(),
        ..common::config()
    };
    let engine = Engine::new(config, WorkflowStore::new(), Arc::new(RecordingTransport::default()));
    engine.reload_definitions().await.unwrap();

    let event = RepoEvent::push("refs/heads/main");
    engine.trigger("ci", event.clone()).await.unwrap();
    let second = engine.trigger("ci", event.clone()).await.unwrap();
    assert_eq!(engine.snapshot(second).await.unwrap().run_number, 2);

    std::fs::remove_file(&path).unwrap();
    let report = engine.reload_definitions().await.unwrap();
    assert_eq!(report.removed, vec!["ci".to_string()]);

    std::fs::write(&path, BUILD_AND_TEST).unwrap();
    engine.reload_definitions().await.unwrap();
    let fresh = engine.trigger("ci", event).await.unwrap();
    assert_eq!(engine.snapshot(fresh).await.unwrap().run_number, 1);
}

#[tokio::test]
async fn test_unmatched_event_starts_nothing() {
    let t = engine(&[BUILD_AND_TEST]);
    let runs = t
        .engine
        .handle_event(RepoEvent::push("refs/heads/feature/x"))
        .await
        .unwrap();
    assert!(runs.is_empty());
    assert!(t.engine.runs().await.is_empty());
}

#[tokio::test]
async fn test_job_waits_for_matching_runner() {
    let t = engine(&[r#"
name: image
jobs:
  - id: package
    runs_on: [linux, docker]
    steps:
      - run: docker build .
"#]);
    t.engine
        .register_runner(RunnerRegistration::new("plain", ["linux"]))
        .await
        .unwrap();

    let run_id = t
        .engine
        .handle_event(RepoEvent::push("refs/heads/main"))
        .await
        .unwrap()[0];
    assert_eq!(job_status(&t.engine, run_id, "package").await, JobStatus::Queued);
    assert!(t.transport.dispatched().is_empty());

    t.engine.sweep(Utc::now()).await.unwrap();
    assert_eq!(job_status(&t.engine, run_id, "package").await, JobStatus::Queued);

    let docker = t
        .engine
        .register_runner(RunnerRegistration::new("docker", ["linux", "docker"]))
        .await
        .unwrap();
    assert_eq!(job_status(&t.engine, run_id, "package").await, JobStatus::Running);
    let (assigned, _) = t.transport.request_for(run_id, "package").unwrap();
    assert_eq!(assigned, docker.id);
}

#[tokio::test]
async fn test_cancel_in_progress_supersedes_older_run() {
    let t = engine(&[r#"
name: deploy
concurrency:
  cancel_in_progress: true
jobs:
  - id: build
    steps:
      - run: make
  - id: ship
    needs: [build]
    steps:
      - run: ./ship.sh
"#]);
    let runner = t
        .engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();

    let first = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];
    assert_eq!(job_status(&t.engine, first, "build").await, JobStatus::Running);

    let second = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    let old = t.engine.snapshot(first).await.unwrap();
    assert_eq!(old.status, RunStatus::Cancelled);
    assert_eq!(
        old.cancel_cause,
        Some(CancelCause::CancelledByGroup {
            superseded_by: second
        })
    );
    assert_eq!(old.job(&JobKey::new("ship")).unwrap().status, JobStatus::Cancelled);
    assert_eq!(t.transport.cancelled(), vec![(runner.id, first, JobKey::new("build"))]);

    // At most one non-terminal run in the group.
    let active: Vec<_> = t
        .engine
        .runs()
        .await
        .into_iter()
        .filter(|run| !run.status.is_terminal())
        .map(|run| run.id)
        .collect();
    assert_eq!(active, vec![second]);

    // The runner frees up once it acknowledges, and the new run proceeds.
    t.engine.acknowledge_cancel(first, &JobKey::new("build")).await.unwrap();
    assert_eq!(job_status(&t.engine, first, "build").await, JobStatus::Cancelled);
    assert_eq!(job_status(&t.engine, second, "build").await, JobStatus::Running);
}

#[tokio::test]
async fn test_group_without_cancel_waits() {
    let t = engine(&[r#"
name: release
concurrency:
  group: "release-${{ github.ref_name }}"
jobs:
  - id: publish
    steps:
      - run: ./publish.sh
"#]);
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    t.engine
        .register_runner(RunnerRegistration::new("r2", ["linux"]))
        .await
        .unwrap();

    let first = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];
    let second = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    let waiting = t.engine.snapshot(second).await.unwrap();
    assert_eq!(waiting.status, RunStatus::Pending);
    assert_eq!(waiting.concurrency_key.as_deref(), Some("release-main"));
    assert_eq!(job_status(&t.engine, second, "publish").await, JobStatus::Pending);

    let (runner, request) = t.transport.request_for(first, "publish").unwrap();
    t.engine
        .report_job(report(runner, &request, StepStatus::Succeeded))
        .await
        .unwrap();

    assert_eq!(t.engine.snapshot(first).await.unwrap().status, RunStatus::Succeeded);
    assert_eq!(t.engine.snapshot(second).await.unwrap().status, RunStatus::Running);
    assert_eq!(job_status(&t.engine, second, "publish").await, JobStatus::Running);
}

const SOAK: &str = r#"
name: slow
jobs:
  - id: soak
    timeout_minutes: 1
    steps:
      - run: sleep 600
"#;

const LINT: &str = r#"
name: checks
jobs:
  - id: lint
    steps:
      - run: make lint
"#;

#[tokio::test]
async fn test_job_timeout_holds_runner_until_stopped() {
    let t = engine(&[SOAK, LINT]);
    let runner = t
        .engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let event = RepoEvent::push("refs/heads/main");
    let soak_run = t.engine.trigger("slow", event.clone()).await.unwrap();
    let lint_run = t.engine.trigger("checks", event).await.unwrap();
    assert_eq!(job_status(&t.engine, lint_run, "lint").await, JobStatus::Queued);

    t.engine.sweep(Utc::now() + Duration::seconds(30)).await.unwrap();
    assert_eq!(job_status(&t.engine, soak_run, "soak").await, JobStatus::Running);

    t.engine.sweep(Utc::now() + Duration::seconds(61)).await.unwrap();
    let run = t.engine.snapshot(soak_run).await.unwrap();
    let soak = run.job(&JobKey::new("soak")).unwrap();
    assert_eq!(soak.status, JobStatus::Failed);
    assert_eq!(soak.reason, Some(JobReason::Timeout));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(t.transport.cancelled().len(), 1);

    // The runner may still be executing the job until it confirms the stop.
    assert_eq!(t.engine.runners().await[0].status, RunnerStatus::Busy);
    assert_eq!(job_status(&t.engine, lint_run, "lint").await, JobStatus::Queued);
    assert!(t.transport.request_for(lint_run, "lint").is_none());

    t.engine
        .acknowledge_cancel(soak_run, &JobKey::new("soak"))
        .await
        .unwrap();
    let (assigned, _) = t.transport.request_for(lint_run, "lint").unwrap();
    assert_eq!(assigned, runner.id);
    assert_eq!(job_status(&t.engine, lint_run, "lint").await, JobStatus::Running);
}

#[tokio::test]
async fn test_unconfirmed_stop_releases_runner_after_ack_timeout() {
    let t = engine(&[SOAK]);
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.trigger("slow", RepoEvent::push("refs/heads/main")).await.unwrap();

    let timed_out = Utc::now() + Duration::seconds(61);
    t.engine.sweep(timed_out).await.unwrap();
    assert_eq!(job_status(&t.engine, run_id, "soak").await, JobStatus::Failed);
    assert_eq!(t.engine.runners().await[0].status, RunnerStatus::Busy);

    let ack_timeout = t.engine.config().cancel_ack_timeout();
    t.engine.sweep(timed_out + ack_timeout).await.unwrap();
    assert_eq!(t.engine.runners().await[0].status, RunnerStatus::Idle);
}

#[tokio::test]
async fn test_deregistered_runner_fails_job() {
    let t = engine(&[BUILD_AND_TEST]);
    let runner = t
        .engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    t.engine.deregister_runner(runner.id).await.unwrap();

    let run = t.engine.snapshot(run_id).await.unwrap();
    let build = run.job(&JobKey::new("build")).unwrap();
    assert_eq!(build.status, JobStatus::Failed);
    assert_eq!(build.reason, Some(JobReason::RunnerLost));
    assert_eq!(run.status, RunStatus::Failed);
    assert!(t.engine.runners().await.is_empty());
}

#[tokio::test]
async fn test_runner_lost_with_retry_redispatches() {
    let t = engine(&[r#"
name: ci
jobs:
  - id: build
    retry:
      max_attempts: 2
      on: [runner_lost]
    steps:
      - run: make
"#]);
    let first = t
        .engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    t.engine.deregister_runner(first.id).await.unwrap();
    assert_eq!(job_status(&t.engine, run_id, "build").await, JobStatus::Queued);

    let second = t
        .engine
        .register_runner(RunnerRegistration::new("r2", ["linux"]))
        .await
        .unwrap();
    let (assigned, request) = t.transport.request_for(run_id, "build").unwrap();
    assert_eq!(assigned, second.id);
    assert_eq!(request.attempt, 2);
    assert!(
        t.sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::JobRetried(p) if p.attempt == 2))
    );
}

#[tokio::test]
async fn test_transport_error_marks_runner_offline() {
    let t = engine(&[BUILD_AND_TEST]);
    t.transport.fail_dispatches(true);
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();

    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    let run = t.engine.snapshot(run_id).await.unwrap();
    assert_eq!(
        run.job(&JobKey::new("build")).unwrap().reason,
        Some(JobReason::RunnerLost)
    );
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(t.engine.runners().await[0].status, RunnerStatus::Offline);
}

#[tokio::test]
async fn test_stale_runner_is_lost() {
    let t = engine(&[BUILD_AND_TEST]);
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    t.engine.sweep(Utc::now() + Duration::hours(2)).await.unwrap();

    assert_eq!(t.engine.runners().await[0].status, RunnerStatus::Offline);
    let run = t.engine.snapshot(run_id).await.unwrap();
    assert_eq!(
        run.job(&JobKey::new("build")).unwrap().reason,
        Some(JobReason::RunnerLost)
    );
}

#[tokio::test]
async fn test_approval_gate_blocks_until_approved() {
    let t = engine(&[r#"
name: release
jobs:
  - id: build
    steps:
      - run: make
  - id: deploy
    needs: [build]
    approval: production
    steps:
      - run: ./deploy.sh
"#]);
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    let (runner, request) = t.transport.request_for(run_id, "build").unwrap();
    t.engine
        .report_job(report(runner, &request, StepStatus::Succeeded))
        .await
        .unwrap();

    assert_eq!(job_status(&t.engine, run_id, "deploy").await, JobStatus::Pending);
    assert_eq!(t.engine.pending_approvals(run_id).await.unwrap(), vec!["production"]);

    t.engine.approve(run_id, "production").await.unwrap();
    assert_eq!(job_status(&t.engine, run_id, "deploy").await, JobStatus::Running);
}

#[tokio::test]
async fn test_approved_condition_requests_approval() {
    let t = engine(&[r#"
name: release
jobs:
  - id: deploy
    if: "approved('production')"
    steps:
      - run: ./deploy.sh
"#]);
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    assert_eq!(job_status(&t.engine, run_id, "deploy").await, JobStatus::Pending);
    assert_eq!(t.engine.pending_approvals(run_id).await.unwrap(), vec!["production"]);
    assert!(
        t.sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::ApprovalRequested(p) if p.gate == "production"))
    );

    t.engine.approve(run_id, "production").await.unwrap();
    assert_eq!(job_status(&t.engine, run_id, "deploy").await, JobStatus::Running);
    assert!(t.transport.request_for(run_id, "deploy").is_some());
}

#[tokio::test]
async fn test_secrets_resolved_at_dispatch() {
    let workflow = r#"
name: publish
jobs:
  - id: upload
    secrets: [NPM_TOKEN]
    steps:
      - run: "npm publish --token ${{ secrets.NPM_TOKEN }}"
"#;
    let t = engine_with_secrets(&[workflow], StaticSecrets::default().with("NPM_TOKEN", "abc123"));
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    let (_, request) = t.transport.request_for(run_id, "upload").unwrap();
    assert_eq!(request.secrets["NPM_TOKEN"].expose(), "abc123");
    assert_eq!(request.steps[0].run.as_deref(), Some("npm publish --token abc123"));
    assert!(!format!("{:?}", request.secrets).contains("abc123"));
}

#[tokio::test]
async fn test_missing_secret_fails_job() {
    let t = engine(&[r#"
name: publish
jobs:
  - id: upload
    secrets: [NPM_TOKEN]
    steps:
      - run: npm publish
"#]);
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];

    let run = t.engine.snapshot(run_id).await.unwrap();
    assert_eq!(
        run.job(&JobKey::new("upload")).unwrap().reason,
        Some(JobReason::SecretUnavailable {
            name: "NPM_TOKEN".into()
        })
    );
    assert!(t.transport.dispatched().is_empty());
    assert_eq!(t.engine.runners().await[0].status, RunnerStatus::Idle);
}

#[tokio::test]
async fn test_user_cancel() {
    let t = engine(&[BUILD_AND_TEST]);
    t.engine
        .register_runner(RunnerRegistration::new("r1", ["linux"]))
        .await
        .unwrap();
    let run_id = t.engine.handle_event(RepoEvent::push("refs/heads/main")).await.unwrap()[0];
    let (runner, request) = t.transport.request_for(run_id, "build").unwrap();

    t.engine.cancel_run(run_id, Some("ana".into())).await.unwrap();
    assert_eq!(t.engine.snapshot(run_id).await.unwrap().status, RunStatus::Cancelled);

    // A late report still lands the job in cancelled.
    t.engine
        .report_job(report(runner, &request, StepStatus::Succeeded))
        .await
        .unwrap();
    assert_eq!(job_status(&t.engine, run_id, "build").await, JobStatus::Cancelled);

    assert!(matches!(
        t.engine.cancel_run(run_id, None).await,
        Err(Error::RunAlreadyCompleted(_))
    ));
}

#[tokio::test]
async fn test_unknown_run() {
    let t = engine(&[BUILD_AND_TEST]);
    assert!(t.engine.snapshot(RunId::new()).await.is_none());
    assert!(matches!(
        t.engine.approve(RunId::new(), "gate").await,
        Err(Error::RunNotFound(_))
    ));
}
