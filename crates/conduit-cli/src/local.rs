//! In-process runners for `conduit run`.
//!
//! Jobs execute as shell steps on this machine. Step outputs are captured via
//! the `$CONDUIT_OUTPUT` file and every line of output is masked before it is
//! printed.

use async_trait::async_trait;
use chrono::Utc;
use conduit_core::events::Event;
use conduit_core::ports::{DispatchRequest, DispatchStep, EventSink, RunnerTransport, SecretProvider};
use conduit_core::run::{JobReport, JobStatus, StepResult, StepStatus};
use conduit_core::secrets::{SecretValue, mask};
use conduit_core::{Error, JobKey, Result, RunId, RunnerId};
use console::style;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

/// What local runners report back to the driver loop.
#[derive(Debug)]
pub enum RunnerMessage {
    Step {
        run_id: RunId,
        job: JobKey,
        step: StepResult,
    },
    Finished(JobReport),
    Cancelled {
        run_id: RunId,
        job: JobKey,
    },
}

type ActiveJobs = Arc<Mutex<HashMap<(RunId, JobKey), oneshot::Sender<()>>>>;

/// Runs dispatched jobs as local tasks.
pub struct LocalTransport {
    workspace: PathBuf,
    reports: mpsc::UnboundedSender<RunnerMessage>,
    active: ActiveJobs,
}

impl LocalTransport {
    pub fn new(workspace: PathBuf, reports: mpsc::UnboundedSender<RunnerMessage>) -> Self {
        Self {
            workspace,
            reports,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl RunnerTransport for LocalTransport {
    async fn dispatch(&self, runner: RunnerId, request: DispatchRequest) -> Result<()> {
        let key = (request.run_id, request.job.clone());
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.active.lock().await.insert(key.clone(), cancel_tx);

        let workspace = self.workspace.clone();
        let reports = self.reports.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let (run_id, job) = key.clone();
            tokio::select! {
                report = execute_job(runner, &workspace, request, &reports) => {
                    let _ = reports.send(RunnerMessage::Finished(report));
                }
                _ = cancel_rx => {
                    debug!(run_id = %run_id, job = %job, "Local job stopped");
                    let _ = reports.send(RunnerMessage::Cancelled { run_id, job });
                }
            }
            active.lock().await.remove(&key);
        });

        Ok(())
    }

    async fn cancel(&self, _runner: RunnerId, run_id: RunId, job: &JobKey) -> Result<()> {
        if let Some(stop) = self.active.lock().await.remove(&(run_id, job.clone())) {
            let _ = stop.send(());
        }
        Ok(())
    }
}

/// Execute a job's steps in order. Steps after a failure are skipped.
pub async fn execute_job(
    runner: RunnerId,
    workspace: &Path,
    request: DispatchRequest,
    reports: &mpsc::UnboundedSender<RunnerMessage>,
) -> JobReport {
    let secrets: Vec<SecretValue> = request.secrets.values().cloned().collect();
    let mut results = Vec::with_capacity(request.steps.len());
    let mut failed = false;

    for step in &request.steps {
        let result = if failed {
            StepResult {
                index: step.index,
                name: step.name.clone(),
                status: StepStatus::Skipped,
                exit_code: None,
                outputs: BTreeMap::new(),
                started_at: None,
                completed_at: None,
            }
        } else {
            execute_step(step, &request, workspace, &secrets).await
        };

        if result.status == StepStatus::Failed && !step.continue_on_error {
            failed = true;
        }

        let _ = reports.send(RunnerMessage::Step {
            run_id: request.run_id,
            job: request.job.clone(),
            step: result.clone(),
        });
        results.push(result);
    }

    JobReport {
        run_id: request.run_id,
        job: request.job,
        runner_id: runner,
        steps: results,
        outputs: BTreeMap::new(),
    }
}

async fn execute_step(
    step: &DispatchStep,
    request: &DispatchRequest,
    workspace: &Path,
    secrets: &[SecretValue],
) -> StepResult {
    let started_at = Utc::now();
    let (status, exit_code, outputs) = match (&step.run, &step.uses) {
        (Some(script), _) => {
            let prefix = format!("[{}]", request.job);
            match run_shell(script, step, request, workspace, secrets, prefix).await {
                Ok(shell) if shell.success => (StepStatus::Succeeded, shell.exit_code, shell.outputs),
                Ok(shell) => (StepStatus::Failed, shell.exit_code, shell.outputs),
                Err(e) => {
                    warn!(job = %request.job, step = %step.name, error = %e, "Failed to start step");
                    (StepStatus::Failed, None, BTreeMap::new())
                }
            }
        }
        (None, Some(uses)) => {
            warn!(job = %request.job, step = %step.name, uses = %uses, "Action steps are not executed locally");
            (StepStatus::Succeeded, None, BTreeMap::new())
        }
        (None, None) => (StepStatus::Succeeded, None, BTreeMap::new()),
    };

    StepResult {
        index: step.index,
        name: step.name.clone(),
        status,
        exit_code,
        outputs,
        started_at: Some(started_at),
        completed_at: Some(Utc::now()),
    }
}

struct ShellOutcome {
    success: bool,
    exit_code: Option<i32>,
    outputs: BTreeMap<String, String>,
}

async fn run_shell(
    script: &str,
    step: &DispatchStep,
    request: &DispatchRequest,
    workspace: &Path,
    secrets: &[SecretValue],
    prefix: String,
) -> std::io::Result<ShellOutcome> {
    let output_file = tempfile::NamedTempFile::new()?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd.current_dir(workspace);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.env("CONDUIT_OUTPUT", output_file.path());
    for (k, v) in &request.env {
        cmd.env(k, v);
    }
    for (k, v) in &step.env {
        cmd.env(k, v);
    }
    for (k, v) in &step.with {
        cmd.env(input_var(k), v);
    }
    for (k, v) in &request.secrets {
        cmd.env(k, v.expose());
    }

    let mut child = cmd.spawn()?;

    let stdout_handle = child
        .stdout
        .take()
        .map(|out| tokio::spawn(stream_lines(out, prefix.clone(), secrets.to_vec(), false)));
    let stderr_handle = child
        .stderr
        .take()
        .map(|err| tokio::spawn(stream_lines(err, prefix, secrets.to_vec(), true)));

    let status = child.wait().await?;

    if let Some(handle) = stdout_handle {
        let _ = handle.await;
    }
    if let Some(handle) = stderr_handle {
        let _ = handle.await;
    }

    let content = tokio::fs::read_to_string(output_file.path())
        .await
        .unwrap_or_default();

    Ok(ShellOutcome {
        success: status.success(),
        exit_code: status.code(),
        outputs: parse_outputs(&content),
    })
}

async fn stream_lines<R>(reader: R, prefix: String, secrets: Vec<SecretValue>, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = mask(&line, &secrets);
        if stderr {
            println!("  {} {}", style(&prefix).dim(), style(line).red().dim());
        } else {
            println!("  {} {}", style(&prefix).dim(), line);
        }
    }
}

/// `with:` inputs are exposed as `INPUT_<NAME>`.
fn input_var(name: &str) -> String {
    format!("INPUT_{}", name.to_uppercase().replace(['-', ' '], "_"))
}

/// Parse `$CONDUIT_OUTPUT` content.
///
/// Format: `key=value` or `key<<DELIM` followed by lines up to `DELIM`.
pub fn parse_outputs(content: &str) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        if let Some((key, delimiter)) = line.split_once("<<") {
            let delimiter = delimiter.trim();
            let mut value = Vec::new();
            for body in lines.by_ref() {
                if body.trim_end() == delimiter {
                    break;
                }
                value.push(body);
            }
            let key = key.trim();
            if !key.is_empty() {
                outputs.insert(key.to_string(), value.join("\n"));
            }
        } else if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                outputs.insert(key.to_string(), value.trim().to_string());
            }
        }
    }

    outputs
}

/// Secrets from the environment: `CONDUIT_SECRET_<NAME>`, then `<NAME>`.
pub struct EnvSecrets;

#[async_trait]
impl SecretProvider for EnvSecrets {
    async fn resolve(&self, name: &str) -> Result<SecretValue> {
        std::env::var(format!("CONDUIT_SECRET_{}", name))
            .or_else(|_| std::env::var(name))
            .map(SecretValue::new)
            .map_err(|_| Error::SecretNotFound(name.to_string()))
    }
}

/// Prints status transitions to the terminal.
pub struct ConsoleSink;

#[async_trait]
impl EventSink for ConsoleSink {
    async fn publish(&self, event: Event) -> Result<()> {
        match &event {
            Event::RunQueued(p) if p.waiting_for_group => {
                println!(
                    "{} {} #{} waiting for concurrency group {}",
                    style("…").yellow(),
                    style(&p.workflow).bold(),
                    p.run_number,
                    p.concurrency_key.as_deref().unwrap_or_default()
                );
            }
            Event::RunStarted(p) => {
                println!(
                    "{} {} #{} ({} jobs)",
                    style("▶").cyan(),
                    style(&p.workflow).bold(),
                    p.run_number,
                    p.job_count
                );
            }
            Event::JobStarted(p) => {
                let attempt = if p.attempt > 1 {
                    format!(" (attempt {})", p.attempt)
                } else {
                    String::new()
                };
                println!("{} {}{}", style("●").blue(), style(&p.job).bold(), attempt);
            }
            Event::JobCompleted(p) => {
                let icon = match p.status {
                    JobStatus::Succeeded => style("✓").green(),
                    JobStatus::Failed => style("✗").red(),
                    JobStatus::Cancelled => style("⊘").yellow(),
                    _ => style("○").dim(),
                };
                let duration = p
                    .duration_ms
                    .map(|ms| format!(" ({:.2}s)", ms as f64 / 1000.0))
                    .unwrap_or_default();
                println!("{} {} {}{}", icon, style(&p.job).bold(), style(&p.reason).dim(), duration);
            }
            Event::JobRetried(p) => {
                println!(
                    "{} {} retrying after {} (attempt {})",
                    style("↻").yellow(),
                    style(&p.job).bold(),
                    p.reason,
                    p.attempt
                );
            }
            Event::StepCompleted(p) if p.status == StepStatus::Failed => {
                let code = p.exit_code.map(|c| format!(" exit code {}", c)).unwrap_or_default();
                println!("  {} {}{}", style("✗").red(), p.name, code);
            }
            Event::ApprovalRequested(p) => {
                println!(
                    "{} {} waiting for approval gate {}",
                    style("!").yellow(),
                    style(&p.job).bold(),
                    style(&p.gate).bold()
                );
            }
            Event::RunCancelled(p) => {
                println!("{} Run cancelled: {}", style("!").yellow(), p.cause);
            }
            Event::RunCompleted(p) => {
                let icon = match p.status {
                    conduit_core::run::RunStatus::Succeeded => style("✓").green(),
                    conduit_core::run::RunStatus::Cancelled => style("⊘").yellow(),
                    _ => style("✗").red(),
                };
                println!(
                    "{} {} #{} {} in {:.2}s ({} succeeded, {} failed, {} skipped, {} cancelled)",
                    icon,
                    style(&p.workflow).bold(),
                    p.run_number,
                    p.status,
                    p.duration_ms as f64 / 1000.0,
                    p.jobs_succeeded,
                    p.jobs_failed,
                    p.jobs_skipped,
                    p.jobs_cancelled
                );
            }
            other => debug!(subject = %other.subject(), "Event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::DispatchId;
    use pretty_assertions::assert_eq;

    fn shell_step(index: usize, script: &str) -> DispatchStep {
        DispatchStep {
            index,
            name: format!("step {}", index + 1),
            uses: None,
            run: Some(script.to_string()),
            with: BTreeMap::new(),
            env: BTreeMap::new(),
            continue_on_error: false,
        }
    }

    fn request(steps: Vec<DispatchStep>) -> DispatchRequest {
        DispatchRequest {
            dispatch_id: DispatchId::new(),
            run_id: RunId::new(),
            job: JobKey::new("build"),
            attempt: 1,
            steps,
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            secrets: BTreeMap::from([("TOKEN".to_string(), SecretValue::new("s3cret"))]),
            permissions: BTreeMap::new(),
            timeout_minutes: 5,
        }
    }

    #[test]
    fn test_parse_outputs() {
        let content = "version=1.2.3\n\n  \nnotes<<EOF\nline one\nline two\nEOF\n=ignored\nempty=\n";
        let outputs = parse_outputs(content);

        assert_eq!(outputs.get("version").map(String::as_str), Some("1.2.3"));
        assert_eq!(outputs.get("notes").map(String::as_str), Some("line one\nline two"));
        assert_eq!(outputs.get("empty").map(String::as_str), Some(""));
        assert_eq!(outputs.len(), 3);
    }

    #[test]
    fn test_input_var() {
        assert_eq!(input_var("node-version"), "INPUT_NODE_VERSION");
    }

    #[tokio::test]
    async fn test_execute_job_stops_after_failure() {
        let workspace = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = RunnerId::new();

        let mut with_input = shell_step(1, "echo \"version=$INPUT_NAME-$GREETING\" >> \"$CONDUIT_OUTPUT\"");
        with_input.with.insert("name".into(), "app".into());

        let steps = vec![
            shell_step(0, "echo building"),
            with_input,
            shell_step(2, "exit 3"),
            shell_step(3, "echo unreachable"),
        ];

        let report = execute_job(runner, workspace.path(), request(steps), &tx).await;

        let statuses: Vec<StepStatus> = report.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Succeeded,
                StepStatus::Succeeded,
                StepStatus::Failed,
                StepStatus::Skipped
            ]
        );
        assert_eq!(report.runner_id, runner);
        assert_eq!(report.steps[2].exit_code, Some(3));
        assert_eq!(
            report.steps[1].outputs.get("version").map(String::as_str),
            Some("app-hello")
        );

        drop(tx);
        let mut streamed = 0;
        while let Some(message) = rx.recv().await {
            assert!(matches!(message, RunnerMessage::Step { .. }));
            streamed += 1;
        }
        assert_eq!(streamed, 4);
    }

    #[tokio::test]
    async fn test_continue_on_error_step() {
        let workspace = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut flaky = shell_step(0, "exit 1");
        flaky.continue_on_error = true;
        let steps = vec![flaky, shell_step(1, "test \"$TOKEN\" = s3cret")];

        let report = execute_job(RunnerId::new(), workspace.path(), request(steps), &tx).await;

        assert_eq!(report.steps[0].status, StepStatus::Failed);
        assert_eq!(report.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_stops_local_job() {
        let workspace = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = LocalTransport::new(workspace.path().to_path_buf(), tx);

        let request = request(vec![shell_step(0, "sleep 30")]);
        let (run_id, job) = (request.run_id, request.job.clone());
        let runner = RunnerId::new();

        transport.dispatch(runner, request).await.unwrap();
        transport.cancel(runner, run_id, &job).await.unwrap();

        match rx.recv().await {
            Some(RunnerMessage::Cancelled { run_id: r, job: j }) => {
                assert_eq!(r, run_id);
                assert_eq!(j, job);
            }
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_env_secrets_missing() {
        let err = EnvSecrets
            .resolve("CONDUIT_TEST_SECRET_THAT_IS_NOT_SET")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretNotFound(_)));
    }
}
