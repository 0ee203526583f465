//! Command handlers.

use crate::local::{ConsoleSink, EnvSecrets, LocalTransport, RunnerMessage};
use anyhow::{Context, bail};
use chrono::Utc;
use conduit_core::events::Event;
use conduit_core::run::RunStatus;
use conduit_core::runner::RunnerRegistration;
use conduit_core::trigger::RepoEvent;
use conduit_core::workflow::{EventKind, WorkflowDefinition};
use conduit_engine::triggers::TriggerMatcher;
use conduit_engine::{Engine, EngineConfig, WorkflowStore};
use console::style;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Validate definition files, or every definition in a directory.
pub fn validate(paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("Failed to read {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e == "yml" || e == "yaml")
                })
                .collect();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(path.clone());
        }
    }

    if files.is_empty() {
        println!("{} No workflow definitions found", style("i").blue());
        return Ok(());
    }

    let mut store = WorkflowStore::new();
    let mut invalid = 0;
    for file in &files {
        match store.load_file(file) {
            Ok(name) => {
                let jobs = store.get(&name).map(|w| w.graph.len()).unwrap_or_default();
                println!(
                    "{} {} ({} jobs) {}",
                    style("✓").green(),
                    style(&name).bold(),
                    jobs,
                    style(file.display()).dim()
                );
            }
            Err(e) => {
                invalid += 1;
                println!("{} {}: {}", style("✗").red(), file.display(), e);
            }
        }
    }

    if invalid > 0 {
        bail!("{} of {} definitions are invalid", invalid, files.len());
    }
    Ok(())
}

/// Print the expanded job graph in dispatch order.
pub fn plan(path: &Path) -> anyhow::Result<()> {
    let mut store = WorkflowStore::new();
    let name = store.load_file(path)?;
    let workflow = store
        .get(&name)
        .context("Workflow disappeared after loading")?;
    let definition = &workflow.definition;

    println!("{} {}", style("Workflow").bold(), style(&definition.name).cyan());
    if let Some(description) = &definition.description {
        println!("  {}", style(description).dim());
    }
    for trigger in &definition.triggers {
        match &trigger.cron {
            Some(cron) => println!("  on {} ({})", trigger.kind, cron),
            None => println!("  on {}", trigger.kind),
        }
    }
    if let Some(concurrency) = &definition.concurrency {
        println!(
            "  concurrency {}{}",
            concurrency.group.as_deref().unwrap_or("<workflow>-<ref>"),
            if concurrency.cancel_in_progress {
                " (cancel in progress)"
            } else {
                ""
            }
        );
    }
    println!();

    for node in workflow.graph.nodes() {
        println!("{} {}", style("●").blue(), style(&node.key).bold());

        let needs: Vec<String> = workflow
            .graph
            .dependencies(&node.key)
            .iter()
            .map(|dep| dep.key.to_string())
            .collect();
        if !needs.is_empty() {
            println!("    needs:   {}", needs.join(", "));
        }
        if !node.labels.is_empty() {
            let labels: Vec<&str> = node.labels.iter().map(String::as_str).collect();
            println!("    runs-on: {}", labels.join(", "));
        }
        if !node.matrix.is_empty() {
            let values: Vec<String> = node
                .matrix
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            println!("    matrix:  {}", values.join(", "));
        }
        if let Some(condition) = &node.definition.condition {
            println!("    if:      {}", condition);
        }
        if let Some(gate) = &node.definition.approval {
            println!("    approval: {}", gate);
        }
        println!(
            "    steps:   {} (timeout {}m)",
            node.definition.steps.len(),
            node.definition.timeout_minutes
        );
    }

    Ok(())
}

/// Show which workflows in `dir` an event would start.
pub fn match_event(
    dir: &Path,
    kind: EventKind,
    git_ref: String,
    base_ref: Option<String>,
    action: Option<String>,
    paths: Vec<String>,
) -> anyhow::Result<()> {
    let mut store = WorkflowStore::new();
    let report = store.load_dir(dir)?;
    for (path, error) in &report.failed {
        println!("{} {}: {}", style("!").yellow(), path.display(), error);
    }

    let mut event = RepoEvent::new(kind, git_ref).with_paths(paths);
    event.base_ref = base_ref;
    if let Some(action) = action {
        event = event.with_action(action);
    }

    let matched = TriggerMatcher::new().matching(&store, &event);
    if matched.is_empty() {
        println!("{} No workflows match {} {}", style("i").blue(), kind, event.git_ref);
        return Ok(());
    }
    for name in matched {
        println!("{} {}", style("▶").cyan(), style(name).bold());
    }
    Ok(())
}

/// Print a JSON schema for definitions or events.
pub fn schema(events: bool) -> anyhow::Result<()> {
    let schema = if events {
        schemars::schema_for!(Event)
    } else {
        schemars::schema_for!(WorkflowDefinition)
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub event: EventKind,
    pub git_ref: String,
    pub runners: usize,
    pub labels: Vec<String>,
    pub approve: Vec<String>,
}

/// Run one workflow end to end on in-process runners.
///
/// Gates listed in `approve` are granted up front; any other gate a job
/// waits on is rejected.
pub async fn run_local(path: &Path, options: RunOptions) -> anyhow::Result<()> {
    let mut config = EngineConfig::load(options.config.as_deref())?;
    config.reload_definitions = false;

    let mut store = WorkflowStore::new();
    let name = store.load_file(path)?;
    let labels: BTreeSet<String> = if options.labels.is_empty() {
        store
            .get(&name)
            .map(|w| w.graph.nodes().flat_map(|n| n.labels.iter().cloned()).collect())
            .unwrap_or_default()
    } else {
        options.labels.iter().cloned().collect()
    };

    let workspace = std::env::current_dir()?;
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let transport = Arc::new(LocalTransport::new(workspace, reports_tx));
    let engine = Engine::new(config, store, transport)
        .with_secrets(Arc::new(EnvSecrets))
        .with_sink(Arc::new(ConsoleSink));

    let mut runner_ids = Vec::new();
    for n in 1..=options.runners.max(1) {
        let registration = RunnerRegistration::new(format!("local-{}", n), labels.iter().cloned());
        runner_ids.push(engine.register_runner(registration).await?.id);
    }

    let event = RepoEvent::new(options.event, options.git_ref);
    let run_id = engine.trigger(&name, event).await?;
    for gate in &options.approve {
        engine.approve(run_id, gate).await?;
    }

    let mut ticker = tokio::time::interval(engine.config().tick_interval());
    let mut interrupted = false;

    loop {
        match engine.snapshot(run_id).await {
            Some(run) if run.completed_at.is_some() => break,
            Some(_) => {}
            None => bail!("Run {} disappeared", run_id),
        }

        tokio::select! {
            Some(message) = reports.recv() => {
                let outcome = match message {
                    RunnerMessage::Step { run_id, job, step } => {
                        engine.report_step(run_id, &job, step).await
                    }
                    RunnerMessage::Finished(report) => engine.report_job(report).await,
                    RunnerMessage::Cancelled { run_id, job } => {
                        engine.acknowledge_cancel(run_id, &job).await
                    }
                };
                if let Err(e) = outcome {
                    debug!(error = %e, "Ignored runner message");
                }
            }
            _ = ticker.tick() => {
                for id in &runner_ids {
                    engine.heartbeat(*id).await?;
                }
                for gate in engine.pending_approvals(run_id).await? {
                    warn!(gate = %gate, "No approval given, rejecting");
                    engine.reject(run_id, &gate).await?;
                }
                engine.sweep(Utc::now()).await?;
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!("{} Cancelling run...", style("!").yellow());
                engine.cancel_run(run_id, Some("ctrl-c".into())).await?;
            }
        }
    }

    let status = engine
        .snapshot(run_id)
        .await
        .map(|run| run.status)
        .unwrap_or(RunStatus::Failed);
    if status != RunStatus::Succeeded {
        bail!("Run {} {}", run_id, status);
    }
    Ok(())
}
