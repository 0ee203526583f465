//! Workflow definition store.
//!
//! Definitions are parsed from YAML, validated, and cached together with
//! their job graph. A run holds `Arc`s to the definition and graph it was
//! created from, so reloading never changes a run in flight.

use crate::dag::{DagBuilder, JobGraph};
use crate::triggers::parse_schedule;
use conduit_core::expr::validate_template;
use conduit_core::workflow::{EventKind, WorkflowDefinition};
use conduit_core::{DefinitionError, Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// A validated workflow with its expanded job graph.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub definition: Arc<WorkflowDefinition>,
    pub graph: Arc<JobGraph>,
    pub source: Option<PathBuf>,
    modified: Option<SystemTime>,
}

/// Outcome of loading or refreshing a directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<(PathBuf, Error)>,
}

/// Registry of loaded workflow definitions, keyed by name.
#[derive(Default)]
pub struct WorkflowStore {
    workflows: BTreeMap<String, LoadedWorkflow>,
    paths: HashMap<PathBuf, String>,
    /// Modification times of files that failed to load, so they are
    /// reported once per edit.
    rejected: HashMap<PathBuf, Option<SystemTime>>,
    builder: DagBuilder,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML document into a definition.
    pub fn parse(source: &str) -> std::result::Result<WorkflowDefinition, DefinitionError> {
        serde_yaml::from_str(source).map_err(|e| DefinitionError::Parse(e.to_string()))
    }

    /// Check a definition and build its job graph.
    pub fn validate(
        &self,
        definition: &WorkflowDefinition,
    ) -> std::result::Result<JobGraph, DefinitionError> {
        if definition.name.trim().is_empty() {
            return Err(DefinitionError::Parse("workflow name must not be empty".into()));
        }
        if definition.jobs.is_empty() {
            return Err(DefinitionError::EmptyWorkflow(definition.name.clone()));
        }

        for trigger in &definition.triggers {
            match (&trigger.kind, &trigger.cron) {
                (EventKind::Schedule, None) => {
                    return Err(DefinitionError::InvalidCron {
                        expression: String::new(),
                        message: "schedule trigger without cron expression".into(),
                    });
                }
                (EventKind::Schedule, Some(expression)) => {
                    parse_schedule(expression).map_err(|e| DefinitionError::InvalidCron {
                        expression: expression.clone(),
                        message: e.to_string(),
                    })?;
                }
                _ => {}
            }
        }

        if let Some(group) = definition.concurrency.as_ref().and_then(|c| c.group.as_deref()) {
            check_template("concurrency.group", group)?;
        }

        for job in &definition.jobs {
            if job.steps.is_empty() {
                return Err(DefinitionError::NoSteps {
                    job: job.id.clone(),
                });
            }

            for (index, step) in job.steps.iter().enumerate() {
                let invalid = |message: &str| DefinitionError::InvalidStep {
                    job: job.id.clone(),
                    step: index,
                    message: message.to_string(),
                };
                match (&step.uses, &step.run) {
                    (Some(_), Some(_)) => return Err(invalid("step has both `uses` and `run`")),
                    (None, None) => return Err(invalid("step needs one of `uses` or `run`")),
                    _ => {}
                }

                let location = format!("jobs.{}.steps[{}]", job.id, index);
                if let Some(run) = &step.run {
                    check_template(&location, run)?;
                }
                for value in step.with.values().chain(step.env.values()) {
                    check_template(&location, value)?;
                }
            }

            for template in job.outputs.values() {
                check_template(&format!("jobs.{}.outputs", job.id), template)?;
            }

            if let Some(retry) = &job.retry {
                if retry.max_attempts == 0 {
                    return Err(DefinitionError::InvalidStep {
                        job: job.id.clone(),
                        step: 0,
                        message: "retry.max_attempts must be at least 1".into(),
                    });
                }
            }

            if let Some(matrix) = &job.matrix {
                if matrix.dimensions.is_empty() && matrix.include.is_empty() {
                    return Err(DefinitionError::InvalidMatrix {
                        job: job.id.clone(),
                        message: "matrix has no dimensions".into(),
                    });
                }
                if let Some((name, _)) = matrix.dimensions.iter().find(|(_, v)| v.is_empty()) {
                    return Err(DefinitionError::InvalidMatrix {
                        job: job.id.clone(),
                        message: format!("dimension {} has no values", name),
                    });
                }
                if matrix.max_parallel == Some(0) {
                    return Err(DefinitionError::InvalidMatrix {
                        job: job.id.clone(),
                        message: "max_parallel must be at least 1".into(),
                    });
                }
            }
        }

        self.builder.build(definition)
    }

    /// Register a definition that did not come from a file.
    pub fn insert(&mut self, definition: WorkflowDefinition) -> Result<()> {
        if self.workflows.contains_key(&definition.name) {
            return Err(DefinitionError::DuplicateWorkflow(definition.name).into());
        }
        let graph = self.validate(&definition)?;
        info!(workflow = %definition.name, jobs = graph.len(), "Workflow registered");
        self.workflows.insert(
            definition.name.clone(),
            LoadedWorkflow {
                definition: Arc::new(definition),
                graph: Arc::new(graph),
                source: None,
                modified: None,
            },
        );
        Ok(())
    }

    /// Load one definition file. Returns the workflow name.
    pub fn load_file(&mut self, path: &Path) -> Result<String> {
        let (definition, graph, modified) = self.read(path)?;

        let name = definition.name.clone();
        let owner = self.workflows.get(&name).and_then(|w| w.source.as_deref());
        if self.workflows.contains_key(&name) && owner != Some(path) {
            return Err(DefinitionError::DuplicateWorkflow(name).into());
        }

        // A file renamed its workflow: drop the old entry.
        if let Some(previous) = self.paths.get(path).filter(|n| **n != name).cloned() {
            self.workflows.remove(&previous);
        }

        info!(workflow = %name, path = %path.display(), jobs = graph.len(), "Workflow loaded");
        self.paths.insert(path.to_path_buf(), name.clone());
        self.workflows.insert(
            name.clone(),
            LoadedWorkflow {
                definition: Arc::new(definition),
                graph: Arc::new(graph),
                source: Some(path.to_path_buf()),
                modified,
            },
        );
        Ok(name)
    }

    /// Load every `*.yml` / `*.yaml` file in a directory.
    pub fn load_dir(&mut self, dir: &Path) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for path in definition_files(dir)? {
            match self.load_file(&path) {
                Ok(name) => report.loaded.push(name),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Rejected workflow definition");
                    report.failed.push((path, e));
                }
            }
        }
        Ok(report)
    }

    /// Pick up changed, new and deleted files in `dir`.
    ///
    /// An edited file that no longer validates keeps its previous version.
    pub fn refresh(&mut self, dir: &Path) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let files = definition_files(dir)?;

        for path in &files {
            let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            let unchanged = self
                .paths
                .get(path)
                .and_then(|name| self.workflows.get(name))
                .is_some_and(|w| w.modified.is_some() && w.modified == modified);
            if unchanged || self.rejected.get(path) == Some(&modified) {
                continue;
            }

            match self.load_file(path) {
                Ok(name) => {
                    self.rejected.remove(path);
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Keeping previous definition");
                    self.rejected.insert(path.clone(), modified);
                    report.failed.push((path.clone(), e));
                }
            }
        }

        self.rejected.retain(|path, _| files.contains(path));

        let gone: Vec<PathBuf> = self
            .paths
            .keys()
            .filter(|p| p.starts_with(dir) && !files.contains(p))
            .cloned()
            .collect();
        for path in gone {
            if let Some(name) = self.paths.remove(&path) {
                info!(workflow = %name, path = %path.display(), "Workflow removed");
                self.workflows.remove(&name);
                report.removed.push(name);
            }
        }

        if !report.loaded.is_empty() || !report.removed.is_empty() {
            debug!(
                loaded = report.loaded.len(),
                removed = report.removed.len(),
                "Definitions refreshed"
            );
        }
        Ok(report)
    }

    pub fn get(&self, name: &str) -> Option<&LoadedWorkflow> {
        self.workflows.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<LoadedWorkflow> {
        let removed = self.workflows.remove(name)?;
        if let Some(source) = &removed.source {
            self.paths.remove(source);
        }
        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedWorkflow> {
        self.workflows.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.workflows.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    fn read(&self, path: &Path) -> Result<(WorkflowDefinition, JobGraph, Option<SystemTime>)> {
        let modified = std::fs::metadata(path)?.modified().ok();
        let contents = std::fs::read_to_string(path)?;
        let definition = Self::parse(&contents)?;
        let graph = self.validate(&definition)?;
        Ok((definition, graph, modified))
    }
}

fn check_template(location: &str, template: &str) -> std::result::Result<(), DefinitionError> {
    validate_template(template).map_err(|e| DefinitionError::InvalidExpression {
        location: location.to_string(),
        message: e.to_string(),
    })
}

fn definition_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yml" || e == "yaml");
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
