//! DAG resolution for workflow jobs.
//!
//! Matrix jobs are expanded before the graph is built, so every node is one
//! schedulable job execution.

use crate::matrix::MatrixExpander;
use conduit_core::DefinitionError;
use conduit_core::JobKey;
use conduit_core::expr::{Condition, ExprContext, NeedResult};
use conduit_core::run::{JobExecution, JobReason, JobStatus};
use conduit_core::trigger::RepoEvent;
use conduit_core::workflow::{JobDefinition, WorkflowDefinition};
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// A node in the job DAG.
#[derive(Debug, Clone)]
pub struct JobNode {
    pub key: JobKey,
    pub job_id: String,
    pub display_name: String,
    pub definition: JobDefinition,
    pub matrix: BTreeMap<String, String>,
    pub condition: Condition,
    pub labels: BTreeSet<String>,
}

impl JobNode {
    pub fn is_required(&self) -> bool {
        !self.definition.continue_on_error
    }

    pub fn max_parallel(&self) -> Option<u32> {
        self.definition.matrix.as_ref().and_then(|m| m.max_parallel)
    }

    pub fn fail_fast(&self) -> bool {
        self.definition.matrix.as_ref().is_some_and(|m| m.fail_fast)
    }
}

/// Outcome of a readiness check.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready,
    Blocked(BlockReason),
    Skip(JobReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    /// At least one dependency has not finished.
    Dependencies,
    /// Waiting for a manual approval.
    Approval(String),
    /// The matrix `max_parallel` limit is reached.
    MaxParallel,
}

/// The slice of run state readiness depends on.
pub struct RunView<'a> {
    pub event: &'a RepoEvent,
    pub env: &'a BTreeMap<String, String>,
    pub jobs: &'a BTreeMap<JobKey, JobExecution>,
    pub approvals: &'a BTreeSet<String>,
    pub rejections: &'a BTreeSet<String>,
    pub cancelled: bool,
}

/// Directed acyclic graph of job executions.
#[derive(Debug)]
pub struct JobGraph {
    graph: DiGraph<JobNode, ()>,
    key_to_index: HashMap<JobKey, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl JobGraph {
    /// Nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &JobNode> {
        self.order.iter().map(|&idx| &self.graph[idx])
    }

    pub fn node(&self, key: &JobKey) -> Option<&JobNode> {
        self.key_to_index.get(key).map(|&idx| &self.graph[idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Nodes without dependencies.
    pub fn roots(&self) -> Vec<&JobNode> {
        self.nodes()
            .filter(|node| self.dependencies(&node.key).is_empty())
            .collect()
    }

    /// Nodes that must finish before `key` may start.
    pub fn dependencies(&self, key: &JobKey) -> Vec<&JobNode> {
        self.neighbors(key, Direction::Incoming)
    }

    /// Nodes that wait on `key`.
    pub fn dependents(&self, key: &JobKey) -> Vec<&JobNode> {
        self.neighbors(key, Direction::Outgoing)
    }

    /// Other expansions of the same matrix job.
    pub fn siblings(&self, key: &JobKey) -> Vec<&JobNode> {
        self.nodes()
            .filter(|node| node.job_id == key.job_id() && node.key != *key)
            .collect()
    }

    fn neighbors(&self, key: &JobKey, direction: Direction) -> Vec<&JobNode> {
        self.key_to_index
            .get(key)
            .map(|&idx| {
                let mut nodes: Vec<&JobNode> = self
                    .graph
                    .neighbors_directed(idx, direction)
                    .map(|n| &self.graph[n])
                    .collect();
                nodes.sort_by(|a, b| a.key.cmp(&b.key));
                nodes
            })
            .unwrap_or_default()
    }

    /// Decide whether a pending job can be queued.
    ///
    /// Pure over `view`: calling it again on unchanged state gives the same
    /// answer.
    pub fn readiness(&self, key: &JobKey, view: &RunView<'_>) -> Readiness {
        let Some(node) = self.node(key) else {
            return Readiness::Blocked(BlockReason::Dependencies);
        };

        let dependencies = self.dependencies(key);
        let finished = dependencies.iter().all(|dep| {
            view.jobs
                .get(&dep.key)
                .is_some_and(|exec| exec.status.is_terminal())
        });
        if !finished {
            return Readiness::Blocked(BlockReason::Dependencies);
        }

        let needs = aggregate_needs(&dependencies, view.jobs);

        // `approved()` in the condition waits for a decision, unless the
        // condition is false even with every open gate granted.
        let mut seen = BTreeSet::new();
        let mut gates = node.condition.approval_gates();
        gates.retain(|g| seen.insert(g.clone()));
        let undecided: Vec<&String> = gates
            .iter()
            .filter(|g| !view.approvals.contains(*g) && !view.rejections.contains(*g))
            .collect();
        if let Some(gate) = undecided.first() {
            let granted: BTreeSet<String> = view
                .approvals
                .iter()
                .chain(undecided.iter().copied())
                .cloned()
                .collect();
            let ctx = condition_context(node, view, &needs, &granted);
            if node.condition.evaluate(&ctx) {
                return Readiness::Blocked(BlockReason::Approval((*gate).clone()));
            }
        }

        let ctx = condition_context(node, view, &needs, view.approvals);
        if !node.condition.evaluate(&ctx) {
            if !ctx.needs_satisfied() {
                return Readiness::Skip(JobReason::DependencyFailed);
            }
            if let Some(gate) = gates.iter().find(|g| view.rejections.contains(*g)) {
                return Readiness::Skip(JobReason::ApprovalRejected { gate: gate.clone() });
            }
            return Readiness::Skip(JobReason::ConditionFalse);
        }

        if let Some(gate) = &node.definition.approval {
            if view.rejections.contains(gate) {
                return Readiness::Skip(JobReason::ApprovalRejected { gate: gate.clone() });
            }
            if !view.approvals.contains(gate) {
                return Readiness::Blocked(BlockReason::Approval(gate.clone()));
            }
        }

        if let Some(limit) = node.max_parallel() {
            let active = self
                .siblings(key)
                .iter()
                .filter_map(|sibling| view.jobs.get(&sibling.key))
                .filter(|exec| matches!(exec.status, JobStatus::Queued | JobStatus::Running))
                .count();
            if active >= limit as usize {
                return Readiness::Blocked(BlockReason::MaxParallel);
            }
        }

        Readiness::Ready
    }
}

fn condition_context<'a>(
    node: &'a JobNode,
    view: &RunView<'a>,
    needs: &BTreeMap<String, NeedResult>,
    approvals: &'a BTreeSet<String>,
) -> ExprContext<'a> {
    let mut ctx = ExprContext::new(view.event)
        .with_env(view.env)
        .with_env(&node.definition.env)
        .with_matrix(&node.matrix)
        .with_approvals(approvals)
        .with_cancelled(view.cancelled);
    for (job_id, result) in needs {
        ctx = ctx.with_need(job_id.clone(), result.clone());
    }
    ctx
}

/// Collapse matrix expansions of each dependency into one `needs` entry.
pub(crate) fn aggregate_needs(
    dependencies: &[&JobNode],
    jobs: &BTreeMap<JobKey, JobExecution>,
) -> BTreeMap<String, NeedResult> {
    let mut grouped: BTreeMap<String, Vec<(&JobNode, &JobExecution)>> = BTreeMap::new();
    for dep in dependencies {
        if let Some(exec) = jobs.get(&dep.key) {
            grouped.entry(dep.job_id.clone()).or_default().push((dep, exec));
        }
    }

    grouped
        .into_iter()
        .map(|(job_id, execs)| {
            let statuses: Vec<JobStatus> = execs.iter().map(|(_, e)| e.status).collect();
            let status = if statuses.contains(&JobStatus::Failed) {
                JobStatus::Failed
            } else if statuses.contains(&JobStatus::Cancelled) {
                JobStatus::Cancelled
            } else if statuses.iter().all(|s| *s == JobStatus::Skipped) {
                JobStatus::Skipped
            } else {
                JobStatus::Succeeded
            };
            let tolerated = execs.iter().all(|(node, _)| !node.is_required());
            let mut outputs = BTreeMap::new();
            for (_, exec) in &execs {
                outputs.extend(exec.outputs.clone());
            }
            (
                job_id,
                NeedResult {
                    status,
                    tolerated,
                    outputs,
                },
            )
        })
        .collect()
}

/// Builder for constructing job DAGs.
pub struct DagBuilder {
    expander: MatrixExpander,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self {
            expander: MatrixExpander::new(),
        }
    }

    /// Build a DAG from a workflow definition.
    pub fn build(&self, workflow: &WorkflowDefinition) -> Result<JobGraph, DefinitionError> {
        if workflow.jobs.is_empty() {
            return Err(DefinitionError::EmptyWorkflow(workflow.name.clone()));
        }

        self.check_acyclic(workflow)?;

        let mut graph = DiGraph::new();
        let mut key_to_index = HashMap::new();
        let mut expansions: HashMap<&str, Vec<NodeIndex>> = HashMap::new();

        for job in &workflow.jobs {
            let condition = Condition::parse(job.condition.as_deref()).map_err(|e| {
                DefinitionError::InvalidExpression {
                    location: format!("jobs.{}.if", job.id),
                    message: e.to_string(),
                }
            })?;

            let variants: Vec<(JobKey, String, BTreeMap<String, String>)> =
                match self.expander.expand(job) {
                    Some(expansion) => expansion
                        .jobs
                        .into_iter()
                        .map(|m| (m.key, m.display_name, m.values))
                        .collect(),
                    None => vec![(
                        JobKey::new(job.id.as_str()),
                        job.display_name().to_string(),
                        BTreeMap::new(),
                    )],
                };

            if variants.is_empty() {
                return Err(DefinitionError::InvalidMatrix {
                    job: job.id.clone(),
                    message: "matrix expands to no combinations".to_string(),
                });
            }

            for (key, display_name, matrix) in variants {
                let idx = graph.add_node(JobNode {
                    key: key.clone(),
                    job_id: job.id.clone(),
                    display_name,
                    definition: job.clone(),
                    matrix,
                    condition: condition.clone(),
                    labels: job.labels(),
                });
                key_to_index.insert(key, idx);
                expansions.entry(job.id.as_str()).or_default().push(idx);
            }
        }

        for job in &workflow.jobs {
            for dep in &job.needs {
                for &from in &expansions[dep.as_str()] {
                    for &to in &expansions[job.id.as_str()] {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| DefinitionError::CycleDetected {
            jobs: vec![graph[cycle.node_id()].job_id.clone()],
        })?;

        Ok(JobGraph {
            graph,
            key_to_index,
            order,
        })
    }

    /// Reject unknown dependencies and cycles at the job level.
    fn check_acyclic(&self, workflow: &WorkflowDefinition) -> Result<(), DefinitionError> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for job in &workflow.jobs {
            if index.insert(job.id.as_str(), graph.add_node(job.id.as_str())).is_some() {
                return Err(DefinitionError::DuplicateJob(job.id.clone()));
            }
        }

        for job in &workflow.jobs {
            for dep in &job.needs {
                let from = index.get(dep.as_str()).ok_or_else(|| {
                    DefinitionError::UnknownDependency {
                        job: job.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.add_edge(*from, index[job.id.as_str()], ());
            }
        }

        for component in tarjan_scc(&graph) {
            let self_loop = component.len() == 1 && graph.contains_edge(component[0], component[0]);
            if component.len() > 1 || self_loop {
                let start = *component.iter().min().unwrap_or(&component[0]);
                let path = cycle_path(&graph, &component, start);
                return Err(DefinitionError::CycleDetected {
                    jobs: path.iter().map(|&idx| graph[idx].to_string()).collect(),
                });
            }
        }

        Ok(())
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shortest path from `start` back to itself inside a strongly connected
/// component, returned closed (`a, b, a`).
fn cycle_path(graph: &DiGraph<&str, ()>, component: &[NodeIndex], start: NodeIndex) -> Vec<NodeIndex> {
    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(current) = queue.pop_front() {
        for next in graph.neighbors_directed(current, Direction::Outgoing) {
            if next == start {
                let mut path = vec![start, current];
                let mut cursor = current;
                while let Some(&prev) = previous.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                // `path` runs backwards from the closing edge to `start`.
                path.reverse();
                if path.first() != Some(&start) {
                    path.insert(0, start);
                }
                return path;
            }
            if members.contains(&next) && next != start && !previous.contains_key(&next) {
                previous.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    vec![start, start]
}
