//! Task graph planner.
//!
//! The `TaskGraphPlanner` turns an [`Intent`] into a [`TaskGraph`] of typed
//! tasks, validates it, and repairs it when a task fails:
//!
//! - `decompose()` builds the graph from a per-intent template
//! - `replan()` records a failure and either requeues the task or, for
//!   timeout and resource-limit failures, splits it into two halves
//! - `update_task_status()` applies lifecycle transitions
//!
//! The planner is synchronous and never hand-patches derived graph data:
//! after any node mutation the edges, parallel groups and critical path are
//! recomputed from the nodes. Validation failures come back as data in
//! [`DecompositionResult::validation_errors`], not as `Err`.

use crate::core::intent::{Intent, IntentKind};
use crate::core::task::{TaskId, TaskKind, TaskNode, TaskStatus, SUPERSEDED_BY_KEY};
use crate::core::TaskGraph;
use crate::{tlog, tlog_debug, tlog_warn, Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Default ceiling on the number of tasks a decomposition may produce.
pub const DEFAULT_MAX_NODES: usize = 50;

/// Default number of replans allowed per graph.
pub const DEFAULT_MAX_REPLAN_ATTEMPTS: u32 = 3;

/// Failures that mean the task was too big rather than wrong.
static RESOURCE_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(timed?\s*out|timeout|deadline exceeded|resource limit|out of memory|memory limit|token limit|context length|quota|too large)",
    )
    .unwrap()
});

/// Metadata key holding the last failure message recorded by `replan`.
pub const LAST_ERROR_KEY: &str = "last_error";

/// Metadata key holding how many times a task has been replanned.
pub const REPLAN_ATTEMPTS_KEY: &str = "replan_attempts";

/// Metadata key on split halves pointing back at the original task.
pub const SPLIT_FROM_KEY: &str = "split_from";

/// Configuration for the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Decompositions producing more tasks than this fail fast.
    pub max_nodes: usize,
    /// Replans allowed before `replan` refuses.
    pub max_replan_attempts: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
            max_replan_attempts: DEFAULT_MAX_REPLAN_ATTEMPTS,
        }
    }
}

/// Optional hints for `decompose`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecomposeContext {
    /// Components to implement separately. Create and modify intents emit
    /// one implement task per component.
    pub components: Vec<String>,
    /// Agent to use instead of the kind's default.
    pub agent_overrides: HashMap<TaskKind, String>,
}

impl DecomposeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, component: &str) -> Self {
        self.components.push(component.to_string());
        self
    }

    pub fn with_agent(mut self, kind: TaskKind, agent: &str) -> Self {
        self.agent_overrides.insert(kind, agent.to_string());
        self
    }
}

/// Outcome of `decompose` or `replan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionResult {
    pub graph: TaskGraph,
    /// True when the graph passed every validation check.
    pub architecture_validated: bool,
    pub validation_errors: Vec<String>,
    pub replan_count: u32,
}

impl DecompositionResult {
    fn rejected(graph: TaskGraph, error: Error) -> Self {
        let replan_count = graph.replan_count;
        Self {
            graph,
            architecture_validated: false,
            validation_errors: vec![error.to_string()],
            replan_count,
        }
    }
}

/// Builds and repairs task graphs.
#[derive(Debug, Clone, Default)]
pub struct TaskGraphPlanner {
    config: PlannerConfig,
}

impl TaskGraphPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Decompose an intent into a validated task graph.
    ///
    /// Templates by intent kind:
    /// - create / modify: spec → design → implement (one per component) → test
    /// - fix: analyze → fix → test
    /// - review: a single review task
    /// - other: a single generic task
    ///
    /// If the template would exceed `max_nodes` the result carries an empty
    /// graph and a `GraphTooLarge` error.
    pub fn decompose(
        &self,
        intent: &Intent,
        context: Option<&DecomposeContext>,
    ) -> DecompositionResult {
        let default_context = DecomposeContext::default();
        let context = context.unwrap_or(&default_context);

        let mut nodes = template(intent, context);
        if nodes.len() > self.config.max_nodes {
            tlog_warn!(
                "Decomposition of {:?} produced {} tasks (max {})",
                intent.description,
                nodes.len(),
                self.config.max_nodes
            );
            return DecompositionResult::rejected(
                TaskGraph::new(),
                Error::GraphTooLarge {
                    count: nodes.len(),
                    max: self.config.max_nodes,
                },
            );
        }

        for node in &mut nodes {
            if let Some(agent) = context.agent_overrides.get(&node.kind) {
                node.agent = agent.clone();
            }
        }

        let graph = TaskGraph::from_nodes(nodes);
        tlog!(
            "Decomposed {} intent into {} tasks ({} work units)",
            intent.kind,
            graph.task_count(),
            graph.estimated_total_work
        );
        self.finish(graph)
    }

    /// Repair a graph after `failed_task` failed with `error`.
    ///
    /// Returns the untouched graph with an error once the graph has been
    /// replanned `max_replan_attempts` times, or when the task is unknown,
    /// was already split, or is neither running nor failed.
    pub fn replan(&self, graph: &TaskGraph, failed_task: &TaskId, error: &str) -> DecompositionResult {
        if graph.replan_count >= self.config.max_replan_attempts {
            tlog_warn!(
                "Replan refused for {}: limit of {} reached",
                failed_task.short(),
                self.config.max_replan_attempts
            );
            return DecompositionResult::rejected(
                graph.clone(),
                Error::ReplanLimitExceeded {
                    max: self.config.max_replan_attempts,
                },
            );
        }

        let Some(idx) = graph.nodes.iter().position(|n| n.id == *failed_task) else {
            return DecompositionResult::rejected(graph.clone(), Error::TaskNotFound(*failed_task));
        };
        if graph.nodes[idx].is_superseded() {
            return DecompositionResult::rejected(
                graph.clone(),
                Error::Validation(format!(
                    "task {} was already split; replan its subtasks instead",
                    failed_task.short()
                )),
            );
        }
        let status = &graph.nodes[idx].status;
        if !matches!(status, TaskStatus::Running | TaskStatus::Failed { .. }) {
            return DecompositionResult::rejected(
                graph.clone(),
                Error::Validation(format!(
                    "task {} is {}; only running or failed tasks can be replanned",
                    failed_task.short(),
                    status.label()
                )),
            );
        }

        let mut next = graph.clone();
        next.replan_count += 1;
        let attempt = next.replan_count;

        let node = &mut next.nodes[idx];
        node.fail(error);
        node.priority = node.priority.saturating_add(1);
        node.metadata
            .insert(LAST_ERROR_KEY.to_string(), serde_json::json!(error));
        node.metadata
            .insert(REPLAN_ATTEMPTS_KEY.to_string(), serde_json::json!(attempt));

        if RESOURCE_FAILURE_RE.is_match(error) {
            tlog!(
                "Replan {}: splitting {} after resource failure",
                attempt,
                failed_task.short()
            );
            split_task(&mut next, idx);
        } else {
            tlog!("Replan {}: requeueing {}", attempt, failed_task.short());
            next.nodes[idx].requeue();
        }

        next.recompute();
        self.finish(next)
    }

    /// Apply a status change to one task.
    ///
    /// Setting the status a task already has is a no-op. `failed → pending`
    /// is not allowed here; use `replan`.
    pub fn update_task_status(
        &self,
        graph: &mut TaskGraph,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<()> {
        let task = graph
            .get_task_mut(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?;

        if task.status == status {
            return Ok(());
        }
        if !task.status.can_transition_to(&status) {
            return Err(Error::InvalidTransition {
                from: task.status.label().to_string(),
                to: status.label().to_string(),
            });
        }

        tlog_debug!("Task {} {} -> {}", task_id.short(), task.status, status);
        task.apply_status(status);
        Ok(())
    }

    /// Every dependency cycle in the graph.
    pub fn detect_circular_dependencies(&self, graph: &TaskGraph) -> Vec<Vec<TaskId>> {
        graph.detect_cycles()
    }

    /// Pending tasks whose prerequisites have all completed.
    pub fn get_ready_tasks<'a>(&self, graph: &'a TaskGraph) -> Vec<&'a TaskNode> {
        graph.ready_tasks()
    }

    /// Topological execution order.
    pub fn get_execution_order(&self, graph: &TaskGraph) -> Vec<TaskId> {
        graph.execution_order()
    }

    /// Check a graph, returning every problem found.
    ///
    /// Order: dangling edges, cycles, unassigned agents.
    pub fn validate(&self, graph: &TaskGraph) -> Vec<Error> {
        let mut errors: Vec<Error> = graph
            .dangling_edges()
            .into_iter()
            .map(|e| Error::DanglingEdge {
                from: e.from,
                to: e.to,
            })
            .collect();

        for cycle in graph.detect_cycles() {
            let names: Vec<String> = cycle
                .iter()
                .map(|id| match graph.get_task(id) {
                    Some(task) => format!("{} ({})", task.name, id.short()),
                    None => id.short(),
                })
                .collect();
            errors.push(Error::CircularDependency {
                cycle: names.join(" -> "),
            });
        }

        errors.extend(
            graph
                .active_nodes()
                .filter(|n| n.is_unassigned())
                .map(|n| Error::UnassignedTask(n.id)),
        );
        errors
    }

    fn finish(&self, graph: TaskGraph) -> DecompositionResult {
        let errors = self.validate(&graph);
        if !errors.is_empty() {
            tlog_warn!("Graph failed validation with {} errors", errors.len());
        }
        DecompositionResult {
            architecture_validated: errors.is_empty(),
            validation_errors: errors.iter().map(ToString::to_string).collect(),
            replan_count: graph.replan_count,
            graph,
        }
    }
}

/// Task template for an intent.
fn template(intent: &Intent, context: &DecomposeContext) -> Vec<TaskNode> {
    let desc = intent.description.as_str();
    match intent.kind {
        IntentKind::Create | IntentKind::Modify => {
            let verb = if intent.kind == IntentKind::Create {
                "Build"
            } else {
                "Change"
            };
            let mut nodes = vec![
                TaskNode::new(TaskKind::Spec, "spec", &format!("Specify requirements for: {}", desc), 40),
                TaskNode::new(TaskKind::Design, "design", &format!("Design the architecture for: {}", desc), 30),
            ];
            if context.components.is_empty() {
                nodes.push(TaskNode::new(
                    TaskKind::Implement,
                    "implement",
                    &format!("{}: {}", verb, desc),
                    20,
                ));
            } else {
                nodes.extend(context.components.iter().map(|component| {
                    TaskNode::new(
                        TaskKind::Implement,
                        &format!("implement-{}", component),
                        &format!("{} the {} component for: {}", verb, component, desc),
                        20,
                    )
                }));
            }
            nodes.push(TaskNode::new(TaskKind::Test, "test", &format!("Test: {}", desc), 10));
            nodes
        }
        IntentKind::Fix => vec![
            TaskNode::new(TaskKind::Analyze, "analyze", &format!("Find the root cause of: {}", desc), 30),
            TaskNode::new(TaskKind::Fix, "fix", &format!("Fix: {}", desc), 20),
            TaskNode::new(TaskKind::Test, "test", &format!("Verify the fix for: {}", desc), 10),
        ],
        IntentKind::Review => vec![TaskNode::new(TaskKind::Review, "review", &format!("Review: {}", desc), 10)],
        IntentKind::Other => vec![TaskNode::new(TaskKind::Generic, "task", desc, 10)],
    }
}

/// Replace `graph.nodes[idx]` with two half-weight subtasks.
///
/// Part 1 inherits the original's declared dependencies, part 2 depends on
/// part 1, and tasks that declared a dependency on the original now depend on
/// part 2. The original stays `failed` and is marked superseded.
fn split_task(graph: &mut TaskGraph, idx: usize) {
    let original = graph.nodes[idx].clone();
    let weight = original.estimated_work_units;
    let first_weight = (weight - weight / 2).max(1);
    let second_weight = (weight / 2).max(1);

    let mut part1 = TaskNode::new(
        TaskKind::Subtask,
        &format!("{} (part 1)", original.name),
        &format!("Part 1 of: {}", original.description),
        original.priority,
    )
    .with_agent(&original.agent)
    .with_work_units(first_weight);
    part1.dependencies = original.dependencies.clone();
    part1
        .metadata
        .insert(SPLIT_FROM_KEY.to_string(), serde_json::json!(original.id));

    let mut part2 = TaskNode::new(
        TaskKind::Subtask,
        &format!("{} (part 2)", original.name),
        &format!("Part 2 of: {}", original.description),
        original.priority,
    )
    .with_agent(&original.agent)
    .with_work_units(second_weight)
    .with_dependency(part1.id);
    part2
        .metadata
        .insert(SPLIT_FROM_KEY.to_string(), serde_json::json!(original.id));

    for node in graph.nodes.iter_mut() {
        for dep in node.dependencies.iter_mut() {
            if *dep == original.id {
                *dep = part2.id;
            }
        }
    }

    graph.nodes[idx].metadata.insert(
        SUPERSEDED_BY_KEY.to_string(),
        serde_json::json!([part1.id, part2.id]),
    );
    graph.nodes.push(part1);
    graph.nodes.push(part2);
}
