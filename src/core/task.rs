//! Task data model for the planning graph.
//!
//! Tasks are the atomic units of work handed to an agent. Each task tracks
//! its kind, assigned agent, estimated work, priority and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a task within a graph.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What a task does. Drives the default agent and work estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Spec,
    Design,
    Implement,
    Test,
    Analyze,
    Fix,
    Review,
    Generic,
    /// A half of a task that was split during replanning.
    Subtask,
}

impl TaskKind {
    /// Agent that handles this kind of task unless overridden.
    pub fn default_agent(&self) -> &'static str {
        match self {
            TaskKind::Spec => "spec-writer",
            TaskKind::Design => "architect",
            TaskKind::Implement | TaskKind::Fix => "coder",
            TaskKind::Test => "tester",
            TaskKind::Analyze => "analyst",
            TaskKind::Review => "reviewer",
            TaskKind::Generic | TaskKind::Subtask => "generalist",
        }
    }

    /// Estimated work units (token-equivalents) for this kind of task.
    pub fn default_work_units(&self) -> u64 {
        match self {
            TaskKind::Spec | TaskKind::Analyze => 2_000,
            TaskKind::Design | TaskKind::Review => 3_000,
            TaskKind::Test | TaskKind::Generic | TaskKind::Subtask => 4_000,
            TaskKind::Fix => 5_000,
            TaskKind::Implement => 8_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Spec => "spec",
            TaskKind::Design => "design",
            TaskKind::Implement => "implement",
            TaskKind::Test => "test",
            TaskKind::Analyze => "analyze",
            TaskKind::Fix => "fix",
            TaskKind::Review => "review",
            TaskKind::Generic => "generic",
            TaskKind::Subtask => "subtask",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task status in its lifecycle.
///
/// `pending → running → {completed | failed | blocked}`. A blocked task may
/// return to pending once unblocked; a failed task only re-enters pending
/// through replanning.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created, waiting for its dependencies or a free agent.
    #[default]
    Pending,
    /// Task is currently being executed by an agent.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task blocked and cannot proceed.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
}

impl TaskStatus {
    /// Bare state name without the attached message.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }

    /// Whether an external status update may move a task from `self` to `next`.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Blocked { .. })
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed { .. })
                | (TaskStatus::Running, TaskStatus::Blocked { .. })
                | (TaskStatus::Blocked { .. }, TaskStatus::Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// A single task in the planning graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// What the task does.
    pub kind: TaskKind,
    /// Short human-readable name.
    pub name: String,
    /// Agent responsible for the task. Empty means unassigned.
    pub agent: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Declared prerequisites (in addition to the priority chain).
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Estimated work in token-equivalents; the critical path weight.
    pub estimated_work_units: u64,
    /// Current execution status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Higher priority runs earlier in the chain.
    pub priority: u32,
    /// Free-form annotations (replan history, split lineage, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// When the task started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    /// Create a pending task with the kind's default agent and work estimate.
    pub fn new(kind: TaskKind, name: &str, description: &str, priority: u32) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            name: name.to_string(),
            agent: kind.default_agent().to_string(),
            description: description.to_string(),
            dependencies: Vec::new(),
            estimated_work_units: kind.default_work_units(),
            status: TaskStatus::Pending,
            priority,
            metadata: BTreeMap::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = agent.to_string();
        self
    }

    pub fn with_work_units(mut self, units: u64) -> Self {
        self.estimated_work_units = units;
        self
    }

    pub fn with_dependency(mut self, id: TaskId) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    /// Transitions status to Running and records the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Transitions status to Completed and records the completion time.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
    }

    /// Put a failed task back in the queue. Only the planner calls this.
    pub(crate) fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
    }

    /// Apply a validated status, stamping timestamps the first time.
    pub(crate) fn apply_status(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Running => self.start(),
            TaskStatus::Completed => self.complete(),
            TaskStatus::Failed { error } => self.fail(&error),
            TaskStatus::Blocked { reason } => self.block(&reason),
            TaskStatus::Pending => self.status = TaskStatus::Pending,
        }
    }

    /// Check if the task has no agent assigned.
    pub fn is_unassigned(&self) -> bool {
        self.agent.trim().is_empty()
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Ids of the tasks that replaced this one after a split, if any.
    pub fn superseded_by(&self) -> Vec<TaskId> {
        self.metadata
            .get(SUPERSEDED_BY_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Whether replanning replaced this task with subtasks.
    pub fn is_superseded(&self) -> bool {
        self.metadata.contains_key(SUPERSEDED_BY_KEY)
    }
}

/// Metadata key listing the subtasks that replaced a split task.
pub const SUPERSEDED_BY_KEY: &str = "superseded_by";
