use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Graph too large: {count} tasks exceeds the ceiling of {max}")]
    GraphTooLarge { count: usize, max: usize },

    #[error("Circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    #[error("Task {0} has no assigned agent")]
    UnassignedTask(TaskId),

    #[error("Edge {from} -> {to} references a task that is not in the graph")]
    DanglingEdge { from: TaskId, to: TaskId },

    #[error("Replan limit exceeded after {max} attempts")]
    ReplanLimitExceeded { max: u32 },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Tool {tool} denied: {reason}")]
    ToolPermissionDenied { tool: String, reason: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool {tool} timed out after {timeout:?}")]
    ToolTimeout { tool: String, timeout: Duration },

    #[error("Tool {tool} failed: {message}")]
    ToolExecutionFailure { tool: String, message: String },

    #[error("Model call timed out after {0:?}")]
    ModelTimeout(Duration),

    #[error("Model call failed: {0}")]
    ModelCallFailure(String),

    #[error("Budget exceeded for model {model}")]
    BudgetExceeded { model: String },

    #[error("Circuit breaker open for model {model}")]
    CircuitBreakerOpen { model: String },

    #[error("Routing failed: {0}")]
    Routing(String),
}

pub type Result<T> = std::result::Result<T, Error>;
