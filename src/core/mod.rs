//! Core domain models for task planning.
//!
//! This module contains the data structures the planner produces and the
//! orchestrator consumes: tasks, the intent that spawns them, and the task
//! graph with its pure scheduling algorithms.

pub mod graph;
pub mod intent;
pub mod task;

pub use graph::{EdgeKind, TaskEdge, TaskGraph};
pub use intent::{Intent, IntentKind};
pub use task::{TaskId, TaskKind, TaskNode, TaskStatus};
