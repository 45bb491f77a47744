//! Integration test suite for taskforge.
//!
//! These tests drive the planner, the agent loop and the swarm executor
//! through their public API with scripted collaborators, checking the
//! behavior a caller relies on end to end.
//!
//! # Test Categories
//!
//! - `planning`: Decomposition, ordering, readiness, status updates, replanning
//! - `agent_loop`: Turn-loop termination and tool handling
//! - `swarm`: Parallel, pipeline and fan-out dispatch with circuit breakers
//!
//! # CI Compatibility
//!
//! Every model and tool is an in-process stub; no network calls are made.

mod fixtures;

mod agent_loop;
mod planning;
