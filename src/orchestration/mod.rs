//! Orchestration layer for taskforge.
//!
//! This module turns intents into task graphs, runs each task through a
//! bounded reasoning loop with tool access, and dispatches model calls across
//! a pool of models with circuit breakers, budgets and timeouts. External
//! systems (models, tools, routing, spend tracking, tracing) are reached only
//! through the traits defined here.

mod agent_loop;
mod breaker;
mod model;
mod planner;
mod routing;
mod swarm;
mod tools;

pub use agent_loop::{
    parse_final_output, AgentExecutionLoop, AgentLoopConfig, AgentLoopResult, FinalOutput,
    StopReason, DEFAULT_CONFIDENCE, NO_TOOLS,
};
pub use breaker::{
    BreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, DEFAULT_COOLDOWN_SECS,
    DEFAULT_FAILURE_THRESHOLD,
};
pub use model::{
    LogSink, ModelClient, ModelRequest, ModelResponse, NoopSink, ObservabilitySink, SpanKind,
};
pub use planner::{
    DecomposeContext, DecompositionResult, PlannerConfig, TaskGraphPlanner, DEFAULT_MAX_NODES,
    DEFAULT_MAX_REPLAN_ATTEMPTS, LAST_ERROR_KEY, REPLAN_ATTEMPTS_KEY, SPLIT_FROM_KEY,
};
pub use routing::{
    BudgetLedger, CostTracker, ModelPricing, ModelStats, PricingTable, RouteConstraints,
    RouteDecision, Router, StaticRouter, TaskOutcome,
};
pub use swarm::{
    FanOutStrategy, ParallelResult, PipelineStep, SequentialResult, StepCondition, SwarmConfig,
    SwarmExecutor, SwarmTask, SwarmTaskResult,
};
pub use tools::{
    format_tool_results, parse_tool_calls, StaticToolRegistry, Tool, ToolCall, ToolExecution,
    ToolPermission, ToolRegistry, ToolResult, DEFAULT_TOOL_TIMEOUT_SECS,
};
