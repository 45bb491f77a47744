//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted model clients
//! - A recording router and cost tracker
//! - Simple tools and a panicking observability sink
//! - Small hand-built task graphs

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use taskforge::core::{TaskGraph, TaskKind, TaskNode};
use taskforge::orchestration::{
    CostTracker, ModelClient, ModelRequest, ModelResponse, ObservabilitySink, RouteConstraints,
    RouteDecision, Router, SpanKind, TaskOutcome, Tool, ToolResult,
};
use taskforge::{Error, Result};

/// Wrap `content` in a final-output block.
pub fn final_output(content: &str, confidence: f64) -> String {
    format!(
        "<final_output confidence=\"{}\">{}</final_output>",
        confidence, content
    )
}

/// Replays canned responses in order, repeating the last one.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    work_units: u64,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Arc<Self> {
        Self::with_work_units(responses, 100)
    }

    pub fn with_work_units<S: Into<String>>(
        responses: impl IntoIterator<Item = S>,
        work_units: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            last: Mutex::new(String::new()),
            work_units,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn call_model(&self, request: ModelRequest) -> Result<ModelResponse> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let content = match self.responses.lock().unwrap().pop_front() {
            Some(next) => {
                *self.last.lock().unwrap() = next.clone();
                next
            }
            None => self.last.lock().unwrap().clone(),
        };
        Ok(ModelResponse {
            content,
            work_units: self.work_units,
            model,
            input_tokens: 100,
            output_tokens: 50,
        })
    }
}

/// Model pool stand-in: echoes the prompt, fails for prompts containing
/// "fail" and for any model in the broken set, sleeps on "slow".
/// Each call takes 5ms unless the model has its own delay.
pub struct PoolModel {
    broken: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: AtomicUsize,
}

impl PoolModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            broken: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn break_model(&self, model: &str) {
        self.broken.lock().unwrap().insert(model.to_string());
    }

    pub fn repair_model(&self, model: &str) {
        self.broken.lock().unwrap().remove(model);
    }

    pub fn set_delay(&self, model: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(model.to_string(), delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for PoolModel {
    async fn call_model(&self, request: ModelRequest) -> Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&request.model)
            .copied()
            .unwrap_or(Duration::from_millis(5));
        tokio::time::sleep(delay).await;
        if request.user_prompt.contains("slow") {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if request.user_prompt.contains("fail") || self.broken.lock().unwrap().contains(&request.model) {
            return Err(Error::ModelCallFailure(format!("{} unavailable", request.model)));
        }
        Ok(ModelResponse {
            content: format!("[{}] {}", request.model, request.user_prompt),
            work_units: 20,
            model: request.model,
            input_tokens: 200,
            output_tokens: 100,
        })
    }
}

/// Routes to the first non-excluded model and records every outcome.
pub struct RecordingRouter {
    models: Vec<String>,
    pub outcomes: Mutex<Vec<(String, String, TaskOutcome)>>,
    pub routed: Mutex<Vec<RouteConstraints>>,
}

impl RecordingRouter {
    pub fn new(models: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            models: models.iter().map(|m| m.to_string()).collect(),
            outcomes: Mutex::new(Vec::new()),
            routed: Mutex::new(Vec::new()),
        })
    }

    pub fn outcomes_for(&self, model: &str) -> Vec<TaskOutcome> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _, _)| m == model)
            .map(|(_, _, o)| o.clone())
            .collect()
    }
}

#[async_trait]
impl Router for RecordingRouter {
    async fn route(
        &self,
        _agent_id: &str,
        _task_type: &str,
        constraints: &RouteConstraints,
        _token_estimate: u64,
    ) -> Result<RouteDecision> {
        self.routed.lock().unwrap().push(constraints.clone());
        self.models
            .iter()
            .find(|m| !constraints.excludes(m))
            .map(|m| RouteDecision {
                model: m.clone(),
                estimated_cost: 0.0,
                estimated_latency: Duration::from_millis(10),
            })
            .ok_or_else(|| Error::Routing("every model is excluded".to_string()))
    }

    async fn update_stats(&self, model: &str, task_type: &str, outcome: TaskOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .push((model.to_string(), task_type.to_string(), outcome));
    }
}

/// Cost tracker with a switchable affordability answer.
pub struct RecordingCosts {
    pub affordable: AtomicBool,
    pub spends: Mutex<Vec<(String, String, f64)>>,
}

impl RecordingCosts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            affordable: AtomicBool::new(true),
            spends: Mutex::new(Vec::new()),
        })
    }

    pub fn total(&self) -> f64 {
        self.spends.lock().unwrap().iter().map(|(_, _, c)| c).sum()
    }
}

#[async_trait]
impl CostTracker for RecordingCosts {
    async fn can_afford(&self, _model: &str, _work_units: u64) -> bool {
        self.affordable.load(Ordering::SeqCst)
    }

    async fn record_spend(
        &self,
        model: &str,
        agent_id: &str,
        _input_tokens: u64,
        _output_tokens: u64,
        cost: f64,
    ) {
        self.spends
            .lock()
            .unwrap()
            .push((model.to_string(), agent_id.to_string(), cost));
    }
}

/// Panics on every span event.
pub struct PanickingSink;

impl ObservabilitySink for PanickingSink {
    fn span_started(&self, kind: SpanKind, name: &str) {
        panic!("sink rejected {} {}", kind.as_str(), name);
    }

    fn span_finished(&self, kind: SpanKind, name: &str, _elapsed: Duration, _success: bool) {
        panic!("sink rejected {} {}", kind.as_str(), name);
    }
}

/// Returns its "text" argument upper-cased.
pub struct ShoutTool;

#[async_trait]
impl Tool for ShoutTool {
    fn name(&self) -> &str {
        "shout"
    }

    fn description(&self) -> &str {
        "Upper-case the given text"
    }

    async fn execute(&self, args: Value, _cancel: CancellationToken) -> Result<ToolResult> {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        Ok(ToolResult::success(text.to_uppercase()))
    }
}

/// Never finishes on its own; notes when it is cancelled.
pub struct StuckTool {
    pub cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for StuckTool {
    fn name(&self) -> &str {
        "stuck"
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(30)
    }

    async fn execute(&self, _args: Value, cancel: CancellationToken) -> Result<ToolResult> {
        let flag = self.cancelled.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(ToolResult::success("late"))
    }
}

/// Three tasks with no dependencies on each other.
pub fn three_tasks() -> Vec<TaskNode> {
    vec![
        TaskNode::new(TaskKind::Generic, "a", "first", 1),
        TaskNode::new(TaskKind::Generic, "b", "second", 1),
        TaskNode::new(TaskKind::Generic, "c", "third", 1),
    ]
}

/// Nodes a, b, c with a -> b -> c -> a forced into the edge list.
pub fn forced_cycle() -> TaskGraph {
    use taskforge::core::TaskEdge;

    let nodes = three_tasks();
    let (a, b, c) = (nodes[0].id, nodes[1].id, nodes[2].id);
    TaskGraph {
        nodes,
        edges: vec![
            TaskEdge::depends_on(a, b),
            TaskEdge::depends_on(b, c),
            TaskEdge::depends_on(c, a),
        ],
        ..TaskGraph::default()
    }
}
