//! Multi-model task dispatch.
//!
//! The `SwarmExecutor` sends units of work to models chosen by a [`Router`],
//! protects each model with a circuit breaker, checks every call against a
//! [`CostTracker`] and races it against a timeout. Three aggregation modes:
//!
//! - `execute_parallel()`: independent tasks, all run concurrently
//! - `execute_sequential()`: a pipeline that stops at the first failure
//! - `execute_fan_out()`: one task against several models, one winner
//!
//! Concurrency is bounded by a semaphore sized from
//! `SwarmConfig::max_concurrency`. A failure, timeout or panic in one task
//! becomes a failed [`SwarmTaskResult`] and never affects its siblings.

use crate::core::task::{TaskId, TaskNode};
use crate::orchestration::breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::orchestration::model::{
    notify_finished, notify_started, ModelClient, ModelRequest, NoopSink, ObservabilitySink,
    SpanKind,
};
use crate::orchestration::routing::{
    duration_ms, CostTracker, PricingTable, RouteConstraints, RouteDecision, Router, TaskOutcome,
};
use crate::util::{panic_message, race, Race};
use crate::{tlog, tlog_debug, tlog_warn, Error, Result};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Configuration for the swarm executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Model calls allowed in flight at once.
    pub max_concurrency: usize,
    /// Timeout for tasks that do not set their own.
    pub task_timeout_ms: u64,
    /// Consecutive failures that open a model's breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// Token estimate for tasks that do not set their own.
    pub default_token_estimate: u64,
    /// Passed to the router as the cost ceiling for each task.
    pub max_cost_per_task: Option<f64>,
    pub pricing: PricingTable,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            task_timeout_ms: 60_000,
            breaker_threshold: crate::orchestration::breaker::DEFAULT_FAILURE_THRESHOLD,
            breaker_cooldown_secs: crate::orchestration::breaker::DEFAULT_COOLDOWN_SECS,
            default_token_estimate: 2_000,
            max_cost_per_task: None,
            pricing: PricingTable::default(),
        }
    }
}

impl SwarmConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_threshold,
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }
}

/// One unit of work for the swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmTask {
    pub id: TaskId,
    pub agent_id: String,
    /// Category reported to the router, e.g. "implement".
    pub task_type: String,
    pub system_prompt: String,
    pub prompt: String,
    pub token_estimate: Option<u64>,
    pub timeout_ms: Option<u64>,
    /// Skip routing and use this model.
    pub model: Option<String>,
}

impl SwarmTask {
    pub fn new(agent_id: &str, task_type: &str, prompt: &str) -> Self {
        Self {
            id: TaskId::new(),
            agent_id: agent_id.to_string(),
            task_type: task_type.to_string(),
            system_prompt: String::new(),
            prompt: prompt.to_string(),
            token_estimate: None,
            timeout_ms: None,
            model: None,
        }
    }

    /// Build a swarm task for a graph node, keeping its id.
    pub fn from_node(node: &TaskNode) -> Self {
        Self {
            id: node.id,
            token_estimate: Some(node.estimated_work_units),
            ..Self::new(&node.agent, node.kind.as_str(), &node.description)
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_token_estimate(mut self, tokens: u64) -> Self {
        self.token_estimate = Some(tokens);
        self
    }
}

/// Outcome of one swarm task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmTaskResult {
    pub task_id: TaskId,
    /// Model the task ran on. Empty if routing failed.
    pub model: String,
    pub output: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub cost: f64,
    pub work_units: u64,
}

impl SwarmTaskResult {
    fn failure(task: &SwarmTask, model: &str, error: impl ToString, latency: Duration) -> Self {
        Self {
            task_id: task.id,
            model: model.to_string(),
            output: String::new(),
            success: false,
            error: Some(error.to_string()),
            latency,
            cost: 0.0,
            work_units: 0,
        }
    }
}

/// Aggregate of `execute_parallel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelResult {
    /// One per input task, in input order.
    pub results: Vec<SwarmTaskResult>,
    pub completed: usize,
    pub failed: usize,
    pub total_cost: f64,
    /// Slowest task in the batch.
    #[serde(with = "duration_ms")]
    pub max_latency: Duration,
    /// Some but not all tasks failed.
    pub partial_failure: bool,
}

impl ParallelResult {
    fn aggregate(results: Vec<SwarmTaskResult>) -> Self {
        let completed = results.iter().filter(|r| r.success).count();
        let failed = results.len() - completed;
        Self {
            completed,
            failed,
            total_cost: results.iter().map(|r| r.cost).sum(),
            max_latency: results.iter().map(|r| r.latency).max().unwrap_or_default(),
            partial_failure: failed > 0 && failed < results.len(),
            results,
        }
    }
}

/// Predicate over the previous executed step's result (`None` for the first).
pub type StepCondition = Arc<dyn Fn(Option<&SwarmTaskResult>) -> bool + Send + Sync>;

/// One pipeline step.
#[derive(Clone)]
pub struct PipelineStep {
    pub task: SwarmTask,
    /// Returning false skips the step. Skips are not failures.
    pub condition: Option<StepCondition>,
    /// Append the previous step's output to this step's prompt.
    pub with_previous_output: bool,
}

impl PipelineStep {
    pub fn new(task: SwarmTask) -> Self {
        Self {
            task,
            condition: None,
            with_previous_output: false,
        }
    }

    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(Option<&SwarmTaskResult>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_previous_output(mut self) -> Self {
        self.with_previous_output = true;
        self
    }
}

/// Outcome of `execute_sequential`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentialResult {
    /// Results of the steps that ran, in order.
    pub results: Vec<SwarmTaskResult>,
    /// True only if every step that ran succeeded.
    pub completed: bool,
    /// Tasks whose condition returned false.
    pub skipped: Vec<TaskId>,
}

/// How `execute_fan_out` picks a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutStrategy {
    /// Fastest successful attempt.
    Best,
    /// First successful attempt in model order. This approximates majority
    /// agreement; responses are not compared.
    Consensus,
}

/// Dispatches tasks across models.
pub struct SwarmExecutor {
    config: SwarmConfig,
    model: Arc<dyn ModelClient>,
    router: Arc<dyn Router>,
    costs: Arc<dyn CostTracker>,
    breakers: CircuitBreakerRegistry,
    permits: Arc<Semaphore>,
    sink: Arc<dyn ObservabilitySink>,
    cancel: CancellationToken,
}

impl SwarmExecutor {
    pub fn new(
        config: SwarmConfig,
        model: Arc<dyn ModelClient>,
        router: Arc<dyn Router>,
        costs: Arc<dyn CostTracker>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let breakers = CircuitBreakerRegistry::new(config.breaker_config());
        Self {
            config,
            model,
            router,
            costs,
            breakers,
            permits,
            sink: Arc::new(NoopSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Tie every call to `token`; cancelling it fails in-flight calls.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn is_model_available(&self, model: &str) -> bool {
        self.breakers.is_model_available(model)
    }

    /// Run independent tasks concurrently and wait for all of them.
    pub async fn execute_parallel(&self, tasks: Vec<SwarmTask>) -> ParallelResult {
        let count = tasks.len();
        let results = join_all(tasks.iter().map(|task| self.execute_task(task))).await;
        let aggregate = ParallelResult::aggregate(results);
        tlog!(
            "Swarm batch of {}: {} completed, {} failed, cost {:.4}, max latency {:?}",
            count,
            aggregate.completed,
            aggregate.failed,
            aggregate.total_cost,
            aggregate.max_latency
        );
        aggregate
    }

    /// Run pipeline steps in order, stopping at the first failure.
    pub async fn execute_sequential(&self, pipeline: Vec<PipelineStep>) -> SequentialResult {
        let mut results: Vec<SwarmTaskResult> = Vec::new();
        let mut skipped = Vec::new();
        let mut completed = true;

        for step in pipeline {
            let previous = results.last();
            if let Some(condition) = &step.condition {
                if !condition(previous) {
                    tlog_debug!("Pipeline step {} skipped", step.task.id.short());
                    skipped.push(step.task.id);
                    continue;
                }
            }

            let mut task = step.task;
            if step.with_previous_output {
                if let Some(prev) = previous.filter(|r| r.success) {
                    task.prompt = format!("{}\n\nPrevious step output:\n{}", task.prompt, prev.output);
                }
            }

            let result = self.execute_task(&task).await;
            let failed = !result.success;
            results.push(result);
            if failed {
                tlog_warn!(
                    "Pipeline stopped at step {} ({})",
                    results.len(),
                    task.id.short()
                );
                completed = false;
                break;
            }
        }

        SequentialResult {
            results,
            completed,
            skipped,
        }
    }

    /// Run the same task on every model and pick one result.
    ///
    /// Every attempt is captured on its own; one model failing does not
    /// affect the others. Models are used as given, without routing.
    pub async fn execute_fan_out(
        &self,
        task: &SwarmTask,
        models: &[String],
        strategy: FanOutStrategy,
    ) -> SwarmTaskResult {
        if models.is_empty() {
            return SwarmTaskResult::failure(task, "", "fan-out needs at least one model", Duration::ZERO);
        }

        let attempts = join_all(
            models
                .iter()
                .map(|model| isolated(task, model, self.execute_on(task, model))),
        )
        .await;

        let winner = match strategy {
            FanOutStrategy::Best => attempts
                .iter()
                .filter(|r| r.success)
                .min_by_key(|r| r.latency),
            FanOutStrategy::Consensus => attempts.iter().find(|r| r.success),
        };

        match winner {
            Some(result) => {
                tlog_debug!(
                    "Fan-out ({:?}) over {} models won by {}",
                    strategy,
                    models.len(),
                    result.model
                );
                result.clone()
            }
            None => {
                let errors: Vec<String> = attempts
                    .iter()
                    .map(|r| format!("{}: {}", r.model, r.error.as_deref().unwrap_or("unknown error")))
                    .collect();
                let latency = attempts.iter().map(|r| r.latency).max().unwrap_or_default();
                SwarmTaskResult::failure(
                    task,
                    "",
                    format!("all {} models failed: {}", models.len(), errors.join("; ")),
                    latency,
                )
            }
        }
    }

    /// Route and run one task.
    pub async fn execute_task(&self, task: &SwarmTask) -> SwarmTaskResult {
        let model = match &task.model {
            Some(model) => model.clone(),
            None => match self.route(task).await {
                Ok(decision) => decision.model,
                Err(e) => {
                    tlog_warn!("Routing failed for {}: {}", task.id.short(), e);
                    return SwarmTaskResult::failure(task, "", e, Duration::ZERO);
                }
            },
        };
        isolated(task, &model, self.execute_on(task, &model)).await
    }

    async fn route(&self, task: &SwarmTask) -> Result<RouteDecision> {
        let constraints = RouteConstraints {
            excluded_models: self.breakers.open_models(),
            max_cost: self.config.max_cost_per_task,
        };
        let estimate = task
            .token_estimate
            .unwrap_or(self.config.default_token_estimate);
        self.router
            .route(&task.agent_id, &task.task_type, &constraints, estimate)
            .await
    }

    /// Run `task` on `model` with breaker, budget and timeout checks.
    async fn execute_on(&self, task: &SwarmTask, model: &str) -> SwarmTaskResult {
        // Breaker and budget checks run under the permit.
        let Ok(_permit) = self.permits.acquire().await else {
            return SwarmTaskResult::failure(task, model, "worker pool closed", Duration::ZERO);
        };

        if !self.breakers.is_model_available(model) {
            let err = Error::CircuitBreakerOpen {
                model: model.to_string(),
            };
            return SwarmTaskResult::failure(task, model, err, Duration::ZERO);
        }

        let estimate = task
            .token_estimate
            .unwrap_or(self.config.default_token_estimate);
        if !self.costs.can_afford(model, estimate).await {
            let err = Error::BudgetExceeded {
                model: model.to_string(),
            };
            tlog_warn!("{}", err);
            return SwarmTaskResult::failure(task, model, err, Duration::ZERO);
        }

        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.task_timeout());
        let request = ModelRequest {
            system_prompt: task.system_prompt.clone(),
            user_prompt: task.prompt.clone(),
            agent_id: task.agent_id.clone(),
            model: model.to_string(),
            cache: false,
        };

        let token = self.cancel.child_token();
        let started = Instant::now();
        notify_started(&*self.sink, SpanKind::SwarmTask, model);
        let outcome = race(timeout, &token, self.model.call_model(request)).await;
        let latency = started.elapsed();

        let result = match outcome {
            Race::Finished(Ok(response)) => {
                let cost = self
                    .config
                    .pricing
                    .cost(model, response.input_tokens, response.output_tokens);
                self.costs
                    .record_spend(
                        model,
                        &task.agent_id,
                        response.input_tokens,
                        response.output_tokens,
                        cost,
                    )
                    .await;
                let quality = if response.content.trim().is_empty() { 0.5 } else { 1.0 };
                self.router
                    .update_stats(
                        model,
                        &task.task_type,
                        TaskOutcome {
                            success: true,
                            quality,
                            latency,
                            cost,
                        },
                    )
                    .await;
                self.breakers.record_success(model);
                SwarmTaskResult {
                    task_id: task.id,
                    model: model.to_string(),
                    output: response.content,
                    success: true,
                    error: None,
                    latency,
                    cost,
                    work_units: response.work_units,
                }
            }
            Race::Cancelled => SwarmTaskResult::failure(task, model, "cancelled", latency),
            failed => {
                let err = match failed {
                    Race::Finished(Err(e)) => e,
                    _ => Error::ModelTimeout(timeout),
                };
                tlog_warn!("Task {} failed on {}: {}", task.id.short(), model, err);
                self.router
                    .update_stats(
                        model,
                        &task.task_type,
                        TaskOutcome {
                            success: false,
                            quality: 0.0,
                            latency,
                            cost: 0.0,
                        },
                    )
                    .await;
                self.breakers.record_failure(model);
                SwarmTaskResult::failure(task, model, err, latency)
            }
        };

        notify_finished(&*self.sink, SpanKind::SwarmTask, model, latency, result.success);
        result
    }
}

/// Turn a panic inside `fut` into a failed result for `task`.
async fn isolated<F>(task: &SwarmTask, model: &str, fut: F) -> SwarmTaskResult
where
    F: Future<Output = SwarmTaskResult>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => SwarmTaskResult::failure(
            task,
            model,
            format!("panic: {}", panic_message(&*panic)),
            Duration::ZERO,
        ),
    }
}
