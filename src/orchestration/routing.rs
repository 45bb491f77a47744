//! Model routing, spend tracking and pricing.
//!
//! The swarm does not choose models itself. A [`Router`] picks one per unit of
//! work and learns from reported outcomes, and a [`CostTracker`] answers
//! whether a call is affordable. Both are external collaborators; the
//! in-memory [`StaticRouter`] and [`BudgetLedger`] cover simple deployments
//! and tests.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// Limits the router must respect for one decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConstraints {
    /// Models that must not be chosen (open circuit breakers, fan-out exclusions).
    #[serde(default)]
    pub excluded_models: Vec<String>,
    /// Highest acceptable estimated cost for the call, in dollars.
    pub max_cost: Option<f64>,
}

impl RouteConstraints {
    pub fn excludes(&self, model: &str) -> bool {
        self.excluded_models.iter().any(|m| m == model)
    }
}

/// The router's choice for one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub model: String,
    pub estimated_cost: f64,
    #[serde(with = "duration_ms")]
    pub estimated_latency: Duration,
}

/// What happened when a routed call ran. Feeds future routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    /// 0.0 for failures.
    pub quality: f64,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub cost: f64,
}

/// Picks a model for a unit of work.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(
        &self,
        agent_id: &str,
        task_type: &str,
        constraints: &RouteConstraints,
        token_estimate: u64,
    ) -> Result<RouteDecision>;

    async fn update_stats(&self, model: &str, task_type: &str, outcome: TaskOutcome);
}

/// Tracks spend against a budget.
#[async_trait]
pub trait CostTracker: Send + Sync {
    async fn can_afford(&self, model: &str, work_units: u64) -> bool;

    async fn record_spend(
        &self,
        model: &str,
        agent_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    );
}

/// Per-million-token rates for one model, in dollars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_per_million: 1.0,
            output_per_million: 3.0,
        }
    }
}

impl ModelPricing {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost in dollars for the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input = input_tokens as f64 * self.input_per_million / 1_000_000.0;
        let output = output_tokens as f64 * self.output_per_million / 1_000_000.0;
        input + output
    }
}

/// Rates for known models plus a fallback for everything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default)]
    pub models: BTreeMap<String, ModelPricing>,
    #[serde(default)]
    pub fallback: ModelPricing,
}

impl PricingTable {
    pub fn with_model(mut self, model: &str, pricing: ModelPricing) -> Self {
        self.models.insert(model.to_string(), pricing);
        self
    }

    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.models.get(model).copied().unwrap_or(self.fallback)
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.pricing_for(model).cost(input_tokens, output_tokens)
    }
}

/// Running routing statistics for one `(model, task type)` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub calls: u64,
    pub successes: u64,
    pub total_quality: f64,
    pub total_latency_ms: u64,
    pub total_cost: f64,
}

impl ModelStats {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.successes as f64 / self.calls as f64
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.calls == 0 {
            return None;
        }
        Some(Duration::from_millis(self.total_latency_ms / self.calls))
    }
}

/// Router over a fixed preference list.
///
/// Picks the first model that is neither excluded nor over the cost limit,
/// estimating cost from the pricing table. Outcomes are kept as statistics
/// and do not change the preference order.
#[derive(Debug)]
pub struct StaticRouter {
    models: Vec<String>,
    pricing: PricingTable,
    default_latency: Duration,
    stats: Mutex<HashMap<(String, String), ModelStats>>,
}

impl StaticRouter {
    pub fn new(models: Vec<String>, pricing: PricingTable) -> Self {
        Self {
            models,
            pricing,
            default_latency: Duration::from_secs(5),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self, model: &str, task_type: &str) -> ModelStats {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(model.to_string(), task_type.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn route(
        &self,
        _agent_id: &str,
        _task_type: &str,
        constraints: &RouteConstraints,
        token_estimate: u64,
    ) -> Result<RouteDecision> {
        for model in &self.models {
            if constraints.excludes(model) {
                continue;
            }
            let estimated_cost = self.pricing.cost(model, token_estimate, token_estimate);
            if constraints.max_cost.is_some_and(|max| estimated_cost > max) {
                continue;
            }
            return Ok(RouteDecision {
                model: model.clone(),
                estimated_cost,
                estimated_latency: self.default_latency,
            });
        }
        Err(Error::Routing(format!(
            "no eligible model among {} candidates",
            self.models.len()
        )))
    }

    async fn update_stats(&self, model: &str, task_type: &str, outcome: TaskOutcome) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        let entry = stats
            .entry((model.to_string(), task_type.to_string()))
            .or_default();
        entry.calls += 1;
        if outcome.success {
            entry.successes += 1;
        }
        entry.total_quality += outcome.quality;
        entry.total_latency_ms += outcome.latency.as_millis() as u64;
        entry.total_cost += outcome.cost;
    }
}

/// In-memory spend ledger with an optional dollar cap.
///
/// Affordability is checked against the fallback or model rate applied to
/// `work_units` as output tokens.
#[derive(Debug)]
pub struct BudgetLedger {
    limit: Option<f64>,
    pricing: PricingTable,
    spent: Mutex<f64>,
}

impl BudgetLedger {
    pub fn new(limit: Option<f64>, pricing: PricingTable) -> Self {
        Self {
            limit,
            pricing,
            spent: Mutex::new(0.0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, PricingTable::default())
    }

    pub fn spent(&self) -> f64 {
        *self.spent.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CostTracker for BudgetLedger {
    async fn can_afford(&self, model: &str, work_units: u64) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };
        let estimate = self.pricing.cost(model, 0, work_units);
        self.spent() + estimate <= limit
    }

    async fn record_spend(
        &self,
        _model: &str,
        _agent_id: &str,
        _input_tokens: u64,
        _output_tokens: u64,
        cost: f64,
    ) {
        *self.spent.lock().unwrap_or_else(|p| p.into_inner()) += cost;
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
