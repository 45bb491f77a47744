//! Per-model circuit breakers.
//!
//! The `CircuitBreakerRegistry` tracks consecutive failures for every model
//! the swarm calls. Once a model reaches the failure threshold its breaker
//! opens and the model is excluded from routing. There is no background
//! timer: the breaker closes lazily, on the first availability check made
//! after the cooldown has elapsed.
//!
//! The map is guarded by a `std::sync::Mutex`. No method holds the lock
//! across an `.await`.

use crate::{tlog_debug, tlog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default consecutive failures before a breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default time an open breaker keeps its model out of rotation.
pub const DEFAULT_COOLDOWN_SECS: u64 = 600; // 10 minutes

/// Breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long after the last failure an open breaker stays open.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
        }
    }
}

/// Breaker state for one model.
#[derive(Debug, Clone, Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    /// Monotonic clock, used for the cooldown comparison.
    last_failure: Option<Instant>,
    /// Wall clock, for snapshots.
    last_failure_at: Option<DateTime<Utc>>,
    open: bool,
}

impl BreakerEntry {
    fn cooldown_elapsed(&self, cooldown: Duration) -> bool {
        self.last_failure
            .map(|at| at.elapsed() > cooldown)
            .unwrap_or(true)
    }
}

/// Serializable view of one model's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub model_id: String,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub open: bool,
}

/// Circuit breakers for every model seen so far.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BreakerEntry>> {
        // A panic while holding the lock cannot leave an entry half-written,
        // so a poisoned map is still usable.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `model` may be routed to.
    ///
    /// An open breaker whose cooldown has elapsed is closed here and its
    /// failure count reset.
    pub fn is_model_available(&self, model: &str) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(model) else {
            return true;
        };
        if !entry.open {
            return true;
        }
        if entry.cooldown_elapsed(self.config.cooldown) {
            tlog_debug!("Circuit breaker for {} closed after cooldown", model);
            entry.open = false;
            entry.consecutive_failures = 0;
            return true;
        }
        false
    }

    /// Record a failed call. Returns true if this failure opened the breaker.
    pub fn record_failure(&self, model: &str) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(model.to_string()).or_default();
        entry.consecutive_failures += 1;
        entry.last_failure = Some(Instant::now());
        entry.last_failure_at = Some(Utc::now());

        let opened = !entry.open && entry.consecutive_failures >= self.config.failure_threshold;
        if opened {
            entry.open = true;
            tlog_warn!(
                "Circuit breaker opened for {} after {} consecutive failures",
                model,
                entry.consecutive_failures
            );
        }
        opened
    }

    /// Record a successful call, closing the breaker.
    pub fn record_success(&self, model: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(model) {
            if entry.open {
                tlog_debug!("Circuit breaker for {} closed by success", model);
            }
            entry.consecutive_failures = 0;
            entry.open = false;
        }
    }

    /// Forget everything about one model.
    pub fn reset(&self, model: &str) {
        self.lock().remove(model);
    }

    pub fn reset_all(&self) {
        self.lock().clear();
    }

    pub fn consecutive_failures(&self, model: &str) -> u32 {
        self.lock()
            .get(model)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Models whose breaker is open and still cooling down.
    ///
    /// Does not close expired breakers; the next availability check does.
    pub fn open_models(&self) -> Vec<String> {
        let entries = self.lock();
        let mut models: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.open && !e.cooldown_elapsed(self.config.cooldown))
            .map(|(model, _)| model.clone())
            .collect();
        models.sort();
        models
    }

    /// Current state of every tracked model, sorted by model id.
    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let entries = self.lock();
        let mut states: Vec<CircuitBreakerState> = entries
            .iter()
            .map(|(model, e)| CircuitBreakerState {
                model_id: model.clone(),
                consecutive_failures: e.consecutive_failures,
                last_failure_time: e.last_failure_at,
                open: e.open,
            })
            .collect();
        states.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        states
    }
}
