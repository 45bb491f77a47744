//! Model invocation and observability seams.

use crate::util::panic_message;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// One call to a language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub agent_id: String,
    pub model: String,
    /// Allow the provider to reuse a cached prompt prefix.
    #[serde(default)]
    pub cache: bool,
}

/// What a model returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    /// Token-equivalents consumed by the call.
    pub work_units: u64,
    /// Model that actually answered (may differ from the one requested).
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Anything that can answer a prompt.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call_model(&self, request: ModelRequest) -> Result<ModelResponse>;
}

/// Kind of span reported to an [`ObservabilitySink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    AgentRun,
    ModelCall,
    ToolCall,
    SwarmTask,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::AgentRun => "agent_run",
            SpanKind::ModelCall => "model_call",
            SpanKind::ToolCall => "tool_call",
            SpanKind::SwarmTask => "swarm_task",
        }
    }
}

/// Fire-and-forget span events. Implementations must not block.
///
/// Executors report through `notify_started` and `notify_finished`, so a
/// panicking sink is logged and otherwise ignored.
pub trait ObservabilitySink: Send + Sync {
    fn span_started(&self, kind: SpanKind, name: &str);
    fn span_finished(&self, kind: SpanKind, name: &str, elapsed: Duration, success: bool);
}

/// Report a span start. A panicking sink is logged and ignored.
pub(crate) fn notify_started(sink: &dyn ObservabilitySink, kind: SpanKind, name: &str) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| sink.span_started(kind, name))) {
        crate::tlog_warn!(
            "Observability sink panicked on {} start: {}",
            kind.as_str(),
            panic_message(&*panic)
        );
    }
}

/// Report a span end. A panicking sink is logged and ignored.
pub(crate) fn notify_finished(
    sink: &dyn ObservabilitySink,
    kind: SpanKind,
    name: &str,
    elapsed: Duration,
    success: bool,
) {
    let call = || sink.span_finished(kind, name, elapsed, success);
    if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
        crate::tlog_warn!(
            "Observability sink panicked on {} end: {}",
            kind.as_str(),
            panic_message(&*panic)
        );
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ObservabilitySink for NoopSink {
    fn span_started(&self, _kind: SpanKind, _name: &str) {}
    fn span_finished(&self, _kind: SpanKind, _name: &str, _elapsed: Duration, _success: bool) {}
}

/// Writes span events to the taskforge log at DEBUG level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ObservabilitySink for LogSink {
    fn span_started(&self, kind: SpanKind, name: &str) {
        crate::tlog_debug!("span start {} {}", kind.as_str(), name);
    }

    fn span_finished(&self, kind: SpanKind, name: &str, elapsed: Duration, success: bool) {
        crate::tlog_debug!(
            "span end {} {} elapsed={:?} success={}",
            kind.as_str(),
            name,
            elapsed,
            success
        );
    }
}
