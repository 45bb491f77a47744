//! Bounded ReAct loop for a single task.
//!
//! `AgentExecutionLoop::run()` alternates model turns and tool calls until
//! one of these fires:
//!
//! - the model emits a final answer with confidence at or above the threshold
//! - the work budget is spent
//! - the turn limit is reached
//! - something goes wrong (error or panic), reported as `StopReason::Error`
//!
//! Turns and the tool calls within a turn run strictly one after another.
//! Every model call and tool call is raced against a timeout; a tool that
//! loses its race is cancelled through its `CancellationToken`.
//!
//! All per-run state lives in a `RunState` created by `run()`, so one loop
//! can be shared across tasks and tasks can run on it concurrently.

use crate::core::task::TaskId;
use crate::orchestration::model::{
    notify_finished, notify_started, ModelClient, ModelRequest, ModelResponse, NoopSink,
    ObservabilitySink, SpanKind,
};
use crate::orchestration::tools::{
    format_tool_results, parse_tool_calls, ToolCall, ToolExecution, ToolRegistry, ToolResult,
};
use crate::util::{panic_message, race, truncate, Race};
use crate::{tlog, tlog_debug, tlog_error, tlog_trace, tlog_warn, Error, Result};
use futures::FutureExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Confidence assumed when a final answer carries no usable attribute.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Tool section used when tools are disabled or the registry fails.
pub const NO_TOOLS: &str = "No tools available.";

const FINAL_OUTPUT_INSTRUCTION: &str = "When you have your answer, wrap it in \
<final_output confidence=\"0.0-1.0\">...</final_output>, where confidence is how \
sure you are that the answer is complete and correct.";

const FINAL_TURN_DIRECTIVE: &str = "This is your final turn. Respond now with your \
final answer inside <final_output confidence=\"0.0-1.0\">...</final_output>.";

static FINAL_OUTPUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<final_output([^>]*)>(.*?)</final_output>").unwrap());

static CONFIDENCE_ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"confidence\s*=\s*["']?([^"'\s>]+)"#).unwrap());

/// Configuration for the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLoopConfig {
    pub max_turns: u32,
    /// A final answer at or above this confidence ends the run.
    pub confidence_threshold: f64,
    /// Token-equivalents a run may consume before it is stopped.
    pub work_budget: u64,
    pub tools_enabled: bool,
    /// Cheap model used for every turn but the last.
    pub thinking_model: String,
    /// Stronger model used on the last allowed turn.
    pub final_model: String,
    /// Upper bound on a single model call.
    pub model_timeout_ms: u64,
    /// Confidence reported when the run ends without a final answer.
    pub fallback_confidence: f64,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_turns: 8,
            confidence_threshold: 0.85,
            work_budget: 50_000,
            tools_enabled: true,
            thinking_model: "llama3.1:8b".to_string(),
            final_model: "llama3.1:70b".to_string(),
            model_timeout_ms: 120_000,
            fallback_confidence: 0.3,
        }
    }
}

impl AgentLoopConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A final answer met the confidence threshold.
    Confidence,
    /// The turn limit was reached without an accepted final answer.
    MaxTurns,
    /// The work budget was spent.
    Budget,
    /// A final answer arrived on the last turn, below the threshold.
    Done,
    /// The run failed.
    Error,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Confidence => "confidence",
            StopReason::MaxTurns => "max_turns",
            StopReason::Budget => "budget",
            StopReason::Done => "done",
            StopReason::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one `run()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoopResult {
    pub output: String,
    pub tool_executions: Vec<ToolExecution>,
    pub turns: u32,
    pub total_work_units_consumed: u64,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub stopped_because: StopReason,
    /// Set when `stopped_because` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A parsed `<final_output>` block.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalOutput {
    pub content: String,
    pub confidence: f64,
}

/// Find the first final-output block in `content`.
///
/// A missing or unparsable confidence becomes 0.5; anything else is clamped
/// to `[0, 1]`.
pub fn parse_final_output(content: &str) -> Option<FinalOutput> {
    let caps = FINAL_OUTPUT_RE.captures(content)?;
    let confidence = CONFIDENCE_ATTR_RE
        .captures(&caps[1])
        .and_then(|c| c[1].parse::<f64>().ok())
        .filter(|c| !c.is_nan())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_CONFIDENCE);
    Some(FinalOutput {
        content: caps[2].trim().to_string(),
        confidence,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Tool => "TOOL",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    role: Role,
    content: String,
}

/// Mutable state for one run.
#[derive(Debug, Default)]
struct RunState {
    conversation: Vec<Entry>,
    tool_executions: Vec<ToolExecution>,
    work_consumed: u64,
    turns: u32,
    last_final: Option<FinalOutput>,
    last_content: Option<String>,
}

impl RunState {
    fn push(&mut self, role: Role, content: impl Into<String>) {
        self.conversation.push(Entry {
            role,
            content: content.into(),
        });
    }

    /// Role-labelled transcript, with the last-turn directive if requested.
    fn render(&self, final_turn: bool) -> String {
        let mut blocks: Vec<String> = self
            .conversation
            .iter()
            .map(|e| format!("[{}]\n{}", e.role.label(), e.content))
            .collect();
        if final_turn {
            blocks.push(format!("[SYSTEM]\n{}", FINAL_TURN_DIRECTIVE));
        }
        blocks.join("\n\n")
    }

    fn finish(&mut self, output: String, confidence: f64, reason: StopReason) -> AgentLoopResult {
        AgentLoopResult {
            output,
            tool_executions: std::mem::take(&mut self.tool_executions),
            turns: self.turns,
            total_work_units_consumed: self.work_consumed,
            confidence,
            stopped_because: reason,
            error: None,
        }
    }
}

/// Runs tasks through a model with optional tools.
pub struct AgentExecutionLoop {
    config: AgentLoopConfig,
    model: Arc<dyn ModelClient>,
    tools: Option<Arc<dyn ToolRegistry>>,
    sink: Arc<dyn ObservabilitySink>,
    cancel: CancellationToken,
}

impl AgentExecutionLoop {
    pub fn new(config: AgentLoopConfig, model: Arc<dyn ModelClient>) -> Self {
        Self {
            config,
            model,
            tools: None,
            sink: Arc::new(NoopSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_tools(mut self, registry: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(registry);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Tie every model and tool call to `token`. Cancelling it fails the
    /// in-flight call and ends the run with `StopReason::Error`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &AgentLoopConfig {
        &self.config
    }

    /// Run one task to completion. Never fails; check `stopped_because`.
    pub async fn run(
        &self,
        agent: &str,
        system_prompt: &str,
        user_prompt: &str,
        task_id: &TaskId,
    ) -> AgentLoopResult {
        let started = Instant::now();
        notify_started(&*self.sink, SpanKind::AgentRun, agent);
        tlog_debug!("Agent {} starting task {}", agent, task_id.short());

        let mut state = RunState::default();
        let outcome = AssertUnwindSafe(self.run_turns(
            &mut state,
            agent,
            system_prompt,
            user_prompt,
            task_id,
        ))
        .catch_unwind()
        .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => error_result(&mut state, e.to_string()),
            Err(panic) => error_result(&mut state, format!("panic: {}", panic_message(&*panic))),
        };

        match result.stopped_because {
            StopReason::Error => tlog_error!(
                "Agent {} task {} failed after {} turns: {}",
                agent,
                task_id.short(),
                result.turns,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            reason => tlog!(
                "Agent {} task {} stopped ({}) after {} turns, {} work units, confidence {:.2}",
                agent,
                task_id.short(),
                reason,
                result.turns,
                result.total_work_units_consumed,
                result.confidence
            ),
        }
        notify_finished(
            &*self.sink,
            SpanKind::AgentRun,
            agent,
            started.elapsed(),
            result.stopped_because != StopReason::Error,
        );
        result
    }

    async fn run_turns(
        &self,
        state: &mut RunState,
        agent: &str,
        system_prompt: &str,
        user_prompt: &str,
        task_id: &TaskId,
    ) -> Result<AgentLoopResult> {
        let system = self.assemble_system_prompt(agent, system_prompt).await;
        let max_turns = self.config.max_turns;
        state.push(Role::User, user_prompt);

        while state.turns < max_turns {
            if state.work_consumed >= self.config.work_budget {
                tlog_warn!(
                    "Agent {} hit work budget ({} >= {})",
                    agent,
                    state.work_consumed,
                    self.config.work_budget
                );
                let (output, confidence) = match (&state.last_final, &state.last_content) {
                    (Some(fin), _) => (fin.content.clone(), fin.confidence),
                    (None, Some(content)) => (content.clone(), self.config.fallback_confidence),
                    (None, None) => (String::new(), self.config.fallback_confidence),
                };
                return Ok(state.finish(output, confidence, StopReason::Budget));
            }

            let last_turn = state.turns + 1 == max_turns;
            let model = if last_turn {
                &self.config.final_model
            } else {
                &self.config.thinking_model
            };
            let prompt = if state.turns == 0 {
                user_prompt.to_string()
            } else {
                state.render(last_turn)
            };

            let response = self
                .call_model(ModelRequest {
                    system_prompt: system.clone(),
                    user_prompt: prompt,
                    agent_id: agent.to_string(),
                    model: model.clone(),
                    cache: true,
                })
                .await?;
            state.work_consumed += response.work_units;
            state.turns += 1;
            tlog_debug!(
                "Agent {} turn {}/{} on {} used {} work units",
                agent,
                state.turns,
                max_turns,
                response.model,
                response.work_units
            );
            tlog_trace!("Agent {} response: {}", agent, truncate(&response.content, 500));

            let content = response.content;
            state.last_content = Some(content.clone());

            if let Some(fin) = parse_final_output(&content) {
                state.push(Role::Assistant, content);
                state.last_final = Some(fin.clone());
                if fin.confidence >= self.config.confidence_threshold {
                    return Ok(state.finish(fin.content, fin.confidence, StopReason::Confidence));
                }
                if last_turn {
                    return Ok(state.finish(fin.content, fin.confidence, StopReason::Done));
                }
                state.push(
                    Role::User,
                    format!(
                        "Your confidence ({:.2}) is below {:.2}. Keep working, then give an improved final answer.",
                        fin.confidence, self.config.confidence_threshold
                    ),
                );
                continue;
            }

            if last_turn {
                return Ok(state.finish(content, self.config.fallback_confidence, StopReason::MaxTurns));
            }

            let calls = match (&self.tools, self.config.tools_enabled) {
                (Some(_), true) => parse_tool_calls(&content),
                _ => Vec::new(),
            };
            state.push(Role::Assistant, content);

            if let (Some(registry), false) = (&self.tools, calls.is_empty()) {
                let mut executions = Vec::with_capacity(calls.len());
                for call in calls {
                    let exec = self.execute_tool(registry.as_ref(), agent, task_id, call).await;
                    state.tool_executions.push(exec.clone());
                    executions.push(exec);
                }
                state.push(Role::Tool, format_tool_results(&executions));
            }
        }

        let output = state.last_content.clone().unwrap_or_default();
        Ok(state.finish(output, self.config.fallback_confidence, StopReason::MaxTurns))
    }

    /// Base prompt, tool description and the final-output instruction.
    async fn assemble_system_prompt(&self, agent: &str, base: &str) -> String {
        let tools = match (&self.tools, self.config.tools_enabled) {
            (Some(registry), true) => match registry.format_tools_for_prompt(agent).await {
                Ok(text) => text,
                Err(e) => {
                    tlog_warn!("Tool registry unavailable for {}: {}", agent, e);
                    NO_TOOLS.to_string()
                }
            },
            _ => NO_TOOLS.to_string(),
        };
        format!("{}\n\n{}\n\n{}", base, tools, FINAL_OUTPUT_INSTRUCTION)
    }

    async fn call_model(&self, request: ModelRequest) -> Result<ModelResponse> {
        let timeout = self.config.model_timeout();
        let token = self.cancel.child_token();
        let model = request.model.clone();
        let started = Instant::now();
        notify_started(&*self.sink, SpanKind::ModelCall, &model);

        let result = match race(timeout, &token, self.model.call_model(request)).await {
            Race::Finished(result) => result,
            Race::TimedOut => Err(Error::ModelTimeout(timeout)),
            Race::Cancelled => Err(Error::ModelCallFailure("run cancelled".to_string())),
        };

        notify_finished(
            &*self.sink,
            SpanKind::ModelCall,
            &model,
            started.elapsed(),
            result.is_ok(),
        );
        result
    }

    /// Run one tool call. Every failure becomes a failed `ToolExecution`.
    async fn execute_tool(
        &self,
        registry: &dyn ToolRegistry,
        agent: &str,
        task_id: &TaskId,
        call: ToolCall,
    ) -> ToolExecution {
        let permission = registry.can_call(agent, &call.name, task_id).await;
        if !permission.allowed {
            let err = Error::ToolPermissionDenied {
                tool: call.name.clone(),
                reason: permission
                    .reason
                    .unwrap_or_else(|| "not permitted".to_string()),
            };
            tlog_warn!("Agent {}: {}", agent, err);
            return ToolExecution::new(call, ToolResult::error(err.to_string()));
        }

        let Some(tool) = registry.get(&call.name).await else {
            let err = Error::ToolNotFound(call.name.clone());
            tlog_warn!("Agent {}: {}", agent, err);
            return ToolExecution::new(call, ToolResult::error(err.to_string()));
        };

        registry.record_call(agent, task_id).await;

        let timeout = tool.timeout();
        let token = self.cancel.child_token();
        let started = Instant::now();
        notify_started(&*self.sink, SpanKind::ToolCall, &call.name);

        let result = match race(timeout, &token, tool.execute(call.arguments.clone(), token.clone())).await {
            Race::Finished(Ok(result)) => result,
            Race::Finished(Err(e)) => ToolResult::error(
                Error::ToolExecutionFailure {
                    tool: call.name.clone(),
                    message: e.to_string(),
                }
                .to_string(),
            ),
            Race::TimedOut => {
                tlog_warn!("Agent {}: tool {} timed out after {:?}", agent, call.name, timeout);
                ToolResult::error(
                    Error::ToolTimeout {
                        tool: call.name.clone(),
                        timeout,
                    }
                    .to_string(),
                )
            }
            Race::Cancelled => ToolResult::error(
                Error::ToolExecutionFailure {
                    tool: call.name.clone(),
                    message: "cancelled".to_string(),
                }
                .to_string(),
            ),
        };

        notify_finished(
            &*self.sink,
            SpanKind::ToolCall,
            &call.name,
            started.elapsed(),
            result.success,
        );
        tlog_debug!("Agent {} tool {} success={}", agent, call.name, result.success);
        ToolExecution::new(call, result)
    }
}

fn error_result(state: &mut RunState, message: String) -> AgentLoopResult {
    let output = state.last_content.clone().unwrap_or_default();
    let mut result = state.finish(output, 0.0, StopReason::Error);
    result.error = Some(message);
    result
}
