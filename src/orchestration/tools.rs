//! Tools the agent loop can invoke.
//!
//! Models request a tool by emitting
//! `<tool_call name="grep">{"pattern": "TODO"}</tool_call>`. The loop parses
//! every such block with [`parse_tool_calls`], checks it against a
//! [`ToolRegistry`], runs it under the tool's timeout and logs the outcome as
//! a [`ToolExecution`].

use crate::core::task::TaskId;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Timeout applied to tools that do not declare their own.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

static TOOL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<tool_call\s+name\s*=\s*"([^"]+)"\s*>(.*?)</tool_call>"#).unwrap()
});

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    /// Parsed JSON arguments. Bodies that are not valid JSON are kept as a string.
    pub arguments: Value,
}

/// Outcome of running a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        ToolResult {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ToolResult {
            success: false,
            output: String::new(),
            error: Some(message.into()),
        }
    }
}

/// Append-only log entry for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub call: ToolCall,
    pub result: ToolResult,
    pub timestamp: DateTime<Utc>,
}

impl ToolExecution {
    pub fn new(call: ToolCall, result: ToolResult) -> Self {
        Self {
            call,
            result,
            timestamp: Utc::now(),
        }
    }
}

/// Answer to "may this agent call this tool?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermission {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl ToolPermission {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A callable tool.
///
/// `execute` should watch `cancel` and return promptly once it fires; the
/// loop cancels it when the tool's timeout elapses.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS)
    }

    async fn execute(&self, args: Value, cancel: CancellationToken) -> Result<ToolResult>;
}

/// Source of tools and of the rules for who may call them.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn can_call(&self, agent: &str, tool: &str, task_id: &TaskId) -> ToolPermission;

    async fn get(&self, tool: &str) -> Option<Arc<dyn Tool>>;

    async fn record_call(&self, agent: &str, task_id: &TaskId);

    /// Describe the tools `agent` may use, for inclusion in a system prompt.
    async fn format_tools_for_prompt(&self, agent: &str) -> Result<String>;
}

/// Extract every tool call from a model response, in order of appearance.
pub fn parse_tool_calls(content: &str) -> Vec<ToolCall> {
    TOOL_CALL_RE
        .captures_iter(content)
        .map(|caps| {
            let name = caps[1].trim().to_string();
            let body = caps[2].trim();
            let arguments = if body.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
            };
            ToolCall { name, arguments }
        })
        .collect()
}

/// Render tool outcomes as the message fed back to the model.
pub fn format_tool_results(executions: &[ToolExecution]) -> String {
    let mut out = String::from("Tool results:\n");
    for exec in executions {
        if exec.result.success {
            out.push_str(&format!(
                "<tool_result name=\"{}\" success=\"true\">\n{}\n</tool_result>\n",
                exec.call.name, exec.result.output
            ));
        } else {
            out.push_str(&format!(
                "<tool_result name=\"{}\" success=\"false\">\n{}\n</tool_result>\n",
                exec.call.name,
                exec.result.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }
    out
}

/// In-memory registry with per-agent allow-lists.
///
/// Agents without an allow-list may call every registered tool unless the
/// registry was built with [`StaticToolRegistry::deny_by_default`]. A deny
/// entry always wins.
#[derive(Default)]
pub struct StaticToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    allow: HashMap<String, HashSet<String>>,
    deny: HashMap<String, HashSet<String>>,
    deny_by_default: bool,
    calls: Mutex<HashMap<(String, TaskId), u32>>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_by_default(mut self) -> Self {
        self.deny_by_default = true;
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn allow(mut self, agent: &str, tool: &str) -> Self {
        self.allow
            .entry(agent.to_string())
            .or_default()
            .insert(tool.to_string());
        self
    }

    pub fn deny(mut self, agent: &str, tool: &str) -> Self {
        self.deny
            .entry(agent.to_string())
            .or_default()
            .insert(tool.to_string());
        self
    }

    fn permitted(&self, agent: &str, tool: &str) -> bool {
        if self.deny.get(agent).is_some_and(|d| d.contains(tool)) {
            return false;
        }
        match self.allow.get(agent) {
            Some(allowed) => allowed.contains(tool),
            None => !self.deny_by_default,
        }
    }

    /// Number of tool calls recorded for `agent` on `task_id`.
    pub fn call_count(&self, agent: &str, task_id: &TaskId) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(agent.to_string(), *task_id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    async fn can_call(&self, agent: &str, tool: &str, _task_id: &TaskId) -> ToolPermission {
        if self.permitted(agent, tool) {
            ToolPermission::allow()
        } else {
            ToolPermission::deny(format!("{} is not permitted to use {}", agent, tool))
        }
    }

    async fn get(&self, tool: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool).cloned()
    }

    async fn record_call(&self, agent: &str, task_id: &TaskId) {
        *self
            .calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry((agent.to_string(), *task_id))
            .or_insert(0) += 1;
    }

    async fn format_tools_for_prompt(&self, agent: &str) -> Result<String> {
        let lines: Vec<String> = self
            .tools
            .values()
            .filter(|t| self.permitted(agent, t.name()))
            .map(|t| {
                format!(
                    "- {}: {} (timeout {}s)",
                    t.name(),
                    t.description(),
                    t.timeout().as_secs()
                )
            })
            .collect();

        if lines.is_empty() {
            return Ok("No tools available.".to_string());
        }
        Ok(format!(
            "Available tools. Call one with <tool_call name=\"NAME\">{{json arguments}}</tool_call>:\n{}",
            lines.join("\n")
        ))
    }
}
