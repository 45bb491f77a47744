//! Agent loop scenarios: termination conditions and tool handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskforge::core::TaskId;
use taskforge::orchestration::{
    AgentExecutionLoop, AgentLoopConfig, StaticToolRegistry, StopReason,
};

use crate::fixtures::{final_output, PanickingSink, ScriptedModel, ShoutTool, StuckTool};

const SYSTEM: &str = "You are a careful engineer.";

/// Test: Loop stops on a confident first answer
/// Given a model that answers with confidence 0.95 on turn 1
/// When the loop runs
/// Then it stops after one turn because of confidence
#[tokio::test]
async fn test_stops_on_confidence() {
    let model = ScriptedModel::new([final_output("done", 0.95)]);
    let agent = AgentExecutionLoop::new(AgentLoopConfig::default(), model.clone());

    let result = agent.run("coder", SYSTEM, "write it", &TaskId::new()).await;

    assert_eq!(result.turns, 1);
    assert_eq!(result.stopped_because, StopReason::Confidence);
    assert_eq!(result.output, "done");
    assert!((result.confidence - 0.95).abs() < 1e-9);
    assert_eq!(model.call_count(), 1);
}

/// Test: A panicking observability sink never escapes the run
/// Given a sink that panics on every span and a model answering with confidence 0.95
/// When the loop runs
/// Then it still stops after one turn because of confidence
#[tokio::test]
async fn test_panicking_sink_does_not_abort_run() {
    let model = ScriptedModel::new([final_output("done", 0.95)]);
    let agent = AgentExecutionLoop::new(AgentLoopConfig::default(), model.clone())
        .with_sink(Arc::new(PanickingSink));

    let result = agent.run("coder", SYSTEM, "write it", &TaskId::new()).await;

    assert_eq!(result.stopped_because, StopReason::Confidence);
    assert_eq!(result.turns, 1);
    assert_eq!(result.output, "done");
    assert!(result.error.is_none());
    assert_eq!(model.call_count(), 1);
}

/// Test: A zero work budget stops before any model call
#[tokio::test]
async fn test_zero_budget_stops_immediately() {
    let model = ScriptedModel::new([final_output("never", 0.99)]);
    let config = AgentLoopConfig {
        work_budget: 0,
        ..AgentLoopConfig::default()
    };
    let agent = AgentExecutionLoop::new(config, model.clone());

    let result = agent.run("coder", SYSTEM, "write it", &TaskId::new()).await;

    assert_eq!(result.stopped_because, StopReason::Budget);
    assert_eq!(result.turns, 0);
    assert_eq!(model.call_count(), 0);
}

/// Test: A model that never concludes runs out of turns
/// Given a model that only ever thinks out loud
/// When the loop runs with max_turns = 4
/// Then exactly 4 calls are made and the last uses the final model
#[tokio::test]
async fn test_runs_out_of_turns() {
    let model = ScriptedModel::new(["still thinking"]);
    let config = AgentLoopConfig {
        max_turns: 4,
        ..AgentLoopConfig::default()
    };
    let agent = AgentExecutionLoop::new(config.clone(), model.clone());

    let result = agent.run("coder", SYSTEM, "write it", &TaskId::new()).await;

    assert_eq!(result.stopped_because, StopReason::MaxTurns);
    assert_eq!(result.turns, 4);
    assert_eq!(model.call_count(), 4);
    assert!((result.confidence - config.fallback_confidence).abs() < 1e-9);

    let models: Vec<String> = model.requests().into_iter().map(|r| r.model).collect();
    assert_eq!(models[..3], vec![config.thinking_model.clone(); 3][..]);
    assert_eq!(models[3], config.final_model);
}

/// Test: Work accounting stops a long run
#[tokio::test]
async fn test_budget_exhausted_mid_run() {
    let model = ScriptedModel::with_work_units(["hmm", "still hmm"], 400);
    let config = AgentLoopConfig {
        work_budget: 1_000,
        ..AgentLoopConfig::default()
    };
    let agent = AgentExecutionLoop::new(config, model.clone());

    let result = agent.run("coder", SYSTEM, "write it", &TaskId::new()).await;

    assert_eq!(result.stopped_because, StopReason::Budget);
    assert_eq!(result.turns, 3);
    assert_eq!(result.total_work_units_consumed, 1_200);
    assert_eq!(result.output, "still hmm");
}

/// Test: Tool results feed the next turn
/// Given a model that calls a tool and then answers
/// When the loop runs with the tool registered
/// Then the tool execution is logged and its output reaches the model
#[tokio::test]
async fn test_tool_round_trip() {
    let model = ScriptedModel::new([
        r#"Let me check. <tool_call name="shout">{"text": "hello"}</tool_call>"#.to_string(),
        final_output("HELLO it is", 0.9),
    ]);
    let registry = Arc::new(StaticToolRegistry::new().with_tool(Arc::new(ShoutTool)));
    let agent = AgentExecutionLoop::new(AgentLoopConfig::default(), model.clone())
        .with_tools(registry.clone());
    let task = TaskId::new();

    let result = agent.run("coder", SYSTEM, "shout hello", &task).await;

    assert_eq!(result.stopped_because, StopReason::Confidence);
    assert_eq!(result.turns, 2);
    assert_eq!(result.tool_executions.len(), 1);
    let exec = &result.tool_executions[0];
    assert_eq!(exec.call.name, "shout");
    assert!(exec.result.success);
    assert_eq!(exec.result.output, "HELLO");
    assert_eq!(registry.call_count("coder", &task), 1);

    let requests = model.requests();
    assert!(requests[0].system_prompt.contains("shout"));
    assert!(requests[1].user_prompt.contains("HELLO"));
}

/// Test: Denied, unknown and stuck tools become failed executions
#[tokio::test]
async fn test_tool_failures_do_not_end_run() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let model = ScriptedModel::new([
        concat!(
            r#"<tool_call name="shout">{"text": "x"}</tool_call>"#,
            r#"<tool_call name="missing">{}</tool_call>"#,
            r#"<tool_call name="stuck">{}</tool_call>"#,
        )
        .to_string(),
        final_output("gave up on tools", 0.9),
    ]);
    let registry = Arc::new(
        StaticToolRegistry::new()
            .with_tool(Arc::new(ShoutTool))
            .with_tool(Arc::new(StuckTool {
                cancelled: cancelled.clone(),
            }))
            .deny("coder", "shout"),
    );
    let agent = AgentExecutionLoop::new(AgentLoopConfig::default(), model).with_tools(registry);

    let result = agent.run("coder", SYSTEM, "try tools", &TaskId::new()).await;

    assert_eq!(result.stopped_because, StopReason::Confidence);
    assert_eq!(result.tool_executions.len(), 3);
    assert!(result.tool_executions.iter().all(|e| !e.result.success));
    let errors: Vec<String> = result
        .tool_executions
        .iter()
        .map(|e| e.result.error.clone().unwrap_or_default())
        .collect();
    assert!(errors[0].contains("denied"));
    assert_eq!(errors[1], "Tool not found: missing");
    assert!(errors[2].contains("timed out"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cancelled.load(Ordering::SeqCst));
}

/// Test: Disabled tools are neither advertised nor executed
#[tokio::test]
async fn test_tools_disabled() {
    let model = ScriptedModel::new([
        r#"<tool_call name="shout">{"text": "x"}</tool_call>"#.to_string(),
        final_output("ok", 0.9),
    ]);
    let registry = Arc::new(StaticToolRegistry::new().with_tool(Arc::new(ShoutTool)));
    let config = AgentLoopConfig {
        tools_enabled: false,
        ..AgentLoopConfig::default()
    };
    let agent = AgentExecutionLoop::new(config, model.clone()).with_tools(registry);

    let result = agent.run("coder", SYSTEM, "go", &TaskId::new()).await;

    assert!(result.tool_executions.is_empty());
    assert!(model.requests()[0].system_prompt.contains("No tools available."));
}

/// Test: One loop instance serves concurrent runs independently
#[tokio::test]
async fn test_loop_is_reusable_across_runs() {
    let model = ScriptedModel::new([final_output("same", 0.99)]);
    let agent = Arc::new(AgentExecutionLoop::new(AgentLoopConfig::default(), model.clone()));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let agent = agent.clone();
            tokio::spawn(async move {
                agent
                    .run(&format!("agent-{}", i), SYSTEM, "go", &TaskId::new())
                    .await
            })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap();
        assert_eq!(result.turns, 1);
        assert_eq!(result.stopped_because, StopReason::Confidence);
    }
    assert_eq!(model.call_count(), 4);
}
