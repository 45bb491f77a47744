//! Planner scenarios: decomposition, ordering, readiness and replanning.

use std::collections::{HashMap, HashSet};

use taskforge::core::{Intent, IntentKind, TaskGraph, TaskId, TaskStatus};
use taskforge::orchestration::{DecomposeContext, PlannerConfig, TaskGraphPlanner};

use crate::fixtures::forced_cycle;

fn sample_intents() -> Vec<Intent> {
    vec![
        Intent::parse("Create a REST API for invoices"),
        Intent::parse("Refactor the storage layer to use sqlite"),
        Intent::parse("Fix the crash when the config file is empty"),
        Intent::parse("Review the payment module"),
        Intent::parse("Think about the roadmap"),
    ]
}

fn position_map(order: &[TaskId]) -> HashMap<TaskId, usize> {
    order.iter().enumerate().map(|(i, id)| (*id, i)).collect()
}

fn ordering_edges(graph: &TaskGraph) -> Vec<(TaskId, TaskId)> {
    graph
        .edges
        .iter()
        .filter(|e| e.kind.is_ordering())
        .map(|e| (e.from, e.to))
        .collect()
}

/// Test: Decomposed graphs are acyclic
/// Given any intent kind
/// When it is decomposed
/// Then no circular dependency is reported
#[test]
fn test_decomposed_graphs_have_no_cycles() {
    let planner = TaskGraphPlanner::default();
    let context = DecomposeContext::new()
        .with_component("api")
        .with_component("worker");

    for intent in sample_intents() {
        for ctx in [None, Some(&context)] {
            let result = planner.decompose(&intent, ctx);
            assert!(result.architecture_validated, "{:?}", result.validation_errors);
            assert!(planner.detect_circular_dependencies(&result.graph).is_empty());
        }
    }
}

/// Test: A forced three-node cycle is reported once
#[test]
fn test_forced_cycle_reported_once() {
    let planner = TaskGraphPlanner::default();
    let graph = forced_cycle();
    let expected: HashSet<TaskId> = graph.nodes.iter().map(|n| n.id).collect();

    let cycles = planner.detect_circular_dependencies(&graph);
    assert_eq!(cycles.len(), 1);
    let members: HashSet<TaskId> = cycles[0].iter().copied().collect();
    assert_eq!(members, expected);

    let errors = planner.validate(&graph);
    assert!(errors
        .iter()
        .any(|e| e.to_string().starts_with("Circular dependency detected")));
}

/// Test: Execution order respects every ordering edge
#[test]
fn test_execution_order_respects_edges() {
    let planner = TaskGraphPlanner::default();
    let context = DecomposeContext::new()
        .with_component("ui")
        .with_component("api")
        .with_component("db");

    for intent in sample_intents() {
        let graph = planner.decompose(&intent, Some(&context)).graph;
        let order = planner.get_execution_order(&graph);
        assert_eq!(order.len(), graph.task_count());

        let pos = position_map(&order);
        for (from, to) in ordering_edges(&graph) {
            assert!(pos[&from] < pos[&to], "edge {} -> {} out of order", from, to);
        }
    }
}

/// Test: Readiness waits for every dependency
/// Given a create plan
/// When tasks are completed one by one in execution order
/// Then no task is ever ready before all its predecessors completed
#[test]
fn test_readiness_is_monotonic() {
    let planner = TaskGraphPlanner::default();
    let mut graph = planner
        .decompose(&Intent::new(IntentKind::Create, "build a CLI"), None)
        .graph;
    let order = planner.get_execution_order(&graph);
    let edges = ordering_edges(&graph);

    for id in &order {
        for ready in planner.get_ready_tasks(&graph) {
            for (from, _) in edges.iter().filter(|(_, to)| *to == ready.id) {
                let dep = graph.get_task(from).unwrap();
                assert_eq!(dep.status, TaskStatus::Completed);
            }
        }
        planner
            .update_task_status(&mut graph, id, TaskStatus::Running)
            .unwrap();
        assert!(planner.get_ready_tasks(&graph).iter().all(|t| t.id != *id));
        planner
            .update_task_status(&mut graph, id, TaskStatus::Completed)
            .unwrap();
    }
    assert!(graph.all_complete());
}

/// Test: Completing a task twice leaves an identical graph
#[test]
fn test_status_update_is_idempotent() {
    let planner = TaskGraphPlanner::default();
    let mut graph = planner
        .decompose(&Intent::parse("Review the auth module"), None)
        .graph;
    let id = graph.nodes[0].id;
    planner
        .update_task_status(&mut graph, &id, TaskStatus::Running)
        .unwrap();

    planner
        .update_task_status(&mut graph, &id, TaskStatus::Completed)
        .unwrap();
    let once = graph.clone();
    planner
        .update_task_status(&mut graph, &id, TaskStatus::Completed)
        .unwrap();
    assert_eq!(graph, once);
}

/// Test: Illegal transitions are refused
#[test]
fn test_invalid_transition_rejected() {
    let planner = TaskGraphPlanner::default();
    let mut graph = planner
        .decompose(&Intent::parse("Review the auth module"), None)
        .graph;
    let id = graph.nodes[0].id;

    let err = planner
        .update_task_status(&mut graph, &id, TaskStatus::Completed)
        .unwrap_err();
    assert!(err.to_string().contains("Invalid status transition"));
    assert!(planner
        .update_task_status(&mut graph, &TaskId::new(), TaskStatus::Running)
        .is_err());
}

/// Test: Replanning stops at the configured bound
/// Given a task that keeps failing
/// When replan is called max_replan_attempts + 1 times
/// Then the last call returns the graph unchanged with an error
#[test]
fn test_replan_bound() {
    let planner = TaskGraphPlanner::new(PlannerConfig {
        max_replan_attempts: 3,
        ..PlannerConfig::default()
    });
    let mut graph = planner
        .decompose(&Intent::parse("Fix the login bug"), None)
        .graph;
    let target = graph.find_by_name("fix").unwrap().id;

    for attempt in 1..=3 {
        planner
            .update_task_status(&mut graph, &target, TaskStatus::Running)
            .unwrap();
        let result = planner.replan(&graph, &target, "assertion failed in login flow");
        assert!(result.validation_errors.is_empty(), "attempt {}", attempt);
        assert_eq!(result.replan_count, attempt);
        graph = result.graph;
        assert!(graph.get_task(&target).unwrap().is_pending());
    }

    planner
        .update_task_status(&mut graph, &target, TaskStatus::Running)
        .unwrap();
    let last = planner.replan(&graph, &target, "assertion failed in login flow");
    assert_eq!(last.graph, graph);
    assert!(!last.validation_errors.is_empty());
    assert!(!last.architecture_validated);
}

/// Test: Only running or failed tasks can be replanned
/// Given a plan whose first task already completed
/// When replan is called for that task
/// Then the graph comes back unchanged with a validation error
#[test]
fn test_replan_rejects_completed_task() {
    let planner = TaskGraphPlanner::default();
    let mut graph = planner
        .decompose(&Intent::parse("Fix the login bug"), None)
        .graph;
    let first = planner.get_execution_order(&graph)[0];
    planner
        .update_task_status(&mut graph, &first, TaskStatus::Running)
        .unwrap();
    planner
        .update_task_status(&mut graph, &first, TaskStatus::Completed)
        .unwrap();

    let result = planner.replan(&graph, &first, "flaky assertion");

    assert!(!result.architecture_validated);
    assert_eq!(result.replan_count, 0);
    assert!(result.validation_errors[0].contains("only running or failed tasks"));
    assert_eq!(result.graph, graph);
    assert!(graph.get_task(&first).unwrap().is_completed());
}

/// Test: A timeout failure splits the task and keeps the graph valid
#[test]
fn test_replan_split_on_timeout() {
    let planner = TaskGraphPlanner::default();
    let mut graph = planner
        .decompose(&Intent::parse("Create an export job"), None)
        .graph;
    let target = graph.find_by_name("implement").unwrap().id;
    let test_id = graph.find_by_name("test").unwrap().id;
    planner
        .update_task_status(&mut graph, &target, TaskStatus::Running)
        .unwrap();

    let result = planner.replan(&graph, &target, "model call timed out after 120s");

    assert!(result.architecture_validated, "{:?}", result.validation_errors);
    let next = result.graph;
    assert_eq!(next.task_count(), graph.task_count() + 2);
    let original = next.get_task(&target).unwrap();
    assert!(original.is_superseded());
    assert!(matches!(original.status, TaskStatus::Failed { .. }));

    let parts = original.superseded_by();
    assert_eq!(parts.len(), 2);
    let pos = position_map(&planner.get_execution_order(&next));
    assert!(pos[&parts[0]] < pos[&parts[1]]);
    assert!(pos[&parts[1]] < pos[&test_id]);
    assert!(planner.detect_circular_dependencies(&next).is_empty());
}

/// Test: Oversized decompositions fail fast
#[test]
fn test_graph_too_large() {
    let planner = TaskGraphPlanner::new(PlannerConfig {
        max_nodes: 4,
        ..PlannerConfig::default()
    });
    let context = DecomposeContext::new()
        .with_component("a")
        .with_component("b");

    let result = planner.decompose(&Intent::parse("Create a service"), Some(&context));

    assert!(!result.architecture_validated);
    assert!(result.graph.is_empty());
    assert_eq!(
        result.validation_errors,
        vec!["Graph too large: 5 tasks exceeds the ceiling of 4".to_string()]
    );
}

/// Test: The critical path runs through the heaviest chain
#[test]
fn test_critical_path_covers_chain() {
    let planner = TaskGraphPlanner::default();
    let graph = planner
        .decompose(&Intent::parse("Create a scheduler"), None)
        .graph;
    let names: Vec<&str> = graph
        .critical_path
        .iter()
        .map(|id| graph.get_task(id).unwrap().name.as_str())
        .collect();
    assert_eq!(names, vec!["spec", "design", "implement", "test"]);
    assert_eq!(
        graph.estimated_total_work,
        graph.nodes.iter().map(|n| n.estimated_work_units).sum::<u64>()
    );
}

/// Test: Plans survive a JSON round trip
#[test]
fn test_decomposition_serializes() {
    let planner = TaskGraphPlanner::default();
    let result = planner.decompose(&Intent::parse("Fix the flaky upload"), None);
    let json = serde_json::to_string(&result).unwrap();
    let parsed: taskforge::orchestration::DecompositionResult = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, result);
}
