//! Execution planning over workflow graphs

use flowcore::planner::{CostModel, DefaultCostModel, DistributedExecutor, WorkflowEdge, WorkflowNode};
use flowcore::CoreError;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn nodes(ids: &[&str]) -> Vec<WorkflowNode> {
    ids.iter().map(|id| WorkflowNode::new(*id, "task")).collect()
}

fn edge(source: &str, target: &str) -> WorkflowEdge {
    WorkflowEdge::new(format!("e-{}-{}", source, target), source, target)
}

#[test]
fn test_linear_chain() {
    let planner = DistributedExecutor::new();
    let ids = ["n1", "n2", "n3", "n4", "n5"];
    let edges: Vec<WorkflowEdge> = ids.windows(2).map(|w| edge(w[0], w[1])).collect();

    let plan = planner
        .create_execution_plan("chain", &nodes(&ids), &edges)
        .unwrap();

    let expected: Vec<Vec<&str>> = ids.iter().map(|id| vec![*id]).collect();
    assert_eq!(plan.partitions, expected);
    assert_eq!(plan.execution_order, ids.to_vec());
    assert_eq!(plan.critical_path, ids.to_vec());
    assert_eq!(plan.total_estimated_duration, Duration::from_millis(5000));
}

// One source, two parallel branches, one sink
#[test]
fn test_diamond() {
    let model = DefaultCostModel::new(Duration::from_millis(100))
        .with_type_cost("slow", Duration::from_millis(500));
    let planner = DistributedExecutor::with_cost_model(Arc::new(model));
    let graph = vec![
        WorkflowNode::new("source", "task"),
        WorkflowNode::new("b1", "slow"),
        WorkflowNode::new("b2", "task"),
        WorkflowNode::new("sink", "task"),
    ];
    let edges = vec![
        edge("source", "b1"),
        edge("source", "b2"),
        edge("b1", "sink"),
        edge("b2", "sink"),
    ];

    let plan = planner.create_execution_plan("diamond", &graph, &edges).unwrap();

    assert_eq!(
        plan.partitions,
        vec![vec!["source"], vec!["b1", "b2"], vec!["sink"]]
    );
    // source + b1 + sink, not the sum of all four nodes
    assert_eq!(plan.total_estimated_duration, Duration::from_millis(700));
    assert_eq!(plan.critical_path, vec!["source", "b1", "sink"]);
    assert_eq!(plan.dependencies["sink"], vec!["b1", "b2"]);
    assert_eq!(plan.max_parallelism(), 2);
}

#[test]
fn test_cycle_fails_fast() {
    let planner = DistributedExecutor::new();
    let result = planner.create_execution_plan(
        "loop",
        &nodes(&["a", "b", "c"]),
        &[edge("a", "b"), edge("b", "c"), edge("c", "b")],
    );
    match result {
        Err(CoreError::CyclicGraph { workflow_id, .. }) => assert_eq!(workflow_id, "loop"),
        other => panic!("expected cycle error, got {:?}", other),
    }
}

#[test]
fn test_uneven_depths() {
    // a -> b -> c and a -> c: c waits for the deeper branch
    let planner = DistributedExecutor::new();
    let plan = planner
        .create_execution_plan(
            "skip",
            &nodes(&["a", "b", "c"]),
            &[edge("a", "b"), edge("b", "c"), edge("a", "c")],
        )
        .unwrap();
    assert_eq!(plan.partition_of("c"), Some(2));
}

struct ConfigCost;

impl CostModel for ConfigCost {
    fn estimate(&self, node: &WorkflowNode) -> Duration {
        Duration::from_millis(node.config["cost"].as_u64().unwrap_or(0))
    }
}

#[test]
fn test_pluggable_cost_model() {
    let planner = DistributedExecutor::with_cost_model(Arc::new(ConfigCost));
    let graph = vec![
        WorkflowNode::new("a", "x").with_config(serde_json::json!({"cost": 30})),
        WorkflowNode::new("b", "x").with_config(serde_json::json!({"cost": 70})),
    ];
    let plan = planner.create_execution_plan("par", &graph, &[]).unwrap();
    assert_eq!(plan.total_estimated_duration, Duration::from_millis(70));
    assert_eq!(plan.critical_path, vec!["b"]);
}
