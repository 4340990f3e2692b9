//! Execution planning for workflow graphs
//!
//! A workflow arrives as nodes plus edges. The planner builds a petgraph
//! `DiGraph`, rejects cycles and dangling edges, then groups nodes into
//! partitions: partition *k* holds every node whose upstream nodes all sit in
//! partitions `0..k`. Members of one partition never depend on each other and
//! may run concurrently.

use dashmap::DashMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::errors::{CoreError, Result};
use crate::core::events::{CoreEvent, EventBus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Value,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: Value::Null,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl WorkflowEdge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Per-node duration estimate used before any execution history exists
pub trait CostModel: Send + Sync {
    fn estimate(&self, node: &WorkflowNode) -> Duration;
}

/// Flat default with per-type overrides.
///
/// A node may also pin its own estimate with an `estimatedDurationMs` entry
/// in its config, which wins over both.
#[derive(Debug, Clone)]
pub struct DefaultCostModel {
    default_cost: Duration,
    by_type: HashMap<String, Duration>,
}

impl DefaultCostModel {
    pub fn new(default_cost: Duration) -> Self {
        Self {
            default_cost,
            by_type: HashMap::new(),
        }
    }

    pub fn with_type_cost(mut self, node_type: impl Into<String>, cost: Duration) -> Self {
        self.by_type.insert(node_type.into(), cost);
        self
    }
}

impl Default for DefaultCostModel {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl CostModel for DefaultCostModel {
    fn estimate(&self, node: &WorkflowNode) -> Duration {
        if let Some(ms) = node.config.get("estimatedDurationMs").and_then(Value::as_u64) {
            return Duration::from_millis(ms);
        }
        self.by_type
            .get(&node.node_type)
            .copied()
            .unwrap_or(self.default_cost)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Identifiers and ordering only; carries no executable content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub workflow_id: String,
    /// Concurrently runnable node sets, in required order
    pub partitions: Vec<Vec<String>>,
    /// Every node id, partition by partition
    pub execution_order: Vec<String>,
    /// Upstream node ids for each node
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Longest chain by estimated cost, source first
    pub critical_path: Vec<String>,
    #[serde(with = "duration_ms")]
    pub total_estimated_duration: Duration,
    pub graph_hash: String,
}

impl ExecutionPlan {
    pub fn node_count(&self) -> usize {
        self.execution_order.len()
    }

    /// Widest partition, the useful upper bound on parallelism
    pub fn max_parallelism(&self) -> usize {
        self.partitions.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn partition_of(&self, node_id: &str) -> Option<usize> {
        self.partitions
            .iter()
            .position(|p| p.iter().any(|id| id == node_id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerMetrics {
    pub plans_computed: u64,
    pub plan_cache_hits: u64,
    pub cached_plans: usize,
}

/// Turns workflow graphs into execution plans, reusing a plan until the
/// graph it was computed from changes.
pub struct DistributedExecutor {
    cost_model: Arc<dyn CostModel>,
    plans: DashMap<String, Arc<ExecutionPlan>>,
    plans_computed: AtomicU64,
    cache_hits: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl DistributedExecutor {
    pub fn new() -> Self {
        Self::with_cost_model(Arc::new(DefaultCostModel::default()))
    }

    pub fn with_cost_model(cost_model: Arc<dyn CostModel>) -> Self {
        Self {
            cost_model,
            plans: DashMap::new(),
            plans_computed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn create_execution_plan(
        &self,
        workflow_id: &str,
        nodes: &[WorkflowNode],
        edges: &[WorkflowEdge],
    ) -> Result<Arc<ExecutionPlan>> {
        let graph_hash = graph_hash(nodes, edges);
        if let Some(plan) = self.plans.get(workflow_id) {
            if plan.graph_hash == graph_hash {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(workflow_id = %workflow_id, "Reusing cached execution plan");
                return Ok(plan.clone());
            }
        }

        let plan = Arc::new(self.build_plan(workflow_id, nodes, edges, graph_hash)?);
        self.plans_computed.fetch_add(1, Ordering::Relaxed);
        self.plans.insert(workflow_id.to_string(), plan.clone());

        info!(
            workflow_id = %workflow_id,
            nodes = plan.node_count(),
            partitions = plan.partitions.len(),
            estimated_ms = plan.total_estimated_duration.as_millis() as u64,
            "Execution plan created"
        );
        if let Some(events) = &self.events {
            events.emit(CoreEvent::PlanCreated {
                workflow_id: workflow_id.to_string(),
                partitions: plan.partitions.len(),
                estimated_duration_ms: plan.total_estimated_duration.as_millis() as u64,
            });
        }
        Ok(plan)
    }

    pub fn cached_plan(&self, workflow_id: &str) -> Option<Arc<ExecutionPlan>> {
        self.plans.get(workflow_id).map(|p| p.clone())
    }

    pub fn invalidate(&self, workflow_id: &str) -> bool {
        self.plans.remove(workflow_id).is_some()
    }

    pub fn get_metrics(&self) -> PlannerMetrics {
        PlannerMetrics {
            plans_computed: self.plans_computed.load(Ordering::Relaxed),
            plan_cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cached_plans: self.plans.len(),
        }
    }

    fn build_plan(
        &self,
        workflow_id: &str,
        nodes: &[WorkflowNode],
        edges: &[WorkflowEdge],
        graph_hash: String,
    ) -> Result<ExecutionPlan> {
        let mut dag = DiGraph::<usize, ()>::new();
        let mut node_indices: HashMap<&str, NodeIndex> = HashMap::new();

        for (position, node) in nodes.iter().enumerate() {
            let index = dag.add_node(position);
            if node_indices.insert(node.id.as_str(), index).is_some() {
                return Err(CoreError::validation_field(
                    format!("duplicate node id '{}'", node.id),
                    "nodes",
                ));
            }
        }

        for edge in edges {
            let endpoint = |id: &str| {
                node_indices.get(id).copied().ok_or_else(|| CoreError::UnknownNode {
                    edge_id: edge.id.clone(),
                    node_id: id.to_string(),
                })
            };
            let source = endpoint(&edge.source)?;
            let target = endpoint(&edge.target)?;
            dag.update_edge(source, target, ());
        }

        let order = toposort(&dag, None).map_err(|cycle| CoreError::CyclicGraph {
            workflow_id: workflow_id.to_string(),
            node_id: nodes[dag[cycle.node_id()]].id.clone(),
        })?;

        let mut levels: HashMap<NodeIndex, usize> = HashMap::new();
        let mut partitions: Vec<Vec<usize>> = Vec::new();
        // Longest cost-weighted distance ending at each node, plus the step it came from
        let mut distance: HashMap<NodeIndex, (Duration, Option<NodeIndex>)> = HashMap::new();

        for &index in &order {
            let mut level = 0;
            let mut best: (Duration, Option<NodeIndex>) = (Duration::ZERO, None);
            for upstream in dag.neighbors_directed(index, Direction::Incoming) {
                level = level.max(levels[&upstream] + 1);
                let (upstream_distance, _) = distance[&upstream];
                if best.1.is_none() || upstream_distance > best.0 {
                    best = (upstream_distance, Some(upstream));
                }
            }
            levels.insert(index, level);
            if partitions.len() <= level {
                partitions.resize_with(level + 1, Vec::new);
            }
            partitions[level].push(dag[index]);

            let cost = self.cost_model.estimate(&nodes[dag[index]]);
            distance.insert(index, (best.0 + cost, best.1));
        }

        let mut critical_path = Vec::new();
        let mut total_estimated_duration = Duration::ZERO;
        if let Some((&tail, &(total, _))) = distance.iter().max_by(|a, b| {
            // Equal lengths resolve to the node declared first
            (a.1 .0, std::cmp::Reverse(dag[*a.0])).cmp(&(b.1 .0, std::cmp::Reverse(dag[*b.0])))
        }) {
            total_estimated_duration = total;
            let mut cursor = Some(tail);
            while let Some(index) = cursor {
                critical_path.push(nodes[dag[index]].id.clone());
                cursor = distance[&index].1;
            }
            critical_path.reverse();
        }

        let partitions: Vec<Vec<String>> = partitions
            .into_iter()
            .map(|mut members| {
                members.sort_unstable();
                members.into_iter().map(|p| nodes[p].id.clone()).collect()
            })
            .collect();
        let execution_order = partitions.iter().flatten().cloned().collect();

        let dependencies = nodes
            .iter()
            .map(|node| {
                let index = node_indices[node.id.as_str()];
                let mut upstream: Vec<usize> = dag
                    .neighbors_directed(index, Direction::Incoming)
                    .map(|i| dag[i])
                    .collect();
                upstream.sort_unstable();
                (
                    node.id.clone(),
                    upstream.into_iter().map(|p| nodes[p].id.clone()).collect(),
                )
            })
            .collect();

        Ok(ExecutionPlan {
            workflow_id: workflow_id.to_string(),
            partitions,
            execution_order,
            dependencies,
            critical_path,
            total_estimated_duration,
            graph_hash,
        })
    }
}

impl Default for DistributedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash of the node and edge sets; declaration order does not matter
fn graph_hash(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> String {
    let mut nodes: Vec<&WorkflowNode> = nodes.iter().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    let mut edges: Vec<&WorkflowEdge> = edges.iter().collect();
    edges.sort_by(|a, b| (&a.source, &a.target, &a.id).cmp(&(&b.source, &b.target, &b.id)));
    let canonical = json!({ "nodes": nodes, "edges": edges });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(id: &str) -> WorkflowNode {
        WorkflowNode::new(id, "task")
    }

    fn edge(source: &str, target: &str) -> WorkflowEdge {
        WorkflowEdge::new(format!("{}->{}", source, target), source, target)
    }

    #[test]
    fn test_independent_nodes_share_partition() {
        let planner = DistributedExecutor::new();
        let plan = planner
            .create_execution_plan("wf", &[node("a"), node("b"), node("c")], &[])
            .unwrap();
        assert_eq!(plan.partitions, vec![vec!["a", "b", "c"]]);
        assert_eq!(plan.total_estimated_duration, Duration::from_millis(1000));
        assert_eq!(plan.max_parallelism(), 3);
    }

    #[test]
    fn test_self_loop_is_cyclic() {
        let planner = DistributedExecutor::new();
        let err = planner
            .create_execution_plan("wf", &[node("a")], &[edge("a", "a")])
            .unwrap_err();
        assert!(matches!(err, CoreError::CyclicGraph { .. }));
        assert!(planner.cached_plan("wf").is_none());
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let planner = DistributedExecutor::new();
        let err = planner
            .create_execution_plan("wf", &[node("a")], &[edge("a", "ghost")])
            .unwrap_err();
        match err {
            CoreError::UnknownNode { node_id, .. } => assert_eq!(node_id, "ghost"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let planner = DistributedExecutor::new();
        assert!(matches!(
            planner.create_execution_plan("wf", &[node("a"), node("a")], &[]),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn test_config_cost_overrides_type_cost() {
        let model = DefaultCostModel::default().with_type_cost("http", Duration::from_millis(300));
        let pinned = WorkflowNode::new("n", "http").with_config(json!({"estimatedDurationMs": 42}));
        assert_eq!(model.estimate(&pinned), Duration::from_millis(42));
        assert_eq!(model.estimate(&WorkflowNode::new("m", "http")), Duration::from_millis(300));
        assert_eq!(model.estimate(&node("x")), Duration::from_millis(1000));
    }

    #[test]
    fn test_plan_reused_until_graph_changes() {
        let planner = DistributedExecutor::new();
        let nodes = vec![node("a"), node("b")];
        let first = planner
            .create_execution_plan("wf", &nodes, &[edge("a", "b")])
            .unwrap();
        let second = planner
            .create_execution_plan("wf", &nodes, &[edge("a", "b")])
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let changed = planner.create_execution_plan("wf", &nodes, &[]).unwrap();
        assert_eq!(changed.partitions.len(), 1);

        let metrics = planner.get_metrics();
        assert_eq!(metrics.plans_computed, 2);
        assert_eq!(metrics.plan_cache_hits, 1);
    }

    #[test]
    fn test_reordered_graph_reuses_plan() {
        let planner = DistributedExecutor::new();
        let first = planner
            .create_execution_plan("wf", &[node("a"), node("b")], &[edge("a", "b")])
            .unwrap();
        let second = planner
            .create_execution_plan("wf", &[node("b"), node("a")], &[edge("a", "b")])
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(planner.get_metrics().plan_cache_hits, 1);
    }
}
