// Core infrastructure modules
pub mod core;

// Execution components
pub mod cache;   // Result memoization by execution fingerprint
pub mod memory;  // Memory pressure observation and reclamation
pub mod planner; // Workflow graph -> parallel execution plan
pub mod pool;    // HTTP agents and database slots
pub mod queue;   // Task admission, ordering and lifecycle
pub mod retry;   // Backoff and circuit breaking
pub mod runtime; // Composition of all of the above

// Re-exports for convenience
pub use crate::core::config::{
    CacheConfig, CircuitBreakerConfig, CoreConfig, CoreConfigBuilder, MemoryConfig, PoolConfig,
    QueueConfig, RetryConfig, RuntimeConfig,
};
pub use crate::core::errors::{CoreError, Result};
pub use crate::core::events::{CoreEvent, EventBus, EventEnvelope, EventSink};
pub use crate::core::telemetry::init_tracing;
pub use cache::{fingerprint_key, EvictionPolicy, ResultCache};
pub use memory::{MemoryOptimizer, PressureLevel};
pub use planner::{DistributedExecutor, ExecutionPlan, WorkflowEdge, WorkflowNode};
pub use pool::{ConnectionPool, DbConnection, HttpAgent};
pub use queue::{Task, TaskPriority, TaskQueue, TaskStatus};
pub use retry::{CircuitStatus, RetryContext, SmartRetry};
pub use runtime::{executor_fn, ExecutionContext, NodeExecutor, Runtime, WorkflowRunReport};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_node_workflow() {
        let runtime = Runtime::new(CoreConfig::development()).unwrap();
        let executor = Arc::new(executor_fn(|task: Task, _ctx| async move {
            Ok::<_, anyhow::Error>(json!({ "echo": task.node_id }))
        }));

        let report = runtime
            .run_workflow("wf", &[WorkflowNode::new("only", "noop")], &[], executor)
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.outputs["only"], json!({ "echo": "only" }));
        runtime.shutdown();
    }
}
