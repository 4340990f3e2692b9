//! Composition of the execution core
//!
//! [`Runtime`] owns one of each component and drives a workflow run from a
//! single scheduler loop: plan the graph, submit each partition's tasks,
//! dispatch them through the cache and the retry layer, and report back to the
//! queue. Queue and cache are only touched between await points.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{fingerprint_key, CacheMetrics, ResultCache};
use crate::core::config::CoreConfig;
use crate::core::errors::{CoreError, Result};
use crate::core::events::EventBus;
use crate::memory::{MemoryMetrics, MemoryOptimizer, MemoryProbe, PressureLevel, Reclaimer};
use crate::planner::{DistributedExecutor, PlannerMetrics, WorkflowEdge, WorkflowNode};
use crate::pool::{ConnectionPool, PoolMetrics};
use crate::queue::{Admission, QueueMetrics, Task, TaskQueue, TaskStatus};
use crate::retry::{RetryContext, RetryMetrics, SmartRetry};

/// What a node executor can reach while running a task
#[derive(Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub pool: Arc<ConnectionPool>,
    pub events: Arc<EventBus>,
}

/// Runs one task. Implemented outside the core; the core never interprets
/// `task.node` or `task.input`.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<Value>;
}

/// Adapts a closure returning `anyhow::Result` into a [`NodeExecutor`]
pub struct FnExecutor<F> {
    f: F,
}

pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    FnExecutor { f }
}

#[async_trait]
impl<F, Fut> NodeExecutor for FnExecutor<F>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<Value> {
        (self.f)(task.clone(), ctx.clone()).await.map_err(CoreError::from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunReport {
    pub workflow_id: String,
    /// Output of every node that completed, keyed by node id
    pub outputs: BTreeMap<String, Value>,
    /// Failure reason of every node that did not complete
    pub failed: BTreeMap<String, String>,
    pub cache_hits: usize,
    pub duration: Duration,
}

impl WorkflowRunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMetrics {
    pub queue: QueueMetrics,
    pub pool: PoolMetrics,
    pub cache: CacheMetrics,
    pub retry: RetryMetrics,
    pub memory: MemoryMetrics,
    pub planner: PlannerMetrics,
}

/// Gives cache memory back when the optimizer collects
struct CacheReclaimer {
    cache: Arc<Mutex<ResultCache>>,
}

impl Reclaimer for CacheReclaimer {
    fn name(&self) -> &str {
        "result_cache"
    }

    fn reclaim(&self, reason: &str) -> u64 {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let before = cache.size_bytes();
        let expired = cache.purge_expired();
        let after_purge = cache.size_bytes();
        let evicted = cache.shrink_to(0.5);
        debug!(reason, expired, evicted, "Result cache reclaimed");
        (before - after_purge) as u64 + evicted
    }
}

/// Drops idle HTTP agents on every monitoring tick and under pressure
struct PoolReclaimer {
    pool: Arc<ConnectionPool>,
}

impl Reclaimer for PoolReclaimer {
    fn name(&self) -> &str {
        "connection_pool"
    }

    fn reclaim(&self, _reason: &str) -> u64 {
        self.pool.cleanup_idle();
        0
    }

    fn sweep(&self) {
        self.pool.cleanup_idle();
    }
}

/// Tasks submitted by one run. Whatever is still live when the run goes
/// away (cancelled, or returned early) is failed, then every record of the
/// run is dropped from the queue.
struct RunGuard<'a> {
    queue: &'a Mutex<TaskQueue>,
    workflow_id: String,
    task_ids: Vec<String>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let mut abandoned = 0;
        for task_id in &self.task_ids {
            let live = queue.status(task_id).map(|s| !s.is_terminal()).unwrap_or(false);
            if live && queue.fail(task_id, "run abandoned").is_ok() {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(workflow_id = %self.workflow_id, abandoned, "Workflow run abandoned with live tasks");
        }
        queue.forget(&self.task_ids);
    }
}

pub struct Runtime {
    config: CoreConfig,
    events: Arc<EventBus>,
    queue: Mutex<TaskQueue>,
    cache: Arc<Mutex<ResultCache>>,
    pool: Arc<ConnectionPool>,
    retry: Arc<SmartRetry>,
    memory: Arc<MemoryOptimizer>,
    planner: DistributedExecutor,
}

impl Runtime {
    pub fn new(config: CoreConfig) -> Result<Self> {
        let memory = MemoryOptimizer::new(config.memory.clone())?;
        Self::assemble(config, memory)
    }

    /// Runtime whose memory readings come from `probe`
    pub fn with_memory_probe(config: CoreConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        let memory = MemoryOptimizer::with_probe(config.memory.clone(), probe)?;
        Self::assemble(config, memory)
    }

    fn assemble(config: CoreConfig, memory: MemoryOptimizer) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventBus::new(config.runtime.event_capacity));

        let queue = TaskQueue::new(config.queue.clone())?.with_events(events.clone());
        let cache = Arc::new(Mutex::new(ResultCache::new(config.cache.clone())?));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone())?.with_events(events.clone()));
        let retry = Arc::new(
            SmartRetry::new(config.retry.clone(), config.circuit_breaker.clone())?
                .with_events(events.clone()),
        );
        let memory = Arc::new(memory.with_events(events.clone()));
        memory.register_reclaimer(Arc::new(CacheReclaimer {
            cache: cache.clone(),
        }));
        memory.register_reclaimer(Arc::new(PoolReclaimer { pool: pool.clone() }));
        let planner = DistributedExecutor::new().with_events(events.clone());

        Ok(Self {
            config,
            events,
            queue: Mutex::new(queue),
            cache,
            pool,
            retry,
            memory,
            planner,
        })
    }

    /// Swap in a planner, e.g. one with a custom cost model
    pub fn with_planner(mut self, planner: DistributedExecutor) -> Self {
        self.planner = planner.with_events(self.events.clone());
        self
    }

    /// Start background work. Must be called within a tokio runtime.
    pub fn start(&self) {
        self.memory.start_monitoring();
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn retry(&self) -> &Arc<SmartRetry> {
        &self.retry
    }

    pub fn memory(&self) -> &Arc<MemoryOptimizer> {
        &self.memory
    }

    pub fn planner(&self) -> &DistributedExecutor {
        &self.planner
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics {
            queue: self.lock_queue().get_metrics(),
            pool: self.pool.get_metrics(),
            cache: self.lock_cache().get_metrics(),
            retry: self.retry.metrics(),
            memory: self.memory.get_metrics(),
            planner: self.planner.get_metrics(),
        }
    }

    pub async fn run_workflow(
        &self,
        workflow_id: &str,
        nodes: &[WorkflowNode],
        edges: &[WorkflowEdge],
        executor: Arc<dyn NodeExecutor>,
    ) -> Result<WorkflowRunReport> {
        self.run_workflow_with_input(workflow_id, nodes, edges, Value::Null, executor)
            .await
    }

    /// Execute a workflow graph to completion.
    ///
    /// Node failures are reported in [`WorkflowRunReport::failed`]; an `Err`
    /// means the run could not be planned or admitted at all.
    pub async fn run_workflow_with_input(
        &self,
        workflow_id: &str,
        nodes: &[WorkflowNode],
        edges: &[WorkflowEdge],
        input: Value,
        executor: Arc<dyn NodeExecutor>,
    ) -> Result<WorkflowRunReport> {
        let started = Instant::now();
        let plan = self.planner.create_execution_plan(workflow_id, nodes, edges)?;
        let by_id: BTreeMap<&str, &WorkflowNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut report = WorkflowRunReport {
            workflow_id: workflow_id.to_string(),
            outputs: BTreeMap::new(),
            failed: BTreeMap::new(),
            cache_hits: 0,
            duration: Duration::ZERO,
        };
        // node id -> task id of its completed task
        let mut task_ids: BTreeMap<String, String> = BTreeMap::new();
        let mut guard = RunGuard {
            queue: &self.queue,
            workflow_id: workflow_id.to_string(),
            task_ids: Vec::with_capacity(plan.node_count()),
        };

        info!(
            workflow_id = %workflow_id,
            nodes = plan.node_count(),
            partitions = plan.partitions.len(),
            "Workflow run started"
        );

        for partition in &plan.partitions {
            let mut submitted: BTreeMap<String, String> = BTreeMap::new();
            for node_id in partition {
                let upstream = plan.dependencies.get(node_id).cloned().unwrap_or_default();
                if let Some(bad) = upstream.iter().find(|u| report.failed.contains_key(*u)) {
                    report
                        .failed
                        .insert(node_id.clone(), format!("upstream node {} failed", bad));
                    continue;
                }
                let Some(node) = by_id.get(node_id.as_str()) else {
                    continue;
                };
                let task = self.build_task(workflow_id, node, &input, &upstream, &report, &task_ids)?;
                let task_id = task.id.clone();
                let admission = self.lock_queue().try_enqueue(task);
                match admission {
                    Admission::Accepted { .. } => {
                        guard.task_ids.push(task_id.clone());
                        submitted.insert(task_id, node_id.clone());
                    }
                    rejected => {
                        return Err(match rejected {
                            Admission::QueueFull { capacity } => CoreError::resource_exhausted(
                                "task_queue",
                                capacity as u64,
                                capacity as u64,
                            ),
                            _ => CoreError::validation(format!(
                                "workflow {} already has node {} in flight",
                                workflow_id, node_id
                            )),
                        });
                    }
                }
            }

            self.drain_partition(workflow_id, &submitted, &executor, &mut report, &mut task_ids)
                .await?;
        }

        report.duration = started.elapsed();
        if report.is_success() {
            info!(
                workflow_id = %workflow_id,
                duration_ms = report.duration.as_millis() as u64,
                cache_hits = report.cache_hits,
                "Workflow run completed"
            );
        } else {
            warn!(
                workflow_id = %workflow_id,
                failed = report.failed.len(),
                "Workflow run finished with failures"
            );
        }
        Ok(report)
    }

    pub fn shutdown(&self) {
        info!("Shutting down runtime");
        self.memory.shutdown();
        self.pool.shutdown();
        self.events.close();
    }

    fn build_task(
        &self,
        workflow_id: &str,
        node: &WorkflowNode,
        input: &Value,
        upstream: &[String],
        report: &WorkflowRunReport,
        task_ids: &BTreeMap<String, String>,
    ) -> Result<Task> {
        let upstream_outputs: Map<String, Value> = upstream
            .iter()
            .filter_map(|u| report.outputs.get(u).map(|v| (u.clone(), v.clone())))
            .collect();
        let descriptor = serde_json::to_value(node)?;
        let mut task = self
            .lock_queue()
            .new_task(workflow_id, node.id.clone())
            .with_descriptor(descriptor)
            .with_input(json!({ "input": input, "upstream": upstream_outputs }))
            .with_dependencies(upstream.iter().filter_map(|u| task_ids.get(u).cloned()));

        if let Some(priority) = node.config.get("priority") {
            if let Ok(priority) = serde_json::from_value(priority.clone()) {
                task = task.with_priority(priority);
            }
        }
        if let Some(ms) = node.config.get("timeoutMs").and_then(Value::as_u64) {
            task = task.with_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = node.config.get("maxRetries").and_then(Value::as_u64) {
            task = task.with_max_retries(retries as u32);
        }
        Ok(task)
    }

    /// Dispatch every submitted task of one partition until all are terminal
    async fn drain_partition(
        &self,
        workflow_id: &str,
        submitted: &BTreeMap<String, String>,
        executor: &Arc<dyn NodeExecutor>,
        report: &mut WorkflowRunReport,
        task_ids: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let max_in_flight = self.config.runtime.max_in_flight;
        let mut in_flight = FuturesUnordered::new();

        loop {
            let mut level = self.memory.check();
            if level == PressureLevel::Critical && in_flight.is_empty() {
                // Drained under pressure; let reclaimers catch up before resuming
                tokio::time::sleep(self.config.runtime.backpressure_poll).await;
                level = self.memory.check();
                if level == PressureLevel::Critical {
                    debug!(workflow_id = %workflow_id, "Resuming under critical memory pressure");
                }
            }
            let paused = level == PressureLevel::Critical && !in_flight.is_empty();

            while !paused && in_flight.len() < max_in_flight {
                let next = self.lock_queue().dequeue_workflow(workflow_id);
                let Some(task) = next else {
                    break;
                };
                let key = fingerprint_key(&task);
                let cached = self.lock_cache().get(&key);
                if let Some(output) = cached {
                    self.lock_queue().complete(&task.id)?;
                    report.cache_hits += 1;
                    task_ids.insert(task.node_id.clone(), task.id.clone());
                    report.outputs.insert(task.node_id.clone(), output);
                    continue;
                }
                in_flight.push(self.dispatch(task, key, executor.clone()));
                if level == PressureLevel::Critical {
                    break;
                }
            }

            let Some((task, key, outcome)) = in_flight.next().await else {
                break;
            };
            self.settle(task, key, outcome, report, task_ids)?;
        }

        // Anything still non-terminal was blocked on a failed dependency
        let mut queue = self.lock_queue();
        for (task_id, node_id) in submitted {
            if report.outputs.contains_key(node_id) || report.failed.contains_key(node_id) {
                continue;
            }
            let reason = match queue.status(task_id) {
                Some(TaskStatus::Failed) => queue
                    .get(task_id)
                    .and_then(|t| t.failure_reason.clone())
                    .unwrap_or_else(|| "failed".to_string()),
                _ => {
                    let _ = queue.fail(task_id, "not runnable");
                    "not runnable".to_string()
                }
            };
            report.failed.insert(node_id.clone(), reason);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        task: Task,
        key: String,
        executor: Arc<dyn NodeExecutor>,
    ) -> impl Future<Output = (Task, String, Result<Value>)> {
        let retry = self.retry.clone();
        let ctx = ExecutionContext {
            workflow_id: task.workflow_id.clone(),
            pool: self.pool.clone(),
            events: self.events.clone(),
        };
        async move {
            let retry_ctx = RetryContext::new(task.node_type())
                .with_operation(format!("{}/{}", task.workflow_id, task.node_id));
            let limit = task.timeout;
            let (task_ref, ctx_ref, executor_ref) = (&task, &ctx, &*executor);
            let outcome = retry
                .execute_with_retry(
                    move || async move {
                        match tokio::time::timeout(limit, executor_ref.execute(task_ref, ctx_ref))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(CoreError::timeout(task_ref.node_id.clone(), limit)),
                        }
                    },
                    &retry_ctx,
                )
                .await;
            (task, key, outcome)
        }
    }

    fn settle(
        &self,
        task: Task,
        key: String,
        outcome: Result<Value>,
        report: &mut WorkflowRunReport,
        task_ids: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        match outcome {
            Ok(output) => {
                if let Err(e) = self.lock_cache().set(key, output.clone()) {
                    warn!(task_id = %task.id, error = %e, "Result not cached");
                }
                self.lock_queue().complete(&task.id)?;
                task_ids.insert(task.node_id.clone(), task.id.clone());
                report.outputs.insert(task.node_id, output);
            }
            Err(e) => {
                let mut queue = self.lock_queue();
                if requeueable(&e) && queue.retry(&task.id) {
                    return Ok(());
                }
                if queue.status(&task.id) != Some(TaskStatus::Failed) {
                    queue.fail(&task.id, e.to_string())?;
                }
                let reason = queue
                    .get(&task.id)
                    .and_then(|t| t.failure_reason.clone())
                    .unwrap_or_else(|| e.to_string());
                report.failed.insert(task.node_id, reason);
            }
        }
        Ok(())
    }

    fn lock_queue(&self) -> MutexGuard<'_, TaskQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, ResultCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.memory.shutdown();
    }
}

/// Failures worth another pass through the queue
fn requeueable(err: &CoreError) -> bool {
    match err {
        CoreError::RetryExhausted { last_error, .. } => last_error.is_retryable(),
        other => other.is_retryable(),
    }
}
