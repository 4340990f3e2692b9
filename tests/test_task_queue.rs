//! Task queue behaviour through the public API
//!
//! Ordering, deduplication, retry bounds and lifecycle notifications.

use flowcore::core::events::{BufferingEventSink, CoreEvent, EventBus};
use flowcore::queue::{Task, TaskPriority, TaskQueue, TaskStatus};
use flowcore::QueueConfig;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn queue() -> TaskQueue {
    TaskQueue::new(QueueConfig::default()).unwrap()
}

// Strict class precedence regardless of arrival order
#[test]
fn test_dequeue_order_by_priority() {
    let mut q = queue();
    q.enqueue(Task::new("wf", "low").with_priority(TaskPriority::Low));
    q.enqueue(Task::new("wf", "high").with_priority(TaskPriority::High));
    q.enqueue(Task::new("wf", "critical").with_priority(TaskPriority::Critical));

    let order: Vec<String> = std::iter::from_fn(|| q.dequeue())
        .map(|t| t.node_id)
        .collect();
    assert_eq!(order, vec!["critical", "high", "low"]);
}

#[test]
fn test_duplicate_fingerprint_rejected() {
    let mut q = queue();
    let make = || {
        Task::new("wf-1", "fetch")
            .with_descriptor(json!({"type": "http", "url": "https://example.com"}))
            .with_input(json!({"page": 1}))
    };

    let results = [q.enqueue(make()), q.enqueue(make())];
    assert_eq!(results, [true, false]);

    let metrics = q.get_metrics();
    assert_eq!(metrics.total_queued, 1);
    assert_eq!(metrics.rejected_duplicates, 1);
    assert_eq!(metrics.current_depth, 1);
}

// maxRetries = 3 and four failed attempts: three retries, then terminal failure
#[test]
fn test_retry_bound() {
    let mut q = queue();
    q.enqueue(Task::new("wf", "flaky").with_id("flaky").with_max_retries(3));

    let mut retried = 0;
    for _ in 0..4 {
        let task = q.dequeue().expect("task should be runnable");
        assert_eq!(task.status, TaskStatus::Running);
        if q.retry(&task.id) {
            retried += 1;
        }
    }

    assert_eq!(retried, 3);
    assert_eq!(q.status("flaky"), Some(TaskStatus::Failed));
    assert!(q.dequeue().is_none());

    let metrics = q.get_metrics();
    assert_eq!(metrics.retried_tasks, 3);
    assert_eq!(metrics.failed_tasks, 1);
    assert_eq!(metrics.total_queued, 1);
}

#[test]
fn test_metrics_idempotent() {
    let mut q = queue();
    q.enqueue(Task::new("wf", "a"));
    q.enqueue(Task::new("wf", "b").with_priority(TaskPriority::High));
    let running = q.dequeue().unwrap();
    q.complete(&running.id).unwrap();

    let first = q.get_metrics();
    let second = q.get_metrics();
    assert_eq!(first, second);
    assert_eq!(first.completed_tasks, 1);
    assert_eq!(first.depth_by_priority.normal, 1);
}

#[test]
fn test_lifecycle_events() {
    let bus = Arc::new(EventBus::new(32));
    let sink = Arc::new(BufferingEventSink::new());
    bus.attach_sink(sink.clone());
    let mut q = queue().with_events(bus);

    q.enqueue(Task::new("wf", "ok").with_id("ok"));
    q.enqueue(Task::new("wf", "bad").with_id("bad").with_max_retries(1));

    let ok = q.dequeue().unwrap();
    q.complete(&ok.id).unwrap();
    let bad = q.dequeue().unwrap();
    assert!(q.retry(&bad.id));
    let bad = q.dequeue().unwrap();
    q.fail(&bad.id, "gave up").unwrap();

    let kinds: Vec<&'static str> = sink
        .get_events()
        .iter()
        .map(|e| match e.event {
            CoreEvent::TaskEnqueued { .. } => "enqueued",
            CoreEvent::TaskStarted { .. } => "started",
            CoreEvent::TaskCompleted { .. } => "completed",
            CoreEvent::TaskFailed { .. } => "failed",
            CoreEvent::TaskRetried { .. } => "retried",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "enqueued", "enqueued", "started", "completed", "started", "retried", "started",
            "failed"
        ]
    );
}

#[test]
fn test_dependency_chain_across_priorities() {
    let mut q = queue();
    q.enqueue(Task::new("wf", "extract").with_id("extract").with_priority(TaskPriority::Low));
    q.enqueue(
        Task::new("wf", "load")
            .with_id("load")
            .with_priority(TaskPriority::Critical)
            .with_dependencies(["extract"]),
    );

    // The critical task waits for its low-priority dependency
    let first = q.dequeue().unwrap();
    assert_eq!(first.id, "extract");
    assert!(q.dequeue().is_none());
    q.complete("extract").unwrap();
    assert_eq!(q.dequeue().unwrap().id, "load");
}
