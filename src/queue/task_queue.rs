use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::QueueConfig;
use crate::core::errors::{CoreError, Result};
use crate::core::events::{CoreEvent, EventBus};
use crate::queue::task::{Task, TaskPriority, TaskStatus};

/// Outcome of an admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted { task_id: String },
    /// A non-terminal task with the same fingerprint is already held
    Duplicate { existing_task_id: String },
    QueueFull { capacity: usize },
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }
}

/// Position inside a priority lane; earlier `at` first, admission order breaks ties
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LaneKey {
    at: DateTime<Utc>,
    seq: u64,
}

enum DependencyState {
    Satisfied,
    Waiting,
    Failed(String),
}

/// Per-priority pending counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityDepth {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    /// Successful admissions; retries do not count again
    pub total_queued: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub retried_tasks: u64,
    pub rejected_duplicates: u64,
    pub rejected_capacity: u64,
    /// Pending tasks
    pub current_depth: usize,
    pub running_tasks: usize,
    /// Task records still held, terminal ones included
    pub records: usize,
    pub depth_by_priority: PriorityDepth,
}

/// Central scheduler queue.
///
/// Admits and deduplicates tasks, hands out the highest-priority task whose
/// dependencies have completed, and tracks each task until it is terminal.
/// All methods take `&mut self`: the queue is driven from a single scheduler
/// context and never locks.
pub struct TaskQueue {
    config: QueueConfig,
    tasks: HashMap<String, Task>,
    /// fingerprint -> task id, non-terminal tasks only
    fingerprints: HashMap<String, String>,
    /// task id -> fingerprint, the reverse of `fingerprints`
    fingerprint_of: HashMap<String, String>,
    lanes: [BTreeMap<LaneKey, String>; 4],
    lane_keys: HashMap<String, LaneKey>,
    /// Terminal status of pruned tasks that live tasks still depend on
    settled: HashMap<String, TaskStatus>,
    next_seq: u64,
    active: usize,
    metrics: QueueMetrics,
    events: Option<Arc<EventBus>>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tasks: HashMap::new(),
            fingerprints: HashMap::new(),
            fingerprint_of: HashMap::new(),
            lanes: Default::default(),
            lane_keys: HashMap::new(),
            settled: HashMap::new(),
            next_seq: 0,
            active: 0,
            metrics: QueueMetrics::default(),
            events: None,
        })
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Task prefilled with this queue's default retry bound and timeout
    pub fn new_task(&self, workflow_id: impl Into<String>, node_id: impl Into<String>) -> Task {
        Task::new(workflow_id, node_id)
            .with_max_retries(self.config.default_max_retries)
            .with_timeout(self.config.default_task_timeout)
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Admit a task. Returns false for duplicates and when at capacity.
    pub fn enqueue(&mut self, task: Task) -> bool {
        self.try_enqueue(task).is_accepted()
    }

    pub fn try_enqueue(&mut self, mut task: Task) -> Admission {
        let fingerprint = task.fingerprint();
        if let Some(existing) = self.fingerprints.get(&fingerprint) {
            self.metrics.rejected_duplicates += 1;
            debug!(task_id = %task.id, existing = %existing, "Rejected duplicate task");
            return Admission::Duplicate {
                existing_task_id: existing.clone(),
            };
        }
        if self.tasks.contains_key(&task.id) {
            self.metrics.rejected_duplicates += 1;
            return Admission::Duplicate {
                existing_task_id: task.id,
            };
        }
        if self.active >= self.config.capacity {
            self.metrics.rejected_capacity += 1;
            warn!(
                capacity = self.config.capacity,
                task_id = %task.id,
                "Task queue full, rejecting task"
            );
            return Admission::QueueFull {
                capacity: self.config.capacity,
            };
        }

        task.status = TaskStatus::Pending;
        task.failure_reason = None;
        let task_id = task.id.clone();
        let key = LaneKey {
            at: task.created_at,
            seq: self.bump_seq(),
        };
        self.lanes[task.priority.lane()].insert(key, task_id.clone());
        self.lane_keys.insert(task_id.clone(), key);
        self.fingerprints.insert(fingerprint.clone(), task_id.clone());
        self.fingerprint_of.insert(task_id.clone(), fingerprint);
        self.active += 1;
        self.metrics.total_queued += 1;

        debug!(
            task_id = %task_id,
            workflow_id = %task.workflow_id,
            priority = %task.priority,
            "Task enqueued"
        );
        self.emit(CoreEvent::TaskEnqueued {
            task_id: task_id.clone(),
            workflow_id: task.workflow_id.clone(),
            node_id: task.node_id.clone(),
            priority: task.priority.to_string(),
        });
        self.tasks.insert(task_id.clone(), task);

        Admission::Accepted { task_id }
    }

    /// Highest-priority pending task whose dependencies are all completed.
    ///
    /// Pending tasks with a failed dependency are failed along the way.
    pub fn dequeue(&mut self) -> Option<Task> {
        self.dequeue_matching(|_| true)
    }

    /// Like [`dequeue`](Self::dequeue), restricted to one workflow's tasks
    pub fn dequeue_workflow(&mut self, workflow_id: &str) -> Option<Task> {
        self.dequeue_matching(|task| task.workflow_id == workflow_id)
    }

    fn dequeue_matching<F>(&mut self, accept: F) -> Option<Task>
    where
        F: Fn(&Task) -> bool,
    {
        loop {
            let mut doomed = Vec::new();
            let mut picked = None;

            'scan: for priority in TaskPriority::ALL {
                for (key, id) in &self.lanes[priority.lane()] {
                    let Some(task) = self.tasks.get(id) else {
                        continue;
                    };
                    if !accept(task) {
                        continue;
                    }
                    match self.dependency_state(task) {
                        DependencyState::Satisfied => {
                            picked = Some((priority, *key));
                            break 'scan;
                        }
                        DependencyState::Failed(dep) => doomed.push((id.clone(), dep)),
                        DependencyState::Waiting => {}
                    }
                }
            }

            let cascaded = !doomed.is_empty();
            for (id, dep) in doomed {
                self.mark_failed(&id, format!("dependency {} failed", dep));
            }

            if let Some((priority, key)) = picked {
                let id = self.lanes[priority.lane()].remove(&key)?;
                self.lane_keys.remove(&id);
                let task = self.tasks.get_mut(&id)?;
                task.status = TaskStatus::Running;
                let snapshot = task.clone();
                self.emit(CoreEvent::TaskStarted {
                    task_id: snapshot.id.clone(),
                    workflow_id: snapshot.workflow_id.clone(),
                });
                return Some(snapshot);
            }
            if !cascaded {
                return None;
            }
        }
    }

    pub fn complete(&mut self, task_id: &str) -> Result<()> {
        let task = self.transition_source(task_id, TaskStatus::Completed)?;
        let workflow_id = task.workflow_id.clone();
        task.status = TaskStatus::Completed;
        self.settle(task_id);
        self.metrics.completed_tasks += 1;
        debug!(task_id = %task_id, "Task completed");
        self.emit(CoreEvent::TaskCompleted {
            task_id: task_id.to_string(),
            workflow_id,
        });
        Ok(())
    }

    pub fn fail(&mut self, task_id: &str, reason: impl Into<String>) -> Result<()> {
        self.transition_source(task_id, TaskStatus::Failed)?;
        self.mark_failed(task_id, reason.into());
        Ok(())
    }

    /// Re-admit a task after a failed attempt.
    ///
    /// Returns true when the task went back to pending. Once `max_retries`
    /// is spent the task is failed for good and false is returned.
    pub fn retry(&mut self, task_id: &str) -> bool {
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        if !task.can_retry() {
            let reason = format!("retries exhausted ({}/{})", task.retry_count, task.max_retries);
            self.mark_failed(task_id, reason);
            return false;
        }

        if let Some(key) = self.lane_keys.remove(task_id) {
            if let Some(task) = self.tasks.get(task_id) {
                self.lanes[task.priority.lane()].remove(&key);
            }
        }
        let key = LaneKey {
            at: Utc::now(),
            seq: self.bump_seq(),
        };
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        let (priority, workflow_id, retry_count) =
            (task.priority, task.workflow_id.clone(), task.retry_count);
        self.lanes[priority.lane()].insert(key, task_id.to_string());
        self.lane_keys.insert(task_id.to_string(), key);
        self.metrics.retried_tasks += 1;

        info!(task_id = %task_id, retry_count, "Task scheduled for retry");
        self.emit(CoreEvent::TaskRetried {
            task_id: task_id.to_string(),
            workflow_id,
            retry_count,
        });
        true
    }

    /// Fail every non-terminal task of a workflow; returns how many were failed
    pub fn cancel_workflow(&mut self, workflow_id: &str) -> usize {
        let ids: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id && !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            self.mark_failed(id, "cancelled".to_string());
        }
        ids.len()
    }

    /// Drop records of terminal tasks. Outcomes are kept only while a live
    /// task still depends on them.
    pub fn prune_terminal(&mut self) -> usize {
        let terminal: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in &terminal {
            if let Some(task) = self.tasks.remove(id) {
                self.settled.insert(task.id, task.status);
            }
        }
        let referenced: HashSet<&String> = self
            .tasks
            .values()
            .flat_map(|t| t.dependencies.iter())
            .collect();
        self.settled.retain(|id, _| referenced.contains(id));
        terminal.len()
    }

    /// Drop every record of the given tasks once they are terminal; returns
    /// how many were dropped. Non-terminal tasks are left alone.
    pub fn forget<'a, I>(&mut self, task_ids: I) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut dropped = 0;
        for id in task_ids {
            let terminal = self
                .tasks
                .get(id)
                .map(|t| t.status.is_terminal())
                .unwrap_or(true);
            if terminal {
                let removed = self.tasks.remove(id).is_some();
                if self.settled.remove(id).is_some() || removed {
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Number of task records held, terminal ones included
    pub fn records(&self) -> usize {
        self.tasks.len() + self.settled.len()
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .get(task_id)
            .map(|t| t.status)
            .or_else(|| self.settled.get(task_id).copied())
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.lane_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lane_keys.is_empty()
    }

    /// Pending plus running tasks
    pub fn active(&self) -> usize {
        self.active
    }

    /// Pending task ids in dequeue-scan order (ignoring dependencies)
    pub fn pending_ids(&self) -> Vec<String> {
        self.lanes
            .iter()
            .flat_map(|lane| lane.values().cloned())
            .collect()
    }

    pub fn get_metrics(&self) -> QueueMetrics {
        let lane_len = |p: TaskPriority| self.lanes[p.lane()].len();
        QueueMetrics {
            current_depth: self.len(),
            running_tasks: self.active - self.len(),
            records: self.records(),
            depth_by_priority: PriorityDepth {
                critical: lane_len(TaskPriority::Critical),
                high: lane_len(TaskPriority::High),
                normal: lane_len(TaskPriority::Normal),
                low: lane_len(TaskPriority::Low),
            },
            ..self.metrics.clone()
        }
    }

    fn transition_source(&mut self, task_id: &str, to: TaskStatus) -> Result<&mut Task> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::task_not_found(task_id))?;
        if task.status.is_terminal() {
            return Err(CoreError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(task)
    }

    fn dependency_state(&self, task: &Task) -> DependencyState {
        for dep in &task.dependencies {
            match self.status(dep) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) => return DependencyState::Failed(dep.clone()),
                _ => return DependencyState::Waiting,
            }
        }
        DependencyState::Satisfied
    }

    fn mark_failed(&mut self, task_id: &str, reason: String) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.status = TaskStatus::Failed;
        task.failure_reason = Some(reason.clone());
        let workflow_id = task.workflow_id.clone();
        self.settle(task_id);
        self.metrics.failed_tasks += 1;
        warn!(task_id = %task_id, reason = %reason, "Task failed");
        self.emit(CoreEvent::TaskFailed {
            task_id: task_id.to_string(),
            workflow_id,
            reason,
        });
    }

    /// Release lane slot, fingerprint and capacity held by a now-terminal task
    fn settle(&mut self, task_id: &str) {
        if let Some(key) = self.lane_keys.remove(task_id) {
            for lane in self.lanes.iter_mut() {
                if lane.remove(&key).is_some() {
                    break;
                }
            }
        }
        if let Some(fingerprint) = self.fingerprint_of.remove(task_id) {
            self.fingerprints.remove(&fingerprint);
        }
        self.active = self.active.saturating_sub(1);
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn emit(&self, event: CoreEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }
}
