use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Scheduling class. Ordering is strict: `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Highest first, the order lanes are scanned in
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }

    pub(crate) fn lane(&self) -> usize {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One schedulable unit of work for a single workflow node in one run.
///
/// `node` and `input` are opaque to the core; only the node executor
/// interprets them.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub node: Value,
    pub input: Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    /// Ids of tasks that must be `Completed` before this one may run
    pub dependencies: BTreeSet<String>,
    pub failure_reason: Option<String>,
}

impl Task {
    pub fn new(workflow_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            node_id: node_id.into(),
            node: Value::Null,
            input: Value::Null,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            timeout: DEFAULT_TASK_TIMEOUT,
            dependencies: BTreeSet::new(),
            failure_reason: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_descriptor(mut self, node: Value) -> Self {
        self.node = node;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Node type as declared in the descriptor, used as the retry category
    pub fn node_type(&self) -> &str {
        self.node
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("default")
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.workflow_id, &self.node_id, &self.node, &self.input)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Deterministic identity of a unit of work.
///
/// serde_json maps keep their keys sorted, so two inputs that differ only in
/// key order hash identically.
pub fn fingerprint(workflow_id: &str, node_id: &str, node: &Value, input: &Value) -> String {
    let canonical = json!({
        "workflow_id": workflow_id,
        "node_id": node_id,
        "node": node,
        "input": input,
    });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}
