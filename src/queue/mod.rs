//! Task admission, ordering and lifecycle

pub mod task;
pub mod task_queue;

pub use task::{fingerprint, Task, TaskPriority, TaskStatus};
pub use task_queue::{Admission, PriorityDepth, QueueMetrics, TaskQueue};
