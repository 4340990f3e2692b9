pub mod circuit;
pub mod smart_retry;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitStatus};
pub use smart_retry::{RetryContext, RetryMetrics, SmartRetry};
