use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit::{CircuitBreaker, CircuitSnapshot, CircuitStatus};
use crate::core::config::{CircuitBreakerConfig, RetryConfig};
use crate::core::errors::{CoreError, Result};
use crate::core::events::EventBus;

/// Identifies what is being retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// Circuit breaker key, usually the node type
    pub category: String,
    /// Human-readable name for logs and errors
    pub operation: String,
    /// Overrides `RetryConfig::max_attempts` for this call
    pub max_attempts: Option<u32>,
}

impl RetryContext {
    pub fn new(category: impl Into<String>) -> Self {
        let category = category.into();
        Self {
            operation: category.clone(),
            category,
            max_attempts: None,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub retried_attempts: u64,
    pub circuit_rejections: u64,
    pub circuits: BTreeMap<String, CircuitSnapshot>,
}

#[derive(Debug, Default)]
struct Counters {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    retried_attempts: AtomicU64,
    circuit_rejections: AtomicU64,
}

/// Retry with exponential backoff behind a per-category circuit breaker.
///
/// Only errors for which [`CoreError::is_retryable`] holds consume another
/// attempt; everything else surfaces after the first try. Each call that ends
/// in failure, whether exhausted or not, counts once against the circuit.
pub struct SmartRetry {
    config: RetryConfig,
    breaker: CircuitBreaker,
    counters: Counters,
}

impl SmartRetry {
    pub fn new(config: RetryConfig, circuit: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        circuit.validate()?;
        Ok(Self {
            config,
            breaker: CircuitBreaker::new(circuit),
            counters: Counters::default(),
        })
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.breaker = self.breaker.with_events(events);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn execute_with_retry<T, F, Fut>(&self, mut operation: F, ctx: &RetryContext) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.breaker.try_acquire(&ctx.category) {
            self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            debug!(category = %ctx.category, operation = %ctx.operation, "Rejected by open circuit");
            return Err(e);
        }

        let max_attempts = ctx.max_attempts.unwrap_or(self.config.max_attempts).max(1);
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.config.operation_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::timeout(ctx.operation.clone(), limit)),
                },
                None => operation().await,
            };

            let error = match outcome {
                Ok(value) => {
                    self.breaker.record_success(&ctx.category);
                    self.counters.successful_calls.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) => e,
            };

            attempt += 1;
            if !error.is_retryable() {
                self.fail(ctx);
                debug!(operation = %ctx.operation, error = %error, "Non-retryable failure");
                return Err(error);
            }
            if attempt >= max_attempts {
                self.fail(ctx);
                warn!(
                    operation = %ctx.operation,
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(CoreError::RetryExhausted {
                    operation: ctx.operation.clone(),
                    attempts: attempt,
                    last_error: Box::new(error),
                });
            }

            let delay = self.delay_for(attempt - 1);
            self.counters.retried_attempts.fetch_add(1, Ordering::Relaxed);
            debug!(
                operation = %ctx.operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// `min(base * multiplier^attempt, max)`, plus optional jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let max_ms = self.config.max_delay.as_millis() as f64;
        let capped = (base_ms * self.config.multiplier.powi(attempt as i32)).min(max_ms);
        let jittered = if self.config.jitter > 0.0 {
            capped + capped * self.config.jitter * fastrand::f64()
        } else {
            capped
        };
        Duration::from_millis(jittered.round() as u64)
    }

    pub fn circuit_state(&self, category: &str) -> CircuitStatus {
        self.breaker.status(category)
    }

    pub fn reset_circuit(&self, category: &str) {
        self.breaker.reset(category);
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            total_calls: self.counters.total_calls.load(Ordering::Relaxed),
            successful_calls: self.counters.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.counters.failed_calls.load(Ordering::Relaxed),
            retried_attempts: self.counters.retried_attempts.load(Ordering::Relaxed),
            circuit_rejections: self.counters.circuit_rejections.load(Ordering::Relaxed),
            circuits: self.breaker.snapshot(),
        }
    }

    fn fail(&self, ctx: &RetryContext) {
        self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
        self.breaker.record_failure(&ctx.category);
    }
}
