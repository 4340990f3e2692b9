use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::core::config::CircuitBreakerConfig;
use crate::core::errors::{CoreError, Result};
use crate::core::events::{CoreEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// Set while the single half-open trial call is outstanding
    trial_started_at: Option<Instant>,
}

/// Point-in-time view of one category's circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub status: CircuitStatus,
    pub failures: u32,
    pub successes: u32,
}

/// Per-category fail-fast guard.
///
/// Each category's counters sit behind a dashmap shard lock that is never held
/// across an await, so concurrent callers see consistent transitions.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, CircuitState>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Admit or reject a call for `category`.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and admits
    /// exactly one trial; other callers keep failing fast until it reports back.
    pub fn try_acquire(&self, category: &str) -> Result<()> {
        let now = Instant::now();
        let mut transition = None;
        let verdict = {
            let mut state = self.circuits.entry(category.to_string()).or_default();
            match state.status {
                CircuitStatus::Closed => Ok(()),
                CircuitStatus::Open => {
                    let opened_at = state.opened_at.unwrap_or(now);
                    let elapsed = now.duration_since(opened_at);
                    if elapsed >= self.config.timeout {
                        state.status = CircuitStatus::HalfOpen;
                        state.consecutive_successes = 0;
                        state.trial_started_at = Some(now);
                        transition = Some((CircuitStatus::Open, CircuitStatus::HalfOpen));
                        Ok(())
                    } else {
                        Err(self.open_error(category, (self.config.timeout - elapsed).as_millis()))
                    }
                }
                CircuitStatus::HalfOpen => match state.trial_started_at {
                    // An abandoned trial frees its slot after one cooldown period
                    Some(started) if now.duration_since(started) < self.config.timeout => {
                        Err(self.open_error(category, 0))
                    }
                    _ => {
                        state.trial_started_at = Some(now);
                        Ok(())
                    }
                },
            }
        };
        if let Some((from, to)) = transition {
            self.announce(category, from, to);
        }
        verdict
    }

    pub fn record_success(&self, category: &str) {
        let mut transition = None;
        {
            let mut state = self.circuits.entry(category.to_string()).or_default();
            state.consecutive_failures = 0;
            match state.status {
                CircuitStatus::HalfOpen => {
                    state.trial_started_at = None;
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        state.status = CircuitStatus::Closed;
                        state.consecutive_successes = 0;
                        state.opened_at = None;
                        transition = Some((CircuitStatus::HalfOpen, CircuitStatus::Closed));
                    }
                }
                CircuitStatus::Closed => state.consecutive_successes += 1,
                CircuitStatus::Open => {}
            }
        }
        if let Some((from, to)) = transition {
            self.announce(category, from, to);
        }
    }

    pub fn record_failure(&self, category: &str) {
        let mut transition = None;
        {
            let mut state = self.circuits.entry(category.to_string()).or_default();
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;
            match state.status {
                CircuitStatus::Closed
                    if state.consecutive_failures >= self.config.failure_threshold =>
                {
                    state.status = CircuitStatus::Open;
                    state.opened_at = Some(Instant::now());
                    transition = Some((CircuitStatus::Closed, CircuitStatus::Open));
                }
                CircuitStatus::HalfOpen => {
                    state.status = CircuitStatus::Open;
                    state.opened_at = Some(Instant::now());
                    state.trial_started_at = None;
                    transition = Some((CircuitStatus::HalfOpen, CircuitStatus::Open));
                }
                _ => {}
            }
        }
        if let Some((from, to)) = transition {
            self.announce(category, from, to);
        }
    }

    /// Current status; unknown categories are closed
    pub fn status(&self, category: &str) -> CircuitStatus {
        self.circuits
            .get(category)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn reset(&self, category: &str) {
        let previous = self.circuits.remove(category).map(|(_, s)| s.status);
        if let Some(from) = previous.filter(|s| *s != CircuitStatus::Closed) {
            self.announce(category, from, CircuitStatus::Closed);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.circuits
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    CircuitSnapshot {
                        status: entry.status,
                        failures: entry.consecutive_failures,
                        successes: entry.consecutive_successes,
                    },
                )
            })
            .collect()
    }

    fn open_error(&self, category: &str, retry_after_ms: u128) -> CoreError {
        CoreError::CircuitOpen {
            category: category.to_string(),
            retry_after_ms: retry_after_ms as u64,
        }
    }

    fn announce(&self, category: &str, from: CircuitStatus, to: CircuitStatus) {
        if to == CircuitStatus::Open {
            warn!(category = %category, %from, "Circuit opened");
        } else {
            info!(category = %category, %from, %to, "Circuit state changed");
        }
        if let Some(events) = &self.events {
            events.emit(CoreEvent::CircuitStateChanged {
                category: category.to_string(),
                from,
                to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            timeout: Duration::from_millis(100),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle() {
        let cb = breaker();
        assert_eq!(cb.status("db"), CircuitStatus::Closed);

        cb.record_failure("db");
        assert!(cb.try_acquire("db").is_ok());
        cb.record_failure("db");
        assert_eq!(cb.status("db"), CircuitStatus::Open);
        assert!(cb.try_acquire("db").unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cb.try_acquire("db").is_ok());
        assert_eq!(cb.status("db"), CircuitStatus::HalfOpen);
        // Only one trial at a time
        assert!(cb.try_acquire("db").is_err());

        cb.record_success("db");
        assert_eq!(cb.status("db"), CircuitStatus::HalfOpen);
        assert!(cb.try_acquire("db").is_ok());
        cb.record_success("db");
        assert_eq!(cb.status("db"), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker();
        cb.record_failure("api");
        cb.record_failure("api");
        tokio::time::advance(Duration::from_millis(150)).await;
        cb.try_acquire("api").unwrap();
        cb.record_failure("api");
        assert_eq!(cb.status("api"), CircuitStatus::Open);
        match cb.try_acquire("api") {
            Err(CoreError::CircuitOpen { retry_after_ms, .. }) => assert_eq!(retry_after_ms, 100),
            other => panic!("expected circuit open, got {:?}", other),
        }
    }

    #[test]
    fn test_categories_are_independent() {
        let cb = breaker();
        cb.record_failure("a");
        cb.record_failure("a");
        assert_eq!(cb.status("a"), CircuitStatus::Open);
        assert_eq!(cb.status("b"), CircuitStatus::Closed);
        assert!(cb.try_acquire("b").is_ok());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker();
        cb.record_failure("a");
        cb.record_success("a");
        cb.record_failure("a");
        assert_eq!(cb.status("a"), CircuitStatus::Closed);
    }

    #[test]
    fn test_reset_emits_event() {
        let bus = Arc::new(EventBus::new(8));
        let sink = Arc::new(crate::core::events::BufferingEventSink::new());
        bus.attach_sink(sink.clone());
        let cb = breaker().with_events(bus);

        cb.record_failure("a");
        cb.record_failure("a");
        cb.reset("a");
        assert_eq!(cb.status("a"), CircuitStatus::Closed);

        let transitions: Vec<_> = sink
            .get_events()
            .into_iter()
            .filter_map(|e| match e.event {
                CoreEvent::CircuitStateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CircuitStatus::Closed, CircuitStatus::Open),
                (CircuitStatus::Open, CircuitStatus::Closed)
            ]
        );
    }
}
