//! Notification channel for lifecycle events
//!
//! Components publish [`CoreEvent`]s through a shared [`EventBus`]. Async
//! consumers subscribe to a broadcast receiver; synchronous consumers attach
//! an [`EventSink`]. Publishing never blocks: when a subscriber falls behind,
//! its oldest undelivered events are dropped.

use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::core::errors::{CoreError, Result};
use crate::memory::PressureLevel;
use crate::retry::CircuitStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoreEvent {
    TaskEnqueued {
        task_id: String,
        workflow_id: String,
        node_id: String,
        priority: String,
    },
    TaskStarted {
        task_id: String,
        workflow_id: String,
    },
    TaskCompleted {
        task_id: String,
        workflow_id: String,
    },
    TaskFailed {
        task_id: String,
        workflow_id: String,
        reason: String,
    },
    TaskRetried {
        task_id: String,
        workflow_id: String,
        retry_count: u32,
    },
    CircuitStateChanged {
        category: String,
        from: CircuitStatus,
        to: CircuitStatus,
    },
    PoolExhausted {
        resource: String,
        waited_ms: u64,
    },
    MemoryAlert {
        level: PressureLevel,
        utilization: f64,
    },
    GcCompleted {
        reason: String,
        freed_bytes: u64,
        duration_ms: u64,
    },
    PlanCreated {
        workflow_id: String,
        partitions: usize,
        estimated_duration_ms: u64,
    },
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: CoreEvent,
}

/// Synchronous event consumer
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Writes every event to the tracing log at debug level
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        tracing::debug!(sequence = envelope.sequence, "Event: {:?}", envelope.event);
    }
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: RwLock<Vec<EventEnvelope>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<EventEnvelope> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        if let Ok(mut events) = self.events.write() {
            events.push(envelope.clone());
        }
    }
}

/// Broadcast hub shared by every component of one runtime
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    // Keeps the channel open while nobody is subscribed.
    template: InactiveReceiver<EventEnvelope>,
    sequence: AtomicU64,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true);
        Self {
            sender,
            template: receiver.deactivate(),
            sequence: AtomicU64::new(0),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// New receiver that sees every event emitted from now on
    pub fn subscribe(&self) -> Result<Receiver<EventEnvelope>> {
        if self.is_closed() {
            return Err(CoreError::channel("events", "event bus is closed"));
        }
        Ok(self.template.activate_cloned())
    }

    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    pub fn emit(&self, event: CoreEvent) {
        let envelope = EventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        };

        if let Ok(sinks) = self.sinks.read() {
            for sink in sinks.iter() {
                sink.emit(&envelope);
            }
        }

        match self.sender.try_broadcast(envelope) {
            Ok(_) | Err(TrySendError::Inactive(_)) => {}
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("event bus closed, dropping event");
            }
            Err(TrySendError::Full(_)) => {
                // unreachable with overflow enabled
                tracing::warn!("event bus full, dropping event");
            }
        }
    }

    /// Number of events published so far
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("emitted", &self.emitted())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(id: &str) -> CoreEvent {
        CoreEvent::TaskCompleted {
            task_id: id.to_string(),
            workflow_id: "wf".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe().unwrap();

        bus.emit(completed("a"));
        bus.emit(completed("b"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.event, completed("b"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(2);
        for i in 0..10 {
            bus.emit(completed(&i.to_string()));
        }
        assert_eq!(bus.emitted(), 10);
    }

    #[test]
    fn test_buffering_sink() {
        let bus = EventBus::new(4);
        let sink = Arc::new(BufferingEventSink::new());
        bus.attach_sink(sink.clone());

        bus.emit(completed("x"));
        let events = sink.get_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, completed("x"));

        sink.clear();
        assert!(sink.get_events().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe().unwrap();
        for i in 0..5 {
            bus.emit(completed(&i.to_string()));
        }
        // Lagging receiver first learns how much it missed
        assert!(matches!(
            rx.recv().await,
            Err(async_broadcast::RecvError::Overflowed(_))
        ));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.sequence, 3);
    }

    #[test]
    fn test_subscribe_after_close_fails() {
        let bus = EventBus::new(2);
        bus.close();
        assert!(matches!(bus.subscribe(), Err(CoreError::Channel { .. })));
    }

    #[test]
    fn test_logging_sink_alongside_buffer() {
        let _ = crate::core::telemetry::init_tracing(tracing::Level::DEBUG);
        let bus = EventBus::new(2);
        let sink = Arc::new(BufferingEventSink::new());
        bus.attach_sink(Arc::new(LoggingEventSink));
        bus.attach_sink(sink.clone());

        bus.emit(completed("logged"));
        assert_eq!(sink.get_events().len(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(completed("t1")).unwrap();
        assert_eq!(json["type"], "TaskCompleted");
        assert_eq!(json["task_id"], "t1");
    }
}
