// Infrastructure shared by every component of the execution core

pub mod config;
pub mod errors;
pub mod events;
pub mod telemetry;

// Re-export commonly used types
pub use config::{
    CacheConfig, CircuitBreakerConfig, CoreConfig, CoreConfigBuilder, MemoryConfig, PoolConfig,
    QueueConfig, RetryConfig, RuntimeConfig,
};
pub use errors::{CoreError, Result};
pub use events::{BufferingEventSink, CoreEvent, EventBus, EventEnvelope, EventSink, LoggingEventSink};
