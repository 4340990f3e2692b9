use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::EvictionPolicy;
use crate::core::errors::{CoreError, Result};

/// Durations travel as integer milliseconds in config files
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Admission and lifecycle settings for the task queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of non-terminal tasks held at once
    pub capacity: usize,
    /// Retry bound applied to tasks that do not set their own
    pub default_max_retries: u32,
    /// Timeout applied to tasks that do not set their own
    #[serde(with = "duration_ms")]
    pub default_task_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_max_retries: 3,
            default_task_timeout: Duration::from_secs(300),
        }
    }
}

/// Connection pool sizing and keep-alive behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of exclusive database slots
    pub max_db_connections: usize,
    /// How long `acquire_db_connection` waits for a free slot
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub http_request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub http_keep_alive: Duration,
    /// HTTP agents unused for longer than this are dropped by `cleanup_idle`
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_db_connections: 10,
            connection_timeout: Duration::from_secs(30),
            http_request_timeout: Duration::from_secs(30),
            http_keep_alive: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            max_idle_per_host: 10,
        }
    }
}

/// Result cache bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Upper bound on stored (post-compression) bytes
    pub max_size_bytes: usize,
    #[serde(with = "option_duration_ms")]
    pub default_ttl: Option<Duration>,
    /// Serialized values larger than this are zstd-compressed
    pub compression_threshold: usize,
    pub compression_level: i32,
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_size_bytes: 100 * 1024 * 1024, // 100MB
            default_ttl: Some(Duration::from_secs(3600)),
            compression_threshold: 1024,
            compression_level: 3,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

/// Backoff policy for the retry layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added as random jitter (0 disables)
    pub jitter: f64,
    /// Per-attempt deadline
    #[serde(with = "option_duration_ms")]
    pub operation_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
            operation_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Cooldown before an open circuit admits a trial call
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Memory pressure thresholds, expressed as fractions of `memory_limit_bytes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub memory_limit_bytes: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub gc_trigger_threshold: f64,
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    /// Automatic collections closer together than this are skipped
    #[serde(with = "duration_ms")]
    pub min_gc_interval: Duration,
    pub max_alert_history: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 1024 * 1024 * 1024, // 1GB
            warning_threshold: 0.7,
            critical_threshold: 0.9,
            gc_trigger_threshold: 0.8,
            check_interval: Duration::from_secs(30),
            min_gc_interval: Duration::from_secs(60),
            max_alert_history: 100,
        }
    }
}

/// Scheduler loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum tasks executing concurrently inside one workflow run
    pub max_in_flight: usize,
    /// Buffered notifications per event subscriber
    pub event_capacity: usize,
    /// Pause between scheduler polls while under critical memory pressure
    #[serde(with = "duration_ms")]
    pub backpressure_poll: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            event_capacity: 1024,
            backpressure_poll: Duration::from_millis(100),
        }
    }
}

/// Top-level configuration for every component of the core
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub memory: MemoryConfig,
    pub runtime: RuntimeConfig,
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(CoreError::configuration_field(
                "capacity must be greater than 0",
                "queue.capacity",
            ));
        }
        Ok(())
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_db_connections == 0 {
            return Err(CoreError::configuration_field(
                "max_db_connections must be greater than 0",
                "pool.max_db_connections",
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(CoreError::configuration_field(
                "connection_timeout must be greater than 0",
                "pool.connection_timeout",
            ));
        }
        Ok(())
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CoreError::configuration("max_entries cannot be zero"));
        }
        if self.max_size_bytes == 0 {
            return Err(CoreError::configuration("max_size_bytes cannot be zero"));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(CoreError::configuration(
                "compression_level must be between 1 and 22",
            ));
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CoreError::configuration("max_attempts must be at least 1"));
        }
        if self.multiplier < 1.0 {
            return Err(CoreError::configuration("multiplier must be >= 1.0"));
        }
        if self.base_delay > self.max_delay {
            return Err(CoreError::configuration(
                "base_delay cannot exceed max_delay",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CoreError::configuration("jitter must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(CoreError::configuration(
                "circuit breaker thresholds must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_bytes == 0 {
            return Err(CoreError::configuration(
                "memory_limit_bytes must be greater than 0",
            ));
        }
        if self.warning_threshold >= self.critical_threshold {
            return Err(CoreError::configuration(
                "warning_threshold must be less than critical_threshold",
            ));
        }
        for t in [
            self.warning_threshold,
            self.critical_threshold,
            self.gc_trigger_threshold,
        ] {
            if !(0.0..=1.0).contains(&t) {
                return Err(CoreError::configuration(
                    "memory thresholds must be between 0.0 and 1.0",
                ));
            }
        }
        Ok(())
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(CoreError::configuration("max_in_flight must be greater than 0"));
        }
        if self.event_capacity == 0 {
            return Err(CoreError::configuration("event_capacity must be greater than 0"));
        }
        Ok(())
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.pool.validate()?;
        self.cache.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.memory.validate()?;
        self.runtime.validate()
    }

    /// Parse a YAML document; omitted fields keep their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CoreConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| CoreError::Io {
            operation: format!("read config {}", path.as_ref().display()),
            source: e,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Small pools and short waits for local development and tests
    pub fn development() -> Self {
        Self {
            queue: QueueConfig {
                capacity: 100,
                default_task_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            pool: PoolConfig {
                max_db_connections: 5,
                connection_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            retry: RetryConfig {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                timeout: Duration::from_secs(10),
                ..Default::default()
            },
            memory: MemoryConfig {
                check_interval: Duration::from_secs(5),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            queue: QueueConfig {
                capacity: 100_000,
                ..Default::default()
            },
            pool: PoolConfig {
                max_db_connections: 50,
                max_idle_per_host: 32,
                ..Default::default()
            },
            cache: CacheConfig {
                max_entries: 50_000,
                max_size_bytes: 512 * 1024 * 1024, // 512MB
                ..Default::default()
            },
            memory: MemoryConfig {
                memory_limit_bytes: 4 * 1024 * 1024 * 1024, // 4GB
                ..Default::default()
            },
            runtime: RuntimeConfig {
                max_in_flight: 128,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Builder for CoreConfig
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl Default for CoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue.capacity = capacity;
        self
    }

    pub fn default_max_retries(mut self, retries: u32) -> Self {
        self.config.queue.default_max_retries = retries;
        self
    }

    pub fn max_db_connections(mut self, max: usize) -> Self {
        self.config.pool.max_db_connections = max;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.connection_timeout = timeout;
        self
    }

    pub fn cache_limits(mut self, max_entries: usize, max_size_bytes: usize) -> Self {
        self.config.cache.max_entries = max_entries;
        self.config.cache.max_size_bytes = max_size_bytes;
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.config.cache.eviction_policy = policy;
        self
    }

    pub fn retry_backoff(mut self, base: Duration, max: Duration, multiplier: f64) -> Self {
        self.config.retry.base_delay = base;
        self.config.retry.max_delay = max;
        self.config.retry.multiplier = multiplier;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn circuit_breaker(mut self, failures: u32, successes: u32, timeout: Duration) -> Self {
        self.config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            timeout,
        };
        self
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.memory.memory_limit_bytes = bytes;
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.config.runtime.max_in_flight = max;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
