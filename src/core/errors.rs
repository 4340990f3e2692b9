use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the execution core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Node execution failed inside an executor
    #[error("Execution failed in {component}: {message}")]
    Execution {
        component: String,
        message: String,
        retryable: bool,
        context: HashMap<String, String>,
    },

    /// Resource exhaustion errors
    #[error("Resource exhausted: {resource} (current: {current}, limit: {limit})")]
    ResourceExhausted {
        resource: String,
        current: u64,
        limit: u64,
    },

    /// Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// No database slot freed up within the acquisition window
    #[error("Connection acquisition timed out after {timeout_ms}ms ({resource})")]
    AcquireTimeout { resource: String, timeout_ms: u64 },

    #[error("Connection {connection_id} is not active (unknown or already released)")]
    ConnectionNotActive { connection_id: String },

    #[error("Connection pool is closed")]
    PoolClosed,

    /// Circuit breaker rejected the call without invoking the operation
    #[error("Circuit open for {category} (retry in {retry_after_ms}ms)")]
    CircuitOpen {
        category: String,
        retry_after_ms: u64,
    },

    #[error("Retries exhausted for {operation} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last_error: Box<CoreError>,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Connection reset: {endpoint}")]
    ConnectionReset { endpoint: String },

    #[error("Cycle detected in workflow {workflow_id} at node {node_id}")]
    CyclicGraph {
        workflow_id: String,
        node_id: String,
    },

    #[error("Edge {edge_id} references unknown node {node_id}")]
    UnknownNode { edge_id: String, node_id: String },

    #[error("Compression failed: {operation}")]
    Compression {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Channel error: {channel} - {message}")]
    Channel { channel: String, message: String },
}

impl CoreError {
    /// Create a non-retryable execution error
    pub fn execution<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Execution {
            component: component.into(),
            message: message.into(),
            retryable: false,
            context: HashMap::new(),
        }
    }

    /// Create an execution error that the retry layer may re-attempt
    pub fn transient<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Execution {
            component: component.into(),
            message: message.into(),
            retryable: true,
            context: HashMap::new(),
        }
    }

    /// Add context to an execution error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Execution { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    pub fn resource_exhausted<S: Into<String>>(resource: S, current: u64, limit: u64) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            current,
            limit,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn task_not_found<S: Into<String>>(task_id: S) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn connection_reset<S: Into<String>>(endpoint: S) -> Self {
        Self::ConnectionReset {
            endpoint: endpoint.into(),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Whether the retry layer should spend another attempt on this error.
    ///
    /// Only the timeout / connection-reset class qualifies, plus execution
    /// errors that were explicitly raised as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ConnectionReset { .. } | Self::AcquireTimeout { .. } => {
                true
            }
            Self::Execution { retryable, .. } => *retryable,
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// True for fail-fast rejections from an open circuit
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Execution { .. } => "execution",
            Self::ResourceExhausted { .. } => "resource",
            Self::Validation { .. } => "validation",
            Self::Configuration { .. } => "configuration",
            Self::TaskNotFound { .. } | Self::InvalidTransition { .. } => "task",
            Self::AcquireTimeout { .. } | Self::ConnectionNotActive { .. } | Self::PoolClosed => {
                "pool"
            }
            Self::CircuitOpen { .. } => "circuit",
            Self::RetryExhausted { .. } => "retry",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionReset { .. } => "connection",
            Self::CyclicGraph { .. } | Self::UnknownNode { .. } => "graph",
            Self::Compression { .. } => "compression",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Http(_) => "http",
            Self::Channel { .. } => "channel",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CoreError>() {
            Ok(core) => core,
            Err(other) => Self::execution("anyhow", format!("{:#}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CoreError::execution("http_node", "bad status");
        assert!(matches!(err, CoreError::Execution { .. }));
        assert_eq!(err.category(), "execution");
    }

    #[test]
    fn test_error_context() {
        let err = CoreError::execution("test", "message")
            .with_context("node_id", "n1")
            .with_context("attempt", "2");

        if let CoreError::Execution { context, .. } = err {
            assert_eq!(context.get("node_id"), Some(&"n1".to_string()));
            assert_eq!(context.get("attempt"), Some(&"2".to_string()));
        } else {
            panic!("Expected execution error");
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::timeout("query", Duration::from_millis(50)).is_retryable());
        assert!(CoreError::connection_reset("db:5432").is_retryable());
        assert!(CoreError::transient("node", "flaky").is_retryable());
        assert!(!CoreError::execution("node", "bad input").is_retryable());
        assert!(!CoreError::validation("test").is_retryable());
        let open = CoreError::CircuitOpen {
            category: "http".into(),
            retry_after_ms: 10,
        };
        assert!(!open.is_retryable());
        assert!(open.is_circuit_open());
    }

    #[test]
    fn test_io_kind_classification() {
        let reset: CoreError = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(reset.is_retryable());
        let denied: CoreError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(!denied.is_retryable());
    }
}
