// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the observability core.
// Designed for:
// - Clear error categorization
// - Easy error propagation with context
// - Recovery strategy hints
// ============================================================================

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// 1 Core Errors
// ----------------------------------------------------------------------------

/// The main error type of the crate.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ObserveError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl ObserveError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ObserveError::Config(_) => false,
            ObserveError::Chunk(e) => e.is_recoverable(),
            ObserveError::Cache(_) => true,
            ObserveError::Storage(e) => e.is_recoverable(),
            ObserveError::Collector(e) => e.is_recoverable(),
            ObserveError::Network(e) => e.is_recoverable(),
            ObserveError::Notification(_) => true,
            ObserveError::Io(_) => true,
            ObserveError::NotFound(_) => false,
            ObserveError::Internal(_) => false,
            ObserveError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ObserveError::Config(_) => "config",
            ObserveError::Chunk(_) => "chunk",
            ObserveError::Cache(_) => "cache",
            ObserveError::Storage(_) => "storage",
            ObserveError::Collector(_) => "collector",
            ObserveError::Network(_) => "network",
            ObserveError::Notification(_) => "notification",
            ObserveError::Io(_) => "io",
            ObserveError::NotFound(_) => "not_found",
            ObserveError::Internal(_) => "internal",
            ObserveError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ObserveError::Config(_) => RecoveryHint::FixConfiguration,
            ObserveError::Chunk(e) => e.recovery_hint(),
            ObserveError::Collector(e) => e.recovery_hint(),
            ObserveError::Network(e) => e.recovery_hint(),
            ObserveError::NotFound(_) => RecoveryHint::Skip,
            ObserveError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }

    /// True for lookups of unknown projects, api keys or queries.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ObserveError::NotFound(_)
                | ObserveError::Cache(CacheError::ProjectNotFound { .. })
                | ObserveError::Cache(CacheError::QueryNotFound { .. })
                | ObserveError::Collector(CollectorError::UnknownApiKey)
        )
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the service
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String, source: Option<Box<dyn StdError + Send + Sync>> },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField { field: field.into() }
    }
}

// ----------------------------------------------------------------------------
// 3 Chunk Errors
// ----------------------------------------------------------------------------

/// Errors of the on-disk chunk codec
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("unsupported chunk version: {0}")]
    UnsupportedVersion(u8),

    #[error("chunk is corrupted: {message}")]
    Corruption { message: String },

    #[error("invalid labels: {message}")]
    InvalidLabels { message: String },

    /// Invariant violation inside the writer; the batch must be aborted.
    #[error("{message}")]
    Programming { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChunkError {
    pub fn corruption(message: impl Into<String>) -> Self {
        ChunkError::Corruption { message: message.into() }
    }

    pub fn invalid_labels(message: impl Into<String>) -> Self {
        ChunkError::InvalidLabels { message: message.into() }
    }

    /// Corrupted or unreadable chunks are skipped, never retried.
    pub fn is_corruption(&self) -> bool {
        match self {
            ChunkError::Corruption { .. } | ChunkError::UnsupportedVersion(_) => true,
            ChunkError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChunkError::Io(_)) && !self.is_corruption()
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        if self.is_corruption() {
            RecoveryHint::AlertOperator
        } else if matches!(self, ChunkError::Programming { .. } | ChunkError::InvalidLabels { .. }) {
            RecoveryHint::Skip
        } else {
            RecoveryHint::RetryWithBackoff
        }
    }
}

// ----------------------------------------------------------------------------
// 4 Cache Errors
// ----------------------------------------------------------------------------

/// Errors of the metric cache and its query reader
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("unknown project: {project_id}")]
    ProjectNotFound { project_id: String },

    #[error("unknown query: {query}")]
    QueryNotFound { query: String },

    #[error("metric source is not configured for project {project_id}")]
    NoMetricSource { project_id: String },

    #[error("query '{query}' failed: {message}")]
    QueryFailed { query: String, message: String },
}

// ----------------------------------------------------------------------------
// 5 Storage Errors
// ----------------------------------------------------------------------------

/// Errors from the embedded state database
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Data corruption detected: {message}")]
    DataCorruption { message: String },
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::Sqlite(_))
    }
}

// ----------------------------------------------------------------------------
// 6 Collector Errors
// ----------------------------------------------------------------------------

/// Errors from the OTLP ingestion pipeline
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("unknown api key")]
    UnknownApiKey,

    #[error("clickhouse tables not ready for project {project_id}")]
    TablesNotReady { project_id: String },

    #[error("failed to decode payload: {message}")]
    Decode { message: String },

    #[error("unsupported content encoding: {encoding}")]
    UnsupportedEncoding { encoding: String },

    #[error("clickhouse error: {message}")]
    ClickHouse { message: String },

    #[error("migration failed: {message}")]
    MigrationFailed { message: String },
}

impl CollectorError {
    pub fn decode(message: impl Into<String>) -> Self {
        CollectorError::Decode { message: message.into() }
    }

    pub fn clickhouse(message: impl Into<String>) -> Self {
        CollectorError::ClickHouse { message: message.into() }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CollectorError::TablesNotReady { .. }
                | CollectorError::ClickHouse { .. }
                | CollectorError::MigrationFailed { .. }
        )
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            CollectorError::UnknownApiKey => RecoveryHint::FixConfiguration,
            CollectorError::Decode { .. } | CollectorError::UnsupportedEncoding { .. } => RecoveryHint::Skip,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

// ----------------------------------------------------------------------------
// 7 Network Errors
// ----------------------------------------------------------------------------

/// Errors talking to upstream and downstream services over HTTP
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request to '{endpoint}' timed out after {timeout_secs}s")]
    Timeout { endpoint: String, timeout_secs: u64 },

    #[error("'{endpoint}' responded with status {status}: {body}")]
    Status { endpoint: String, status: u16, body: String },

    #[error("invalid url '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("server on {addr} failed: {message}")]
    Serve { addr: String, message: String },
}

impl NetworkError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            NetworkError::Request(_) | NetworkError::Timeout { .. } => true,
            NetworkError::Status { status, .. } => *status >= 500 || *status == 429,
            NetworkError::InvalidUrl { .. } | NetworkError::Serve { .. } => false,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            NetworkError::Request(_) => RecoveryHint::Reconnect,
            NetworkError::InvalidUrl { .. } | NetworkError::Serve { .. } => RecoveryHint::FixConfiguration,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

// ----------------------------------------------------------------------------
// 8 Notification Errors
// ----------------------------------------------------------------------------

/// Errors delivering notifications to an integration
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("{integration}: {message}")]
    Integration { integration: String, message: String },

    #[error("template error: {message}")]
    Template { message: String },

    #[error("{integration} integration is not configured")]
    NotConfigured { integration: String },
}

impl NotificationError {
    pub fn integration(integration: impl Into<String>, message: impl Into<String>) -> Self {
        NotificationError::Integration {
            integration: integration.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 9 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for crate operations
pub type ObserveResult<T> = Result<T, ObserveError>;

/// Result type for chunk codec operations
pub type ChunkResult<T> = Result<T, ChunkError>;

/// Result type for state database operations
pub type StorageResult<T> = Result<T, StorageError>;

// ----------------------------------------------------------------------------
// 10 Error Context Extension
// ----------------------------------------------------------------------------

/// Extension trait to add context to errors
pub trait ErrorContext<T, E> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T, ObserveError>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F, C>(self, f: F) -> Result<T, ObserveError>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    E: Into<ObserveError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, ObserveError> {
        self.map_err(|e| {
            let err: ObserveError = e.into();
            ObserveError::Internal(format!("{}: {}", context.into(), err))
        })
    }

    fn with_context<F, C>(self, f: F) -> Result<T, ObserveError>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| {
            let err: ObserveError = e.into();
            ObserveError::Internal(format!("{}: {}", f().into(), err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err: ObserveError = ConfigError::invalid_value("cache.ttl", "must be positive").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration value for 'cache.ttl': must be positive"
        );
    }

    #[test]
    fn test_chunk_corruption_is_not_retried() {
        let err = ChunkError::corruption("keyIdx out of range");
        assert!(err.is_corruption());
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::AlertOperator);
        assert!(ChunkError::UnsupportedVersion(9).is_corruption());
    }

    #[test]
    fn test_not_found_detection() {
        let err: ObserveError = CacheError::QueryNotFound { query: "up".into() }.into();
        assert!(err.is_not_found());
        let err: ObserveError = CollectorError::UnknownApiKey.into();
        assert!(err.is_not_found());
        let err: ObserveError = CollectorError::TablesNotReady { project_id: "p1".into() }.into();
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "Collector error: clickhouse tables not ready for project p1");
    }

    #[test]
    fn test_error_context() {
        let res: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        let err = res.context("writing chunk").unwrap_err();
        assert_eq!(err.to_string(), "Internal error: writing chunk: IO error: disk full");
    }
}
