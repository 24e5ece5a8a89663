//! Store error types and result alias.
//!
//! Every backend maps its internal failures to [`StoreError`]. The variants
//! follow the failure taxonomy of the metrics subsystem:
//!
//! - [`StoreError::NotOpen`] - programming error, a store was used before `open`
//! - [`StoreError::Config`] - invalid settings detected at setup time
//! - [`StoreError::NotFound`] - a race or annotation id does not exist
//! - [`StoreError::Consistency`] - a supposedly unique record is duplicated
//! - [`StoreError::Unreachable`] - transient failures persisted past the retry budget
//! - [`StoreError::Authentication`] / [`StoreError::Authorization`] - credential problems
//! - [`StoreError::BulkRejected`] / [`StoreError::BulkExhausted`] - bulk write failures
//! - [`StoreError::Api`] / [`StoreError::Transport`] - other remote failures
//!
//! None of these are retried by callers: the remote client has already
//! exhausted its retry budget before it produces one.
//!
//! # Example
//!
//! ```
//! use benchmark_metrics::{StoreError, StoreResult};
//!
//! fn lookup(race_id: &str) -> StoreResult<()> {
//!     Err(StoreError::not_found("race", race_id))
//! }
//!
//! assert!(lookup("abc").unwrap_err().is_not_found());
//! ```

use std::{fmt, sync::Arc};

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Network location of a remote datastore, used in error messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates a new endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host [{}], port [{}]", self.host, self.port)
    }
}

/// A single failed item of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemFailure {
    /// HTTP-style status code reported for the item.
    pub status: u16,
    /// Error type reported by the datastore, e.g. `mapper_parsing_exception`.
    pub error_type: String,
    /// Human-readable reason, if any.
    pub reason: Option<String>,
}

impl fmt::Display for BulkItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "[{}] {}: {}", self.status, self.error_type, reason),
            None => write!(f, "[{}] {}", self.status, self.error_type),
        }
    }
}

/// Formats a list of bulk failures as `[a, b, c]`.
fn format_failures(errors: &[BulkItemFailure]) -> String {
    let parts: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

/// Configuration errors detected while validating settings.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric setting is below its allowed minimum.
    #[error("The setting: {field} must be >= {min} but was {value}")]
    BelowMinimum {
        /// Name of the offending setting.
        field: &'static str,
        /// Smallest allowed value.
        min: i64,
        /// Value that was supplied.
        value: i64,
    },

    /// Mutually exclusive settings were supplied together.
    #[error("Conflicting settings: {message}")]
    Conflicting {
        /// Description of the conflict.
        message: String,
    },

    /// A setting required by another setting is missing.
    #[error("Missing setting: {field}")]
    Missing {
        /// Name of the missing setting.
        field: &'static str,
    },

    /// An unknown meta info scope was requested.
    #[error("Unknown meta info scope [{scope}]")]
    UnknownScope {
        /// The scope that was requested.
        scope: String,
    },

    /// The configured datastore cannot run the requested operation.
    #[error("[{operation}] is not supported for the {datastore} datastore")]
    Unsupported {
        /// The operation that was requested.
        operation: &'static str,
        /// Kind of datastore that is configured.
        datastore: &'static str,
    },
}

/// Errors that can occur during metrics, race or results store operations.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store was used before `open` (or a write after `close`).
    #[error("Metrics store is not open (attempted [{operation}])")]
    NotOpen {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The requested entity does not exist.
    #[error("No {kind} with id [{id}]")]
    NotFound {
        /// Kind of entity, e.g. `race` or `annotation`.
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Stored data violates a uniqueness or lifecycle invariant.
    #[error("Consistency violation: {message}")]
    Consistency {
        /// Description of the violation.
        message: String,
    },

    /// Transient failures persisted past the retry budget.
    #[error("Could not reach the metrics store ({endpoint}) while running [{operation}] after {attempts} attempts: {message}")]
    Unreachable {
        /// The operation that was attempted.
        operation: String,
        /// The remote endpoint.
        endpoint: Endpoint,
        /// Number of attempts that were made.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// The datastore rejected the supplied credentials.
    #[error("The configured user could not be authenticated against the metrics store ({endpoint}). Please check your credentials.")]
    Authentication {
        /// The remote endpoint.
        endpoint: Endpoint,
    },

    /// The datastore rejected the operation for the authenticated user.
    #[error("The configured user does not have enough privileges to run the operation [{operation}] against the metrics store ({endpoint}).")]
    Authorization {
        /// The operation that was attempted.
        operation: String,
        /// The remote endpoint.
        endpoint: Endpoint,
    },

    /// A bulk write contained at least one item that cannot be retried.
    #[error("Unretryable error encountered when sending metrics to remote metrics store: [{error_type}]")]
    BulkRejected {
        /// Error type of the first non-retryable item.
        error_type: String,
        /// Every failed item of the rejected bulk write.
        errors: Vec<BulkItemFailure>,
    },

    /// A bulk write kept failing with retryable item errors.
    #[error("Failed to send metrics to remote metrics store: {}", format_failures(.errors))]
    BulkExhausted {
        /// Every failed item of the last attempt.
        errors: Vec<BulkItemFailure>,
    },

    /// The datastore answered with an error status.
    #[error("A transport error occurred while running [{operation}] against the metrics store ({endpoint}): status [{status}], {reason}")]
    Api {
        /// The operation that was attempted.
        operation: String,
        /// The remote endpoint.
        endpoint: Endpoint,
        /// Status code returned by the datastore.
        status: u16,
        /// Reason reported by the datastore.
        reason: String,
    },

    /// A non-retryable transport failure.
    #[error("A transport error occurred while running [{operation}] against the metrics store ({endpoint}): {message}")]
    Transport {
        /// The operation that was attempted.
        operation: String,
        /// The remote endpoint.
        endpoint: Endpoint,
        /// Description of the failure.
        message: String,
    },

    /// Data could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Local file system failure.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the I/O error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },
}

impl StoreError {
    /// Creates a new `NotOpen` error for the given operation.
    #[must_use]
    pub fn not_open(operation: &'static str) -> Self {
        Self::NotOpen { operation }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Creates a new `Consistency` error.
    #[must_use]
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency { message: message.into() }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Io` error with a message and source error.
    #[must_use]
    pub fn io_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Io { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` if the error reports a missing race or annotation.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for errors that indicate a setup problem on the
    /// caller's side: configuration or credentials.
    #[must_use]
    pub fn is_setup_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Authentication { .. } | Self::Authorization { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = StoreError::not_found("race", "abc-123");
        assert_eq!(err.to_string(), "No race with id [abc-123]");
        assert!(err.is_not_found());
        assert!(!err.is_setup_error());
    }

    #[test]
    fn test_authentication_names_endpoint() {
        let err = StoreError::Authentication { endpoint: Endpoint::new("metrics.example", 9200) };
        let message = err.to_string();
        assert!(message.contains("metrics.example"), "{message}");
        assert!(message.contains("9200"), "{message}");
        assert!(err.is_setup_error());
    }

    #[test]
    fn test_authorization_names_operation() {
        let err = StoreError::Authorization {
            operation: "bulk_index".into(),
            endpoint: Endpoint::new("localhost", 9200),
        };
        assert!(err.to_string().contains("[bulk_index]"));
    }

    #[test]
    fn test_bulk_exhausted_lists_every_failure() {
        let err = StoreError::BulkExhausted {
            errors: vec![
                BulkItemFailure { status: 429, error_type: "es_rejected".into(), reason: None },
                BulkItemFailure {
                    status: 503,
                    error_type: "unavailable".into(),
                    reason: Some("shard".into()),
                },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("[429] es_rejected"), "{message}");
        assert!(message.contains("[503] unavailable: shard"), "{message}");
    }

    #[test]
    fn test_bulk_rejected_reports_first_type() {
        let err = StoreError::BulkRejected {
            error_type: "mapper_parsing_exception".into(),
            errors: vec![BulkItemFailure {
                status: 400,
                error_type: "mapper_parsing_exception".into(),
                reason: None,
            }],
        };
        assert!(err.to_string().ends_with("[mapper_parsing_exception]"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: StoreError =
            ConfigError::BelowMinimum { field: "number_of_shards", min: 1, value: 0 }.into();
        assert!(err.is_setup_error());
        assert_eq!(err.to_string(), "The setting: number_of_shards must be >= 1 but was 0");
    }

    #[test]
    fn test_serialization_with_source_keeps_chain() {
        let io = std::io::Error::other("broken");
        let err = StoreError::serialization_with_source("decode failed", io);
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "broken");
    }
}
