//! Raw failures reported by a datastore transport.
//!
//! A [`TransportError`] describes what went wrong on the wire, without any
//! decision about whether the call should be repeated. The
//! [`ResilientClient`](crate::ResilientClient) classifies these errors and
//! is the only place that turns them into a
//! [`StoreError`](benchmark_metrics::StoreError).

use benchmark_metrics::BulkItemFailure;
use thiserror::Error;

/// Result type alias for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure of a single transport call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The request did not complete in time.
    #[error("request timed out: {message}")]
    Timeout {
        /// Description reported by the HTTP client.
        message: String,
    },

    /// The datastore could not be reached.
    #[error("connection failed: {message}")]
    Connection {
        /// Description reported by the HTTP client.
        message: String,
    },

    /// The datastore rejected the credentials (HTTP 401).
    #[error("authentication failed")]
    Authentication,

    /// The user lacks privileges for the request (HTTP 403).
    #[error("authorization failed")]
    Authorization,

    /// Some items of a bulk request failed.
    #[error("{} bulk item(s) failed", .items.len())]
    Bulk {
        /// Every failed item, in request order.
        items: Vec<BulkItemFailure>,
    },

    /// The datastore answered with an error status.
    #[error("status [{status}]: {reason}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error type or body excerpt reported by the datastore.
        reason: String,
    },

    /// Any other failure, e.g. an undecodable response.
    #[error("{message}")]
    Other {
        /// Description of the failure.
        message: String,
    },
}

impl TransportError {
    /// Maps an HTTP error status to the matching variant.
    #[must_use]
    pub fn from_status(status: u16, reason: impl Into<String>) -> Self {
        match status {
            401 => Self::Authentication,
            403 => Self::Authorization,
            _ => Self::Api { status, reason: reason.into() },
        }
    }

    /// Creates a new `Other` error.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_maps_credentials() {
        assert_eq!(TransportError::from_status(401, "x"), TransportError::Authentication);
        assert_eq!(TransportError::from_status(403, "x"), TransportError::Authorization);
        assert_eq!(
            TransportError::from_status(503, "unavailable"),
            TransportError::Api { status: 503, reason: "unavailable".into() }
        );
    }

    #[test]
    fn test_bulk_display_counts_items() {
        let err = TransportError::Bulk {
            items: vec![
                BulkItemFailure { status: 429, error_type: "rejected".into(), reason: None },
                BulkItemFailure { status: 400, error_type: "mapper".into(), reason: None },
            ],
        };
        assert_eq!(err.to_string(), "2 bulk item(s) failed");
    }
}
