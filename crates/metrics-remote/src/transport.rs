//! The datastore transport abstraction.
//!
//! [`Transport`] is the narrow set of datastore calls the remote stores
//! issue. Each method performs exactly one request and reports failures as
//! [`TransportError`]; retries happen one level up, in the
//! [`ResilientClient`](crate::ResilientClient).
//!
//! Implementations:
//! - [`HttpTransport`](crate::HttpTransport) talks to a datastore over HTTP
//! - `FakeDatastore` (behind the `testutil` feature) answers in-process

use std::fmt;

use benchmark_metrics::{Endpoint, Meta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportResult;

/// Answer to a search request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub hits: Hits,
    #[serde(default)]
    pub aggregations: Meta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hits {
    #[serde(default)]
    pub total: TotalHits,
    #[serde(default)]
    pub hits: Vec<Hit>,
}

/// Number of matching documents, which may exceed the returned hits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalHits {
    pub value: u64,
}

/// One returned document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: Meta,
}

impl SearchResponse {
    /// Total number of matching documents.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.hits.total.value
    }

    /// A named aggregation result, if present.
    #[must_use]
    pub fn aggregation(&self, name: &str) -> Option<&Value> {
        self.aggregations.get(name)
    }
}

/// Single-request access to a datastore.
///
/// Index names may contain a trailing `*` wildcard where a method searches
/// or deletes across time buckets.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Host and port, for error messages.
    fn endpoint(&self) -> Endpoint;

    /// Body of the composable index template, or `None` if it does not exist.
    fn get_template(&self, name: &str) -> TransportResult<Option<Value>>;

    /// Creates or replaces an index template.
    fn put_template(&self, name: &str, template: &Value) -> TransportResult<()>;

    fn index_exists(&self, index: &str) -> TransportResult<bool>;

    /// Creates an index. An index that already exists is not an error.
    fn create_index(&self, index: &str) -> TransportResult<()>;

    /// Makes all writes to the index visible to searches.
    fn refresh(&self, index: &str) -> TransportResult<()>;

    /// Writes documents in one bulk request. Item failures are reported as
    /// [`TransportError::Bulk`](crate::TransportError::Bulk).
    fn bulk_index(&self, index: &str, docs: &[Value]) -> TransportResult<()>;

    /// Writes one document, replacing any document with the same id.
    fn index_doc(&self, index: &str, id: Option<&str>, doc: &Value) -> TransportResult<()>;

    fn search(&self, index: &str, body: &Value) -> TransportResult<SearchResponse>;

    /// Deletes every matching document and returns how many were deleted.
    fn delete_by_query(&self, index: &str, body: &Value) -> TransportResult<u64>;

    /// Deletes one document; `false` when it did not exist.
    fn delete(&self, index: &str, id: &str) -> TransportResult<bool>;
}
