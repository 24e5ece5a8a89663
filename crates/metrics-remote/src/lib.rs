//! Network-backed stores for benchmark metrics, races and results.
//!
//! This crate implements the store traits of `benchmark-metrics` against a
//! remote search datastore. Every request goes through the
//! [`ResilientClient`], which retries transient failures with exponential
//! backoff and classifies everything else into a fatal
//! [`StoreError`](benchmark_metrics::StoreError).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                StoreFactory (ReportingConfig)               │
//! ├──────────────────┬────────────────────┬─────────────────────┤
//! │RemoteMetricsStore│  RemoteRaceStore   │ RemoteResultsStore  │
//! ├──────────────────┴────────────────────┴─────────────────────┤
//! │        TemplateProvider · reconcile (index templates)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │     ResilientClient: classify · backoff · escalate          │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Transport trait ── HttpTransport │ FakeDatastore (tests)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Configuration
//!
//! Credentials are resolved once, when the [`StoreFactory`] is built.
//! `BENCHMARK_DATASTORE_USER`, `BENCHMARK_DATASTORE_PASSWORD` and
//! `BENCHMARK_DATASTORE_API_KEY` override the configured values.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with `FakeDatastore`, an in-process
//!   transport, and a recording sleeper.
//! - **`failpoints`**: Enables `fail` failpoints in the retry driver and the remote flush.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod factory;
pub mod http;
pub mod race_store;
pub mod remote_store;
pub mod resilient;
pub mod results;
pub mod templates;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transport;

pub use config::{
    Credentials, DatastoreConfig, DatastoreSelection, ReportingConfig, ResolvedDatastore,
    RetryPolicy,
};
pub use error::{TransportError, TransportResult};
pub use factory::{MetricsStoreBackend, RaceStoreBackend, ResultsStoreBackend, StoreFactory};
pub use http::HttpTransport;
pub use race_store::RemoteRaceStore;
pub use remote_store::RemoteMetricsStore;
pub use resilient::{Disposition, ResilientClient, Sleeper, ThreadSleeper, classify};
pub use results::RemoteResultsStore;
pub use templates::{Reconciliation, TemplateKind, TemplateProvider};
pub use transport::{SearchResponse, Transport};
