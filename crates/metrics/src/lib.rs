//! Benchmark metrics recording, race bookkeeping and results aggregation.
//!
//! This crate provides the [`MetricsStore`] trait through which a benchmark
//! run records its observations, the in-process [`LocalMetricsStore`], the
//! race model with its stores, and the aggregation that turns recorded
//! metrics into [`GlobalStats`]. The network-backed stores live in
//! `benchmark-metrics-remote`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Benchmark execution (external)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     MetricsStore trait                      │
//! │     open · put_value_* · put_doc · flush · close · get_*    │
//! ├──────────────────────┬──────────────────────────────────────┤
//! │  LocalMetricsStore   │   RemoteMetricsStore                 │
//! │  (in-process)        │   (benchmark-metrics-remote)         │
//! ├──────────────────────┴──────────────────────────────────────┤
//! │        GlobalStatsCalculator · SystemStatsCalculator        │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Race ──► RaceStore (File │ Composite │ Remote)            │
//! │        └─► ResultsStore (Noop │ Remote)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use benchmark_metrics::{
//!     Challenge, LocalMetricsStore, MetricsStore, OpenContext, Sample, Track, calculate_results,
//! };
//!
//! let mut store = LocalMetricsStore::default();
//! store.open(OpenContext::builder().race_id("r1").race_timestamp(chrono::Utc::now()).build(), true)?;
//! store.put_value_cluster_level(Sample::builder().name("indexing_total_time").value(120.0).unit("ms").build())?;
//! store.close()?;
//!
//! let results = calculate_results(&store, &Track::new("geonames"), &Challenge::new("append"))?;
//! assert_eq!(results.total_time, Some(120.0));
//! # Ok::<(), benchmark_metrics::StoreError>(())
//! ```
//!
//! # Error Handling
//!
//! All operations return [`StoreResult<T>`]. Remote failures reach callers
//! only after the retry budget of the remote client is exhausted.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (manual clock, record and race factories,
//!   in-memory race store, assertion macros) and the `conformance` suite for [`MetricsStore`]
//!   implementations.
//! - **`failpoints`**: Enables `fail` failpoints inside the stores.

#![deny(unsafe_code)]

pub mod calculator;
pub mod clock;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod file_race_store;
pub mod local;
pub mod meta;
pub mod percentile;
pub mod race;
pub mod race_store;
pub mod results;
pub mod schedule;
pub mod stats;
pub mod store;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use calculator::{
    GlobalStatsCalculator, SystemStatsCalculator, calculate_results, calculate_system_results,
};
pub use clock::{Clock, StopWatch, SystemClock};
pub use config::StoreSettings;
pub use error::{BoxError, BulkItemFailure, ConfigError, Endpoint, StoreError, StoreResult};
pub use file_race_store::FileRaceStore;
pub use local::LocalMetricsStore;
pub use meta::MetaInfo;
pub use race::Race;
pub use race_store::{
    Annotation, AnnotationListing, CompositeRaceStore, DeleteOutcome, Deletion, RaceListing,
    RaceStore,
};
pub use results::{NoopResultsStore, ResultsStore};
pub use schedule::{Challenge, Operation, Task, Track};
pub use stats::{GlobalStats, LatencyStats, OpMetrics, SummaryStats, SystemStats};
pub use store::{Document, MetricsStore, Sample, StoreCore};
pub use types::{
    Meta, MetaScope, MetricRecord, MetricValue, OpenContext, Percentiles, Query, SampleType,
    SortField, SortKey, Stats,
};
