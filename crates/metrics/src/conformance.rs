//! Conformance test suite for [`MetricsStore`] implementations.
//!
//! Every function takes a fresh, unopened store and checks one aspect of
//! the trait contract. Backends run the whole suite from their integration
//! tests so local and remote stores answer queries identically.
//!
//! # Usage
//!
//! ```no_run
//! use benchmark_metrics::{LocalMetricsStore, conformance};
//!
//! #[test]
//! fn stats_match_recorded_values() {
//!     conformance::stats_match_recorded_values(&mut LocalMetricsStore::default());
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | Lifecycle | reads and writes before `open`, writes after `close`, reads after `close`, reopening |
//! | Queries | filter combinations, `get_one` ordering, units |
//! | Aggregations | stats, percentiles, error rate |
//! | Meta | snapshot semantics of scope meta |

use serde_json::json;

use crate::{
    assert_store_error,
    error::StoreError,
    store::{MetricsStore, SERVICE_TIME, Sample},
    testutil::{open_context, service_time},
    types::{MetaScope, Query, SampleType, SortField, SortKey},
};

const RACE_ID: &str = "conformance-race";

fn open<S: MetricsStore>(store: &mut S) {
    store.open(open_context(RACE_ID), true).expect("open should succeed");
}

fn put<S: MetricsStore>(store: &mut S, sample: Sample) {
    store.put_value_cluster_level(sample).expect("put_value should succeed");
}

fn value(name: &str, v: f64) -> Sample {
    Sample::builder().name(name).value(v).unit("ms").build()
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Reads on a store that was never opened fail with `NotOpen`.
pub fn reads_before_open_fail<S: MetricsStore>(store: &mut S) {
    assert_store_error!(store.get_stats(&Query::metric("latency")), StoreError::NotOpen { .. });
    assert_store_error!(store.get_raw(&Query::metric("latency")), StoreError::NotOpen { .. });
    assert_store_error!(store.get_error_rate("task", None, None), StoreError::NotOpen { .. });
}

/// Writes on a store that was never opened fail with `NotOpen`.
pub fn writes_before_open_fail<S: MetricsStore>(store: &mut S) {
    let result = store.put_value_cluster_level(value("latency", 1.0));
    assert_store_error!(result, StoreError::NotOpen { .. });
    assert_store_error!(store.close(), StoreError::NotOpen { .. });
}

/// After `close`, writes fail and previously flushed records stay readable.
pub fn close_keeps_records_readable<S: MetricsStore>(store: &mut S) {
    open(store);
    put(store, value("latency", 4.0));
    store.close().expect("close should succeed");

    let result = store.put_value_cluster_level(value("latency", 5.0));
    assert_store_error!(result, StoreError::NotOpen { .. });
    let stats = store.get_stats(&Query::metric("latency")).expect("get_stats").expect("one record");
    assert_eq!(stats.count, 1);
    assert_eq!(store.open_context().map(|c| c.race_id.as_str()), Some(RACE_ID));
}

/// Reopening for another race hides the records of the previous one.
pub fn reopen_reads_only_the_new_race<S: MetricsStore>(store: &mut S) {
    open(store);
    put(store, service_time("bulk", 100.0, true));
    store.close().expect("close should succeed");

    store.open(open_context("conformance-next"), true).expect("reopen should succeed");
    put(store, service_time("bulk", 500.0, false));
    store.flush(true).expect("flush");

    let stats = store.get_stats(&Query::metric(SERVICE_TIME)).expect("get_stats").expect("one record");
    assert_eq!(stats.count, 1);
    assert_eq!(stats.min, 500.0);
    assert_eq!(store.get_error_rate("bulk", None, None).expect("get_error_rate"), 1.0);
    let records = store.get_raw(&Query::metric(SERVICE_TIME)).expect("get_raw");
    assert!(records.iter().all(|r| r.race_id == "conformance-next"), "{records:?}");
}

// ============================================================================
// Queries
// ============================================================================

/// `get` returns the values of matching records in insertion order.
pub fn get_returns_values_in_order<S: MetricsStore>(store: &mut S) {
    open(store);
    for v in [3.0, 1.0, 2.0] {
        put(store, value("latency", v));
    }
    put(store, value("other", 9.0));
    store.flush(true).expect("flush");

    let values: Vec<f64> = store
        .get(&Query::metric("latency"))
        .expect("get")
        .iter()
        .filter_map(|v| v.as_f64())
        .collect();
    assert_eq!(values, vec![3.0, 1.0, 2.0]);
    assert!(store.get(&Query::metric("missing")).expect("get").is_empty());
}

/// Task, operation type, sample type and node filters are ANDed.
pub fn filters_combine<S: MetricsStore>(store: &mut S) {
    open(store);
    store
        .add_meta_info(MetaScope::Node, Some("node-0"), "node_name", json!("node-0"))
        .expect("add_meta_info");
    let sample = |task: &str, op_type: &str, sample_type: SampleType, v: f64| {
        Sample::builder()
            .name("latency")
            .value(v)
            .task(task)
            .operation_type(op_type)
            .sample_type(sample_type)
            .build()
    };
    put(store, sample("index", "bulk", SampleType::Warmup, 1.0));
    put(store, sample("index", "bulk", SampleType::Normal, 2.0));
    put(store, sample("query", "search", SampleType::Normal, 3.0));
    store
        .put_value_node_level("node-0", sample("index", "bulk", SampleType::Normal, 4.0))
        .expect("put_value_node_level");
    store.flush(true).expect("flush");

    let count = |query: Query| store.get_raw(&query).expect("get_raw").len();
    assert_eq!(count(Query::metric("latency")), 4);
    assert_eq!(count(Query::metric("latency").task("index")), 3);
    assert_eq!(count(Query::metric("latency").task("index").sample_type(SampleType::Normal)), 2);
    assert_eq!(count(Query::metric("latency").operation_type("search")), 1);
    assert_eq!(count(Query::metric("latency").node("node-0")), 1);
    assert_eq!(count(Query::metric("latency").task("query").operation_type("bulk")), 0);
}

/// `get_one` honours the requested sort order.
pub fn get_one_respects_sort<S: MetricsStore>(store: &mut S) {
    open(store);
    for (ms, v) in [(200, 2.0), (300, 3.0), (100, 1.0)] {
        put(
            store,
            Sample::builder()
                .name(SERVICE_TIME)
                .value(v)
                .task("bulk")
                .relative_time(std::time::Duration::from_millis(ms))
                .build(),
        );
    }
    store.flush(true).expect("flush");

    let query = Query::metric(SERVICE_TIME).task("bulk");
    let last = store
        .get_one(&query, Some(SortKey::descending(SortField::RelativeTime)))
        .expect("get_one")
        .expect("a record");
    assert_eq!(last.relative_time, 300);
    let first = store
        .get_one(&query, Some(SortKey::ascending(SortField::RelativeTime)))
        .expect("get_one")
        .expect("a record");
    assert_eq!(first.relative_time, 100);
    assert!(store.get_one(&Query::metric("missing"), None).expect("get_one").is_none());
}

/// The unit lookup ignores the sample type filter.
pub fn unit_ignores_sample_type<S: MetricsStore>(store: &mut S) {
    open(store);
    put(
        store,
        Sample::builder().name("throughput").value(10.0).unit("docs/s").sample_type(SampleType::Warmup).build(),
    );
    store.flush(true).expect("flush");
    let unit = store
        .get_unit(&Query::metric("throughput").sample_type(SampleType::Normal))
        .expect("get_unit");
    assert_eq!(unit.as_deref(), Some("docs/s"));
}

// ============================================================================
// Aggregations
// ============================================================================

/// Stats, mean and median match the recorded values.
pub fn stats_match_recorded_values<S: MetricsStore>(store: &mut S) {
    open(store);
    for v in [100.0, 300.0, 200.0] {
        put(store, value("latency", v));
    }
    store.flush(true).expect("flush");

    let query = Query::metric("latency");
    let stats = store.get_stats(&query).expect("get_stats").expect("stats");
    assert_eq!(stats.count, 3);
    assert_eq!(stats.min, 100.0);
    assert_eq!(stats.max, 300.0);
    assert!((stats.avg - 200.0).abs() < 1e-9);
    assert!((stats.sum - 600.0).abs() < 1e-9);
    assert_eq!(store.get_median(&query).expect("get_median"), Some(200.0));
    assert!(store.get_stats(&Query::metric("missing")).expect("get_stats").is_none());
}

/// Percentiles are sorted by percentile and bounded by min and max.
pub fn percentiles_are_ordered<S: MetricsStore>(store: &mut S) {
    open(store);
    for i in 1..=100 {
        put(store, value("latency", f64::from(i)));
    }
    store.flush(true).expect("flush");

    let percentiles = store
        .get_percentiles(&Query::metric("latency"), Some(&[99.0, 50.0, 100.0]))
        .expect("get_percentiles")
        .expect("percentiles");
    let keys: Vec<f64> = percentiles.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![50.0, 99.0, 100.0]);
    let values: Vec<f64> = percentiles.iter().map(|(_, v)| v).collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "{values:?}");
    assert!(values.iter().all(|v| (1.0..=100.0).contains(v)), "{values:?}");
    assert_eq!(percentiles.get(100.0), Some(100.0));
    assert!(store.get_percentiles(&Query::metric("missing"), None).expect("get_percentiles").is_none());
}

/// The error rate is the share of failed `service_time` records.
pub fn error_rate_counts_failures<S: MetricsStore>(store: &mut S) {
    open(store);
    put(store, service_time("bulk", 100.0, true));
    put(store, service_time("bulk", 200.0, false));
    put(store, service_time("bulk", 300.0, true));
    put(store, service_time("search", 5.0, false));
    store.flush(true).expect("flush");

    let rate = store.get_error_rate("bulk", None, Some(SampleType::Normal)).expect("get_error_rate");
    assert!((rate - 1.0 / 3.0).abs() < 1e-9, "{rate}");
    assert_eq!(store.get_error_rate("search", None, None).expect("get_error_rate"), 1.0);
    assert_eq!(store.get_error_rate("missing", None, None).expect("get_error_rate"), 0.0);
}

// ============================================================================
// Meta
// ============================================================================

/// Meta added after a write does not show up on earlier records.
pub fn meta_is_snapshotted<S: MetricsStore>(store: &mut S) {
    open(store);
    put(store, value("cpu", 1.0));
    store.add_meta_info(MetaScope::Cluster, None, "late", json!("yes")).expect("add_meta_info");
    put(store, value("cpu", 2.0));
    store.flush(true).expect("flush");

    let records = store.get_raw(&Query::metric("cpu")).expect("get_raw");
    assert_eq!(records.len(), 2);
    let late: Vec<bool> = records.iter().map(|r| r.meta_value("late").is_some()).collect();
    assert_eq!(late, vec![false, true]);
}
