//! Runs the [`MetricsStore`](benchmark_metrics::MetricsStore) conformance
//! suite against [`LocalMetricsStore`].
//!
//! Each test function corresponds to a single conformance check, providing
//! granular pass/fail reporting.

#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::sync::Arc;

use benchmark_metrics::{LocalMetricsStore, StoreSettings, conformance, testutil::ManualClock};

fn store() -> LocalMetricsStore {
    LocalMetricsStore::new(StoreSettings::default(), Arc::new(ManualClock::default()))
}

#[test]
fn reads_before_open_fail() {
    conformance::reads_before_open_fail(&mut store());
}

#[test]
fn writes_before_open_fail() {
    conformance::writes_before_open_fail(&mut store());
}

#[test]
fn close_keeps_records_readable() {
    conformance::close_keeps_records_readable(&mut store());
}

#[test]
fn reopen_reads_only_the_new_race() {
    conformance::reopen_reads_only_the_new_race(&mut store());
}

#[test]
fn get_returns_values_in_order() {
    conformance::get_returns_values_in_order(&mut store());
}

#[test]
fn filters_combine() {
    conformance::filters_combine(&mut store());
}

#[test]
fn get_one_respects_sort() {
    conformance::get_one_respects_sort(&mut store());
}

#[test]
fn unit_ignores_sample_type() {
    conformance::unit_ignores_sample_type(&mut store());
}

#[test]
fn stats_match_recorded_values() {
    conformance::stats_match_recorded_values(&mut store());
}

#[test]
fn percentiles_are_ordered() {
    conformance::percentiles_are_ordered(&mut store());
}

#[test]
fn error_rate_counts_failures() {
    conformance::error_rate_counts_failures(&mut store());
}

#[test]
fn meta_is_snapshotted() {
    conformance::meta_is_snapshotted(&mut store());
}
