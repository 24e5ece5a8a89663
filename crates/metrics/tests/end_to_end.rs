//! A full run against the local store: record, close, aggregate, persist.

#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use benchmark_metrics::{
    Challenge, FileRaceStore, LocalMetricsStore, MetricsStore, Operation, Query, Race,
    RaceListing, RaceStore, Sample, SampleType, Stats, StoreSettings, Task, Track,
    calculate_results,
    testutil::{ManualClock, open_context, service_time},
};
use chrono::{TimeZone, Utc};

fn challenge() -> Challenge {
    let mut challenge = Challenge::new("append-no-conflicts");
    challenge.schedule = vec![
        vec![Task::new("index-append", Operation::new("index-append", "bulk"))],
        vec![Task::new("warmup-wait", Operation::new("wait", "sleep").hidden())],
    ];
    challenge
}

#[test]
fn service_time_error_rate_and_stats() {
    let mut store =
        LocalMetricsStore::new(StoreSettings::default(), Arc::new(ManualClock::default()));
    store.open(open_context("e2e"), true).unwrap();
    store.put_value_cluster_level(service_time("index-append", 100.0, true)).unwrap();
    store.put_value_cluster_level(service_time("index-append", 200.0, false)).unwrap();
    store.put_value_cluster_level(service_time("index-append", 300.0, true)).unwrap();
    store.close().unwrap();

    let rate = store.get_error_rate("index-append", None, Some(SampleType::Normal)).unwrap();
    assert!((rate - 1.0 / 3.0).abs() < 1e-12, "{rate}");
    let stats = store.get_stats(&Query::metric("service_time")).unwrap().unwrap();
    assert_eq!(stats, Stats { count: 3, min: 100.0, max: 300.0, avg: 200.0, sum: 600.0 });
}

#[test]
fn results_are_aggregated_and_persisted() {
    let clock = Arc::new(ManualClock::default());
    let mut store = LocalMetricsStore::new(StoreSettings::default(), clock.clone());
    store.open(open_context("e2e"), true).unwrap();

    for (i, v) in [1000.0, 1200.0, 1100.0].into_iter().enumerate() {
        clock.advance(Duration::from_secs(1));
        let sample_type = if i == 0 { SampleType::Warmup } else { SampleType::Normal };
        store
            .put_value_cluster_level(
                Sample::builder()
                    .name("throughput")
                    .value(v)
                    .unit("docs/s")
                    .task("index-append")
                    .operation_type("bulk")
                    .sample_type(sample_type)
                    .build(),
            )
            .unwrap();
        store.put_value_cluster_level(service_time("index-append", 10.0 * (i + 1) as f64, true)).unwrap();
    }
    store.close().unwrap();

    let track = Track::new("geonames");
    let challenge = challenge();
    let results = calculate_results(&store, &track, &challenge).unwrap();

    assert_eq!(results.tasks(), vec!["index-append"]);
    let metrics = results.metrics("index-append").unwrap();
    assert_eq!(metrics.throughput.min, Some(1100.0));
    assert_eq!(metrics.throughput.max, Some(1200.0));
    assert_eq!(metrics.throughput.unit.as_deref(), Some("docs/s"));
    assert_eq!(metrics.error_rate, 0.0);
    assert_eq!(metrics.duration, Some(3000));
    // three samples report the 50th and 100th percentile
    assert_eq!(metrics.service_time.percentile(50.0), Some(20.0));
    assert_eq!(metrics.service_time.percentile(100.0), Some(30.0));
    assert!(metrics.latency.is_empty());

    let mut race = Race::create(&track, &challenge)
        .rally_version("2.11.0")
        .environment("local")
        .race_id("e2e")
        .race_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        .build();
    race.add_results(results).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let races = FileRaceStore::at(dir.path());
    races.store_race(&race).unwrap();
    let restored = races.find_by_race_id("e2e").unwrap();
    assert_eq!(restored.results, race.results);
    assert_eq!(races.list(&RaceListing::default()).unwrap().len(), 1);
    assert!(!race.to_result_documents().is_empty());
}
