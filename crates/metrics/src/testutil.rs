//! Shared test utilities for metrics and race store testing.
//!
//! This module provides a manual clock, record and race factories, an
//! in-memory race store with failure injection, and assertion macros for
//! [`StoreResult`] values. It is feature-gated behind `testutil` to prevent
//! leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! benchmark-metrics = { path = "../metrics", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use benchmark_metrics::testutil::{ManualClock, open_context, service_time};
//! ```

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    clock::Clock,
    config::StoreSettings,
    error::{StoreError, StoreResult},
    local::LocalMetricsStore,
    race::Race,
    race_store::{
        Annotation, AnnotationListing, DeleteOutcome, Deletion, RaceListing, RaceStore,
        dry_run_deletions,
    },
    store::{MetricsStore, SERVICE_TIME, Sample},
    types::{Meta, OpenContext, SampleType},
};

/// A [`Clock`] that only moves when told to.
///
/// Starts at 2024-01-01T00:00:00Z with a monotonic reading of zero.
/// [`advance`](Self::advance) moves both readings forward.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(DateTime<Utc>, Duration)>,
}

impl ManualClock {
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self { state: Mutex::new((now, Duration::ZERO)) }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.0 += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        state.1 += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().0
    }

    fn monotonic(&self) -> Duration {
        self.state.lock().1
    }
}

/// Open context for a race on 2024-01-01 with track `geonames`, challenge
/// `append-no-conflicts` and car `defaults`.
#[must_use]
pub fn open_context(race_id: &str) -> OpenContext {
    OpenContext::builder()
        .race_id(race_id)
        .race_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
        .track("geonames")
        .challenge("append-no-conflicts")
        .car(vec!["defaults".to_owned()])
        .build()
}

/// A normal `service_time` sample of a task in ms, with the `success` meta
/// flag set.
#[must_use]
pub fn service_time(task: &str, value: f64, success: bool) -> Sample {
    let mut meta = Meta::new();
    meta.insert("success".to_owned(), json!(success));
    Sample::builder()
        .name(SERVICE_TIME)
        .value(value)
        .unit("ms")
        .task(task)
        .operation(task)
        .operation_type("bulk")
        .sample_type(SampleType::Normal)
        .meta(meta)
        .build()
}

/// A local store on a [`ManualClock`], already opened for `race_id`.
///
/// # Panics
///
/// Panics if the store cannot be opened.
#[must_use]
pub fn open_local_store(race_id: &str) -> LocalMetricsStore {
    let mut store = LocalMetricsStore::new(StoreSettings::default(), Arc::new(ManualClock::default()));
    store.open(open_context(race_id), true).expect("open local store");
    store
}

/// A race without results on track `geonames`.
#[must_use]
pub fn sample_race(race_id: &str, race_timestamp: DateTime<Utc>) -> Race {
    Race::builder()
        .rally_version("2.11.0")
        .environment("local")
        .race_id(race_id)
        .race_timestamp(race_timestamp)
        .pipeline("benchmark-only")
        .track("geonames")
        .challenge("append-no-conflicts")
        .car(vec!["defaults".to_owned()])
        .distribution_version("8.13.2")
        .build()
}

fn injected_failure() -> StoreError {
    StoreError::Io { message: "injected race store failure".to_owned(), source: None }
}

/// In-memory [`RaceStore`]; `failing()` makes every write fail.
#[derive(Debug, Default)]
pub struct MemoryRaceStore {
    races: Mutex<Vec<Race>>,
    annotations: Mutex<Vec<Annotation>>,
    fail_writes: bool,
}

impl MemoryRaceStore {
    #[must_use]
    pub fn failing() -> Self {
        Self { fail_writes: true, ..Self::default() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.races.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.races.lock().is_empty()
    }
}

impl RaceStore for MemoryRaceStore {
    fn store_race(&self, race: &Race) -> StoreResult<()> {
        if self.fail_writes {
            return Err(injected_failure());
        }
        let mut races = self.races.lock();
        races.retain(|r| r.race_id != race.race_id);
        races.push(race.clone());
        Ok(())
    }

    fn find_by_race_id(&self, race_id: &str) -> StoreResult<Race> {
        self.races
            .lock()
            .iter()
            .find(|r| r.race_id == race_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("race", race_id))
    }

    fn list(&self, listing: &RaceListing) -> StoreResult<Vec<Race>> {
        let mut races: Vec<Race> =
            self.races.lock().iter().filter(|r| listing.matches(r)).cloned().collect();
        races.sort_by(|a, b| b.race_timestamp.cmp(&a.race_timestamp));
        races.truncate(listing.max_results);
        Ok(races)
    }

    fn delete_races(&self, race_ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>> {
        if dry_run {
            return Ok(dry_run_deletions(race_ids));
        }
        let mut races = self.races.lock();
        Ok(race_ids
            .iter()
            .map(|id| {
                let before = races.len();
                races.retain(|r| &r.race_id != id);
                let outcome =
                    if races.len() < before { DeleteOutcome::Deleted } else { DeleteOutcome::NotFound };
                Deletion::new(id.as_str(), outcome)
            })
            .collect())
    }

    fn add_annotation(&self, annotation: &Annotation, dry_run: bool) -> StoreResult<Option<String>> {
        if self.fail_writes {
            return Err(injected_failure());
        }
        if dry_run {
            return Ok(None);
        }
        let mut annotations = self.annotations.lock();
        let id = format!("annotation-{}", annotations.len());
        annotations.push(Annotation { id: Some(id.clone()), ..annotation.clone() });
        Ok(Some(id))
    }

    fn list_annotations(&self, listing: &AnnotationListing) -> StoreResult<Vec<Annotation>> {
        let annotations = self.annotations.lock();
        Ok(annotations
            .iter()
            .filter(|a| listing.track.as_ref().is_none_or(|t| a.track.as_ref() == Some(t)))
            .take(listing.max_results)
            .cloned()
            .collect())
    }

    fn delete_annotations(&self, ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>> {
        if dry_run {
            return Ok(dry_run_deletions(ids));
        }
        let mut annotations = self.annotations.lock();
        Ok(ids
            .iter()
            .map(|id| {
                let before = annotations.len();
                annotations.retain(|a| a.id.as_ref() != Some(id));
                let outcome = if annotations.len() < before {
                    DeleteOutcome::Deleted
                } else {
                    DeleteOutcome::NotFound
                };
                Deletion::new(id.as_str(), outcome)
            })
            .collect())
    }
}

/// Assert that a [`StoreResult`] is a [`StoreError::NotFound`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use benchmark_metrics::{StoreError, StoreResult, assert_not_found};
///
/// let result: StoreResult<()> = Err(StoreError::not_found("race", "missing"));
/// assert_not_found!(result);
/// ```
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::StoreError::NotFound { .. })),
            "expected StoreError::NotFound, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::StoreError::NotFound { .. })),
            "{}: expected StoreError::NotFound, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StoreResult`] is an error matching a pattern.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use benchmark_metrics::{StoreError, StoreResult, assert_store_error};
///
/// let result: StoreResult<()> = Err(StoreError::not_open("flush"));
/// assert_store_error!(result, StoreError::NotOpen { operation: "flush" });
/// ```
#[macro_export]
macro_rules! assert_store_error {
    ($result:expr, $pattern:pat) => {
        assert!(
            matches!($result, Err($pattern)),
            "expected {}, got: {:?}",
            stringify!($pattern),
            $result,
        );
    };
}
