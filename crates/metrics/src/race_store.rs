//! Persistence of races and chart annotations.
//!
//! [`RaceStore`] is implemented by the file-backed store in this crate and
//! by the remote store in `benchmark-metrics-remote`. [`CompositeRaceStore`]
//! writes every race to both and serves all reads from the remote one.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::{error::StoreResult, race::Race};

/// Maximum number of races or annotations returned by default.
pub const DEFAULT_MAX_RESULTS: usize = 50;

/// Filter for [`RaceStore::list`].
///
/// ```
/// use benchmark_metrics::RaceListing;
///
/// let listing = RaceListing::builder().track("geonames").max_results(10).build();
/// assert_eq!(listing.max_results, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct RaceListing {
    #[builder(into)]
    pub track: Option<String>,
    /// Matched against the `name` and `benchmark-name` user tags.
    #[builder(into)]
    pub benchmark_name: Option<String>,
    /// Inclusive, compared by calendar day.
    pub from_date: Option<NaiveDate>,
    /// Inclusive, compared by calendar day.
    pub to_date: Option<NaiveDate>,
    #[builder(into)]
    pub challenge: Option<String>,
    /// Every tag must match exactly.
    #[builder(default)]
    pub user_tags: BTreeMap<String, String>,
    #[builder(default = DEFAULT_MAX_RESULTS)]
    pub max_results: usize,
}

impl Default for RaceListing {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RaceListing {
    /// Whether a race passes every filter.
    #[must_use]
    pub fn matches(&self, race: &Race) -> bool {
        let day = race.race_timestamp.date_naive();
        self.track.as_ref().is_none_or(|t| *t == race.track)
            && self.benchmark_name.as_ref().is_none_or(|name| {
                race.user_tags.get("name") == Some(name)
                    || race.user_tags.get("benchmark-name") == Some(name)
            })
            && self.from_date.is_none_or(|from| day >= from)
            && self.to_date.is_none_or(|to| day <= to)
            && self.challenge.as_ref().is_none_or(|c| race.challenge.as_ref() == Some(c))
            && self.user_tags.iter().all(|(k, v)| race.user_tags.get(k) == Some(v))
    }
}

/// A note attached to a chart at a given day.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct Annotation {
    /// Assigned by the store when the annotation is added.
    #[builder(into)]
    pub id: Option<String>,
    #[builder(into)]
    pub environment: String,
    /// Normalized to midnight so annotations line up with daily data points.
    pub race_timestamp: DateTime<Utc>,
    #[builder(into)]
    pub track: Option<String>,
    /// Chart type the annotation belongs to.
    #[builder(into)]
    pub chart: Option<String>,
    #[builder(into)]
    pub chart_name: Option<String>,
    #[builder(into)]
    pub message: String,
}

/// Filter for [`RaceStore::list_annotations`].
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct AnnotationListing {
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    #[builder(into)]
    pub track: Option<String>,
    #[builder(default = DEFAULT_MAX_RESULTS)]
    pub max_results: usize,
}

/// Result of deleting one race or annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// Dry run: nothing was touched.
    Skipped,
}

/// Per-id outcome of a delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub id: String,
    pub outcome: DeleteOutcome,
}

impl Deletion {
    #[must_use]
    pub fn new(id: impl Into<String>, outcome: DeleteOutcome) -> Self {
        Self { id: id.into(), outcome }
    }
}

/// Marks every id as skipped, for dry runs.
#[must_use]
pub fn dry_run_deletions(ids: &[String]) -> Vec<Deletion> {
    ids.iter().map(|id| Deletion::new(id.as_str(), DeleteOutcome::Skipped)).collect()
}

/// Stores races and annotations.
pub trait RaceStore {
    /// Persists a race, replacing an earlier version with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the race cannot be written.
    fn store_race(&self, race: &Race) -> StoreResult<()>;

    /// The race with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) if no
    /// race has this id and
    /// [`StoreError::Consistency`](crate::StoreError::Consistency) if more
    /// than one has.
    fn find_by_race_id(&self, race_id: &str) -> StoreResult<Race>;

    /// Races matching the filter, newest first, at most `max_results`.
    ///
    /// # Errors
    ///
    /// Returns an error if the races cannot be read.
    fn list(&self, listing: &RaceListing) -> StoreResult<Vec<Race>>;

    /// Deletes races together with their metrics and results.
    ///
    /// # Errors
    ///
    /// Returns an error if the store does not support deletion or a delete
    /// request fails.
    fn delete_races(&self, race_ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>>;

    /// Adds an annotation and returns its id, or `None` on a dry run.
    ///
    /// # Errors
    ///
    /// Returns an error if the store does not support annotations or the
    /// write fails.
    fn add_annotation(&self, annotation: &Annotation, dry_run: bool) -> StoreResult<Option<String>>;

    /// Annotations matching the filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the store does not support annotations or the
    /// query fails.
    fn list_annotations(&self, listing: &AnnotationListing) -> StoreResult<Vec<Annotation>>;

    /// Deletes annotations by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store does not support annotations or a
    /// delete request fails.
    fn delete_annotations(&self, ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>>;
}

/// Writes races to a local copy and a system of record; reads only from
/// the system of record.
#[derive(Debug)]
pub struct CompositeRaceStore<L, R> {
    local: L,
    remote: R,
}

impl<L: RaceStore, R: RaceStore> CompositeRaceStore<L, R> {
    #[must_use]
    pub fn new(local: L, remote: R) -> Self {
        Self { local, remote }
    }

    #[must_use]
    pub fn local(&self) -> &L {
        &self.local
    }

    #[must_use]
    pub fn remote(&self) -> &R {
        &self.remote
    }
}

impl<L: RaceStore, R: RaceStore> RaceStore for CompositeRaceStore<L, R> {
    #[tracing::instrument(skip(self, race), fields(race_id = %race.race_id))]
    fn store_race(&self, race: &Race) -> StoreResult<()> {
        self.local.store_race(race)?;
        self.remote.store_race(race)
    }

    fn find_by_race_id(&self, race_id: &str) -> StoreResult<Race> {
        self.remote.find_by_race_id(race_id)
    }

    fn list(&self, listing: &RaceListing) -> StoreResult<Vec<Race>> {
        self.remote.list(listing)
    }

    fn delete_races(&self, race_ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>> {
        self.remote.delete_races(race_ids, dry_run)
    }

    fn add_annotation(&self, annotation: &Annotation, dry_run: bool) -> StoreResult<Option<String>> {
        self.remote.add_annotation(annotation, dry_run)
    }

    fn list_annotations(&self, listing: &AnnotationListing) -> StoreResult<Vec<Annotation>> {
        self.remote.list_annotations(listing)
    }

    fn delete_annotations(&self, ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>> {
        self.remote.delete_annotations(ids, dry_run)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::testutil::{MemoryRaceStore, sample_race};

    #[test]
    fn test_listing_filters() {
        let mut race = sample_race("r1", Utc.with_ymd_and_hms(2024, 5, 17, 23, 59, 0).unwrap());
        race.user_tags.insert("benchmark-name".into(), "nightly".into());
        race.user_tags.insert("env".into(), "ci".into());

        assert!(RaceListing::default().matches(&race));
        assert!(RaceListing::builder().benchmark_name("nightly").build().matches(&race));
        assert!(!RaceListing::builder().benchmark_name("weekly").build().matches(&race));

        let day = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap();
        assert!(RaceListing::builder().from_date(day).to_date(day).build().matches(&race));
        let next = NaiveDate::from_ymd_opt(2024, 5, 18).unwrap();
        assert!(!RaceListing::builder().from_date(next).build().matches(&race));

        let tags = BTreeMap::from([("env".to_owned(), "ci".to_owned())]);
        assert!(RaceListing::builder().user_tags(tags).build().matches(&race));
        let tags = BTreeMap::from([("env".to_owned(), "prod".to_owned())]);
        assert!(!RaceListing::builder().user_tags(tags).build().matches(&race));

        assert!(!RaceListing::builder().challenge("other").build().matches(&race));
        assert!(!RaceListing::builder().track("other").build().matches(&race));
    }

    #[test]
    fn test_composite_writes_both_reads_remote() {
        let store = CompositeRaceStore::new(MemoryRaceStore::default(), MemoryRaceStore::default());
        let race = sample_race("r1", Utc.with_ymd_and_hms(2024, 5, 17, 8, 0, 0).unwrap());
        store.store_race(&race).unwrap();

        assert_eq!(store.local().len(), 1);
        assert_eq!(store.remote().len(), 1);
        assert_eq!(store.list(&RaceListing::default()).unwrap().len(), 1);
        assert_eq!(store.find_by_race_id("r1").unwrap(), race);
    }

    #[test]
    fn test_composite_propagates_remote_failure() {
        let store = CompositeRaceStore::new(MemoryRaceStore::default(), MemoryRaceStore::failing());
        let race = sample_race("r1", Utc.with_ymd_and_hms(2024, 5, 17, 8, 0, 0).unwrap());
        assert!(store.store_race(&race).is_err());
        assert_eq!(store.local().len(), 1);
    }

    #[test]
    fn test_composite_local_failure_skips_remote() {
        let store = CompositeRaceStore::new(MemoryRaceStore::failing(), MemoryRaceStore::default());
        let race = sample_race("r1", Utc.with_ymd_and_hms(2024, 5, 17, 8, 0, 0).unwrap());
        assert!(store.store_race(&race).is_err());
        assert!(store.remote().is_empty());
    }
}
