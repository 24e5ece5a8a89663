//! Race store backed by one JSON file per race.
//!
//! Layout: `{race_root}/races/{race_id}/race.json`. Filtering happens in
//! memory after all race files have been read; files that cannot be parsed
//! are skipped with a warning.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    config::StoreSettings,
    error::{ConfigError, StoreError, StoreResult},
    race::Race,
    race_store::{Annotation, AnnotationListing, Deletion, RaceListing, RaceStore},
    types::Meta,
};

const RACES_DIR: &str = "races";
const RACE_FILE: &str = "race.json";
const DATASTORE: &str = "in-memory";

/// Stores races as pretty-printed JSON files below the race root.
#[derive(Debug, Clone)]
pub struct FileRaceStore {
    races_dir: PathBuf,
}

impl FileRaceStore {
    #[must_use]
    pub fn new(settings: &StoreSettings) -> Self {
        Self::at(settings.race_root())
    }

    /// Store rooted at an explicit directory.
    #[must_use]
    pub fn at(race_root: impl AsRef<Path>) -> Self {
        Self { races_dir: race_root.as_ref().join(RACES_DIR) }
    }

    fn race_file(&self, race_id: &str) -> PathBuf {
        self.races_dir.join(race_id).join(RACE_FILE)
    }

    fn read_race(path: &Path) -> StoreResult<Race> {
        let content = fs::read_to_string(path).map_err(|e| {
            StoreError::io_with_source(format!("could not read race file [{}]", path.display()), e)
        })?;
        let doc: Meta = serde_json::from_str(&content).map_err(|e| {
            StoreError::serialization_with_source(
                format!("could not parse race file [{}]", path.display()),
                e,
            )
        })?;
        Race::from_document(&doc)
    }

    fn all_race_files(&self) -> StoreResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.races_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::io_with_source(
                    format!("could not list [{}]", self.races_dir.display()),
                    e,
                ));
            },
        };
        Ok(entries
            .filter_map(Result::ok)
            .map(|entry| entry.path().join(RACE_FILE))
            .filter(|path| path.is_file())
            .collect())
    }

    fn unsupported(operation: &'static str) -> StoreError {
        ConfigError::Unsupported { operation, datastore: DATASTORE }.into()
    }
}

impl RaceStore for FileRaceStore {
    #[tracing::instrument(skip(self, race), fields(race_id = %race.race_id))]
    fn store_race(&self, race: &Race) -> StoreResult<()> {
        let doc = race.to_document()?;
        let path = self.race_file(&race.race_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                StoreError::io_with_source(format!("could not create [{}]", dir.display()), e)
            })?;
        }
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| StoreError::serialization_with_source("failed to encode race", e))?;
        fs::write(&path, json).map_err(|e| {
            StoreError::io_with_source(format!("could not write race file [{}]", path.display()), e)
        })
    }

    fn find_by_race_id(&self, race_id: &str) -> StoreResult<Race> {
        let path = self.race_file(race_id);
        if !path.is_file() {
            return Err(StoreError::not_found("race", race_id));
        }
        Self::read_race(&path)
    }

    #[tracing::instrument(skip(self))]
    fn list(&self, listing: &RaceListing) -> StoreResult<Vec<Race>> {
        let mut races: Vec<Race> = self
            .all_race_files()?
            .iter()
            .filter_map(|path| match Self::read_race(path) {
                Ok(race) => Some(race),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable race file");
                    None
                },
            })
            .filter(|race| listing.matches(race))
            .collect();
        races.sort_by(|a, b| b.race_timestamp.cmp(&a.race_timestamp));
        races.truncate(listing.max_results);
        Ok(races)
    }

    fn delete_races(&self, _race_ids: &[String], _dry_run: bool) -> StoreResult<Vec<Deletion>> {
        Err(Self::unsupported("delete race"))
    }

    fn add_annotation(&self, _annotation: &Annotation, _dry_run: bool) -> StoreResult<Option<String>> {
        Err(Self::unsupported("add annotation"))
    }

    fn list_annotations(&self, _listing: &AnnotationListing) -> StoreResult<Vec<Annotation>> {
        Err(Self::unsupported("list annotations"))
    }

    fn delete_annotations(&self, _ids: &[String], _dry_run: bool) -> StoreResult<Vec<Deletion>> {
        Err(Self::unsupported("delete annotation"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::testutil::sample_race;

    #[test]
    fn test_store_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRaceStore::at(dir.path());
        let race = sample_race("r1", Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        store.store_race(&race).unwrap();

        assert!(dir.path().join("races/r1/race.json").is_file());
        assert_eq!(store.find_by_race_id("r1").unwrap(), race);
    }

    #[test]
    fn test_find_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRaceStore::at(dir.path());
        crate::assert_not_found!(store.find_by_race_id("nope"));
    }

    #[test]
    fn test_list_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRaceStore::at(dir.path().join("missing"));
        assert!(store.list(&RaceListing::default()).unwrap().is_empty());
    }

    #[test]
    fn test_list_sorted_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRaceStore::at(dir.path());
        for (id, day) in [("a", 3), ("b", 1), ("c", 2)] {
            store.store_race(&sample_race(id, Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())).unwrap();
        }

        let ids = |races: Vec<Race>| races.into_iter().map(|r| r.race_id).collect::<Vec<_>>();
        assert_eq!(ids(store.list(&RaceListing::default()).unwrap()), vec!["a", "c", "b"]);
        let listing = RaceListing::builder().max_results(2).build();
        assert_eq!(ids(store.list(&listing).unwrap()), vec!["a", "c"]);
    }

    #[test]
    fn test_list_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRaceStore::at(dir.path());
        store.store_race(&sample_race("good", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())).unwrap();
        let broken = dir.path().join("races/broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("race.json"), "{not json").unwrap();

        let races = store.list(&RaceListing::default()).unwrap();
        assert_eq!(races.len(), 1);
        assert_eq!(races[0].race_id, "good");
    }

    #[test]
    fn test_annotations_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRaceStore::at(dir.path());
        let result = store.list_annotations(&AnnotationListing::builder().build());
        assert!(matches!(
            result,
            Err(StoreError::Config(ConfigError::Unsupported { operation: "list annotations", .. }))
        ));
        assert!(store.delete_races(&["r1".to_owned()], false).unwrap_err().is_setup_error());
    }
}
