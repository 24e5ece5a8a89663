//! One benchmark run: its configuration snapshot, provenance and results.
//!
//! A race has two persistent projections. [`Race::to_document`] is the
//! nested form stored by race stores and read back by
//! [`Race::from_document`]; [`Race::to_result_documents`] flattens the
//! attached [`GlobalStats`] into one reporting document per metric.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::{
    error::{StoreError, StoreResult},
    schedule::{Challenge, Track},
    stats::GlobalStats,
    types::{Meta, from_iso8601, to_iso8601},
};

/// A benchmark run.
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct Race {
    #[builder(into)]
    pub rally_version: String,
    #[builder(into)]
    pub rally_revision: Option<String>,
    #[builder(into)]
    pub environment: String,
    #[builder(into)]
    pub race_id: String,
    pub race_timestamp: DateTime<Utc>,
    #[builder(into)]
    pub pipeline: Option<String>,
    #[builder(default)]
    pub user_tags: BTreeMap<String, String>,
    #[builder(into)]
    pub track: String,
    #[builder(default)]
    pub track_params: Meta,
    #[builder(into)]
    pub challenge: Option<String>,
    /// Auto-generated challenges are left out of the race document.
    #[builder(default)]
    pub challenge_auto_generated: bool,
    #[builder(default)]
    pub car: Vec<String>,
    #[builder(default)]
    pub car_params: Meta,
    #[builder(default)]
    pub plugin_params: Meta,
    #[builder(into)]
    pub track_revision: Option<String>,
    #[builder(into)]
    pub team_revision: Option<String>,
    #[builder(into)]
    pub distribution_version: Option<String>,
    #[builder(into)]
    pub distribution_flavor: Option<String>,
    #[builder(into)]
    pub revision: Option<String>,
    pub results: Option<GlobalStats>,
    #[builder(default)]
    pub meta_data: Meta,
}

/// Builder state after [`Race::create`]: track, challenge and meta are set.
pub type CreatedState = race_builder::SetMetaData<
    race_builder::SetChallengeAutoGenerated<race_builder::SetChallenge<race_builder::SetTrack>>,
>;

impl Race {
    /// Starts a race for a track and challenge.
    ///
    /// Race meta is the track meta overlaid with the challenge meta.
    pub fn create(track: &Track, challenge: &Challenge) -> RaceBuilder<CreatedState> {
        let mut meta_data = track.meta_data.clone();
        meta_data.extend(challenge.meta_data.clone());
        Self::builder()
            .track(track.name.clone())
            .challenge(challenge.name.clone())
            .challenge_auto_generated(challenge.auto_generated)
            .meta_data(meta_data)
    }

    /// Cars joined with `+`, e.g. `4gheap+ea`.
    #[must_use]
    pub fn car_name(&self) -> String {
        self.car.join("+")
    }

    /// Attaches the results of the run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Consistency`] if results are already attached.
    pub fn add_results(&mut self, results: GlobalStats) -> StoreResult<()> {
        if self.results.is_some() {
            return Err(StoreError::consistency(format!(
                "results of race [{}] are already attached",
                self.race_id
            )));
        }
        self.results = Some(results);
        Ok(())
    }

    /// Nested representation persisted by race stores.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the results cannot be encoded.
    pub fn to_document(&self) -> StoreResult<Meta> {
        let mut doc = Meta::new();
        doc.insert("rally-version".into(), json!(self.rally_version));
        doc.insert("rally-revision".into(), json!(self.rally_revision));
        doc.insert("environment".into(), json!(self.environment));
        doc.insert("race-id".into(), json!(self.race_id));
        doc.insert("race-timestamp".into(), json!(to_iso8601(&self.race_timestamp)));
        doc.insert("pipeline".into(), json!(self.pipeline));
        doc.insert("user-tags".into(), json!(self.user_tags));
        doc.insert("track".into(), json!(self.track));
        doc.insert("car".into(), json!(self.car));
        doc.insert(
            "cluster".into(),
            json!({
                "revision": self.revision,
                "distribution-version": self.distribution_version,
                "distribution-flavor": self.distribution_flavor,
                "team-revision": self.team_revision,
            }),
        );
        if let Some(results) = &self.results {
            let results = serde_json::to_value(results)
                .map_err(|e| StoreError::serialization_with_source("failed to encode race results", e))?;
            doc.insert("results".into(), results);
        }
        if let Some(revision) = &self.track_revision {
            doc.insert("track-revision".into(), json!(revision));
        }
        if let Some(challenge) = self.challenge.as_ref().filter(|_| !self.challenge_auto_generated) {
            doc.insert("challenge".into(), json!(challenge));
        }
        insert_non_empty(&mut doc, "track-params", &self.track_params);
        insert_non_empty(&mut doc, "car-params", &self.car_params);
        insert_non_empty(&mut doc, "plugin-params", &self.plugin_params);
        Ok(doc)
    }

    /// One reporting document per metric of the attached results.
    ///
    /// Each document is the shared race template overlaid with one entry of
    /// [`GlobalStats::as_flat_list`]. A race without results yields nothing.
    #[must_use]
    pub fn to_result_documents(&self) -> Vec<Meta> {
        let Some(results) = &self.results else {
            return Vec::new();
        };
        let template = self.result_template();
        results
            .as_flat_list()
            .into_iter()
            .map(|item| {
                let mut doc = template.clone();
                doc.extend(item);
                doc
            })
            .collect()
    }

    fn result_template(&self) -> Meta {
        let mut doc = Meta::new();
        doc.insert("rally-version".into(), json!(self.rally_version));
        doc.insert("rally-revision".into(), json!(self.rally_revision));
        doc.insert("environment".into(), json!(self.environment));
        doc.insert("race-id".into(), json!(self.race_id));
        doc.insert("race-timestamp".into(), json!(to_iso8601(&self.race_timestamp)));
        doc.insert("distribution-version".into(), json!(self.distribution_version));
        doc.insert("distribution-flavor".into(), json!(self.distribution_flavor));
        doc.insert("user-tags".into(), json!(self.user_tags));
        doc.insert("track".into(), json!(self.track));
        doc.insert("challenge".into(), json!(self.challenge));
        doc.insert("car".into(), json!(self.car_name()));
        doc.insert("active".into(), json!(true));
        if let Some(major) = self.distribution_version.as_deref().and_then(major_version) {
            doc.insert("distribution-major-version".into(), json!(major));
        }
        if let Some(revision) = &self.team_revision {
            doc.insert("team-revision".into(), json!(revision));
        }
        if let Some(revision) = &self.track_revision {
            doc.insert("track-revision".into(), json!(revision));
        }
        insert_non_empty(&mut doc, "track-params", &self.track_params);
        insert_non_empty(&mut doc, "car-params", &self.car_params);
        insert_non_empty(&mut doc, "plugin-params", &self.plugin_params);
        insert_non_empty(&mut doc, "meta", &self.meta_data);
        doc
    }

    /// Restores a race from its nested representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if a mandatory field is
    /// missing or malformed.
    pub fn from_document(doc: &Meta) -> StoreResult<Self> {
        let cluster = doc.get("cluster").and_then(Value::as_object);
        let cluster_str =
            |key: &str| cluster.and_then(|c| c.get(key)).and_then(Value::as_str).map(str::to_owned);
        let results = match doc.get("results") {
            Some(Value::Null) | None => None,
            Some(value) => Some(serde_json::from_value(value.clone()).map_err(|e| {
                StoreError::serialization_with_source("failed to decode race results", e)
            })?),
        };

        Ok(Self {
            rally_version: required_str(doc, "rally-version")?,
            rally_revision: optional_str(doc, "rally-revision"),
            environment: required_str(doc, "environment")?,
            race_id: required_str(doc, "race-id")?,
            race_timestamp: from_iso8601(&required_str(doc, "race-timestamp")?)?,
            pipeline: optional_str(doc, "pipeline"),
            user_tags: user_tags(doc.get("user-tags")),
            track: required_str(doc, "track")?,
            track_params: object(doc, "track-params"),
            challenge: optional_str(doc, "challenge"),
            challenge_auto_generated: false,
            car: cars(doc.get("car")),
            car_params: object(doc, "car-params"),
            plugin_params: object(doc, "plugin-params"),
            track_revision: optional_str(doc, "track-revision"),
            team_revision: cluster_str("team-revision"),
            distribution_version: cluster_str("distribution-version"),
            distribution_flavor: cluster_str("distribution-flavor"),
            revision: cluster_str("revision"),
            results,
            meta_data: object(doc, "meta"),
        })
    }
}

fn insert_non_empty(doc: &mut Meta, key: &str, value: &Meta) {
    if !value.is_empty() {
        doc.insert(key.to_owned(), Value::Object(value.clone()));
    }
}

fn required_str(doc: &Meta, key: &str) -> StoreResult<String> {
    optional_str(doc, key)
        .ok_or_else(|| StoreError::serialization(format!("race document lacks [{key}]")))
}

fn optional_str(doc: &Meta, key: &str) -> Option<String> {
    doc.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn object(doc: &Meta, key: &str) -> Meta {
    doc.get(key).and_then(Value::as_object).cloned().unwrap_or_default()
}

fn user_tags(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(tags)) = value else {
        return BTreeMap::new();
    };
    tags.iter()
        .map(|(k, v)| {
            let v = v.as_str().map_or_else(|| v.to_string(), str::to_owned);
            (k.clone(), v)
        })
        .collect()
}

/// Accepts both a list of car names and a single `+`-joined name.
fn cars(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_owned).collect(),
        Some(Value::String(name)) => name.split('+').map(str::to_owned).collect(),
        _ => Vec::new(),
    }
}

/// Major version of a `major.minor.patch[-suffix]` identifier.
fn major_version(version: &str) -> Option<u64> {
    let (core, suffix) = match version.split_once('-') {
        Some((core, suffix)) => (core, Some(suffix)),
        None => (version, None),
    };
    if suffix.is_some_and(|s| s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric())) {
        return None;
    }
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    parts[0].parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::stats::{LatencyStats, SummaryStats};

    fn race() -> Race {
        let mut track = Track::new("geonames");
        track.meta_data.insert("source".into(), json!("track"));
        track.meta_data.insert("level".into(), json!("track"));
        let mut challenge = Challenge::new("append-no-conflicts");
        challenge.meta_data.insert("level".into(), json!("challenge"));

        let mut track_params = Meta::new();
        track_params.insert("shards".into(), json!(3));
        Race::create(&track, &challenge)
            .rally_version("2.11.0")
            .rally_revision("abc123")
            .environment("nightly")
            .race_id("0f9e8d7c")
            .race_timestamp(Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap())
            .pipeline("benchmark-only")
            .user_tags(BTreeMap::from([("intention".to_owned(), "baseline".to_owned())]))
            .track_params(track_params)
            .car(vec!["defaults".into(), "trial-license".into()])
            .distribution_version("8.13.2")
            .distribution_flavor("default")
            .revision("deadbeef")
            .build()
    }

    fn results() -> GlobalStats {
        let mut stats = GlobalStats { total_time: Some(12.5), ..GlobalStats::default() };
        stats.add_op_metrics(
            "index-append",
            "bulk",
            SummaryStats::unit_only(Some("docs/s".into())),
            LatencyStats::default(),
            LatencyStats::default(),
            LatencyStats::default(),
            0.0,
            None,
            Meta::new(),
        );
        stats
    }

    #[test]
    fn test_create_merges_track_then_challenge_meta() {
        let race = race();
        assert_eq!(race.meta_data.get("source"), Some(&json!("track")));
        assert_eq!(race.meta_data.get("level"), Some(&json!("challenge")));
    }

    #[test]
    fn test_add_results_only_once() {
        let mut race = race();
        race.add_results(results()).unwrap();
        assert!(matches!(race.add_results(results()), Err(StoreError::Consistency { .. })));
    }

    #[test]
    fn test_document_fields() {
        let doc = race().to_document().unwrap();
        assert_eq!(doc["race-timestamp"], json!("20240517T083000Z"));
        assert_eq!(doc["car"], json!(["defaults", "trial-license"]));
        assert_eq!(doc["cluster"]["distribution-version"], json!("8.13.2"));
        assert_eq!(doc["challenge"], json!("append-no-conflicts"));
        assert_eq!(doc["track-params"], json!({"shards": 3}));
        assert!(!doc.contains_key("results"));
        assert!(!doc.contains_key("car-params"));
        assert!(!doc.contains_key("meta"));
    }

    #[test]
    fn test_auto_generated_challenge_left_out() {
        let mut race = race();
        race.challenge_auto_generated = true;
        assert!(!race.to_document().unwrap().contains_key("challenge"));
    }

    #[test]
    fn test_document_roundtrip() {
        let mut race = race();
        race.add_results(results()).unwrap();
        let doc = race.to_document().unwrap();
        let restored = Race::from_document(&doc).unwrap();
        assert_eq!(restored.race_id, race.race_id);
        assert_eq!(restored.race_timestamp, race.race_timestamp);
        assert_eq!(restored.car, race.car);
        assert_eq!(restored.results, race.results);
        assert_eq!(restored.distribution_flavor.as_deref(), Some("default"));
        assert_eq!(restored.to_document().unwrap(), doc);
    }

    #[test]
    fn test_from_document_rejects_missing_race_id() {
        let mut doc = race().to_document().unwrap();
        doc.remove("race-id");
        assert!(matches!(Race::from_document(&doc), Err(StoreError::Serialization { .. })));
    }

    #[test]
    fn test_result_documents() {
        let mut race = race();
        assert!(race.to_result_documents().is_empty());
        race.add_results(results()).unwrap();

        let docs = race.to_result_documents();
        let names: Vec<&Value> = docs.iter().map(|d| &d["name"]).collect();
        assert_eq!(names.first(), Some(&&json!("duration")));
        assert_eq!(names.last(), Some(&&json!("total_time")));
        for doc in &docs {
            assert_eq!(doc["car"], json!("defaults+trial-license"));
            assert_eq!(doc["active"], json!(true));
            assert_eq!(doc["distribution-major-version"], json!(8));
            assert_eq!(doc["meta"]["source"], json!("track"));
        }
        assert_eq!(docs.last().unwrap()["value"], json!({"single": 12.5}));
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("8.13.2"), Some(8));
        assert_eq!(major_version("7.17.0-SNAPSHOT"), Some(7));
        assert_eq!(major_version("8.13"), None);
        assert_eq!(major_version("main"), None);
        assert_eq!(major_version("8.x.1"), None);
    }

    #[test]
    fn test_legacy_car_string() {
        assert_eq!(cars(Some(&json!("a+b"))), vec!["a".to_owned(), "b".to_owned()]);
    }
}
