//! Races, results and annotations in a remote datastore.
//!
//! Races are indexed by race id into `benchmark-races-YYYY-MM`; lookups and
//! listings search across every monthly index. Annotations share one index,
//! created on first use.

use benchmark_metrics::{
    Annotation, AnnotationListing, DeleteOutcome, Deletion, Meta, Race, RaceListing, RaceStore,
    StoreError, StoreResult, StoreSettings,
    race_store::dry_run_deletions,
    types::{from_iso8601, to_iso8601},
};
use chrono::{NaiveDate, NaiveTime};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    resilient::ResilientClient,
    templates::{TemplateKind, TemplateProvider, reconcile},
    transport::Hit,
};

const BASIC_DATE: &str = "%Y%m%d";

fn term(field: &str, value: impl Into<Value>) -> Value {
    let mut clause = Meta::new();
    clause.insert(field.to_owned(), value.into());
    json!({"term": clause})
}

/// Inclusive day range on `race-timestamp`, or `None` when unbounded.
fn day_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<Value> {
    if from.is_none() && to.is_none() {
        return None;
    }
    let mut bounds = Meta::new();
    if let Some(from) = from {
        bounds.insert("gte".into(), json!(from.format(BASIC_DATE).to_string()));
    }
    if let Some(to) = to {
        bounds.insert("lte".into(), json!(to.format(BASIC_DATE).to_string()));
    }
    bounds.insert("format".into(), json!("basic_date"));
    Some(json!({"range": {"race-timestamp": bounds}}))
}

/// Race store backed by a remote datastore.
#[derive(Debug, Clone)]
pub struct RemoteRaceStore {
    client: ResilientClient,
    templates: TemplateProvider,
    environment: String,
}

impl RemoteRaceStore {
    #[must_use]
    pub fn new(settings: &StoreSettings, client: ResilientClient, templates: TemplateProvider) -> Self {
        Self { client, templates, environment: settings.environment().to_owned() }
    }

    fn put_template(&self, kind: TemplateKind) -> StoreResult<()> {
        let template = self.templates.template(kind)?;
        self.client.execute("put_template", |t| t.put_template(kind.template_name(), &template))
    }

    fn environment_and_race(&self, race_id: &str) -> Value {
        json!({"query": {"bool": {"filter": [
            term("environment", self.environment.as_str()),
            term("race-id", race_id),
        ]}}})
    }

    fn annotation_from(hit: Hit) -> StoreResult<Annotation> {
        let text = |key: &str| hit.source.get(key).and_then(Value::as_str).map(str::to_owned);
        let race_timestamp = text("race-timestamp")
            .ok_or_else(|| StoreError::serialization("annotation without race-timestamp"))?;
        Ok(Annotation {
            id: Some(hit.id.clone()),
            environment: text("environment").unwrap_or_default(),
            race_timestamp: from_iso8601(&race_timestamp)?,
            track: text("track"),
            chart: text("chart"),
            chart_name: text("chart-name"),
            message: text("message").unwrap_or_default(),
        })
    }
}

impl RaceStore for RemoteRaceStore {
    #[tracing::instrument(skip(self, race), fields(race_id = %race.race_id))]
    fn store_race(&self, race: &Race) -> StoreResult<()> {
        self.put_template(TemplateKind::Races)?;
        let index = TemplateKind::Races.index_name(&race.race_timestamp);
        let doc = Value::Object(race.to_document()?);
        self.client.execute("index_race", |t| t.index_doc(&index, Some(&race.race_id), &doc))
    }

    #[tracing::instrument(skip(self))]
    fn find_by_race_id(&self, race_id: &str) -> StoreResult<Race> {
        let body = json!({"query": {"bool": {"filter": [term("race-id", race_id)]}}});
        let index = TemplateKind::Races.index_pattern();
        let response = self.client.execute("find_race", |t| t.search(&index, &body))?;
        match response.total() {
            0 => Err(StoreError::not_found("race", race_id)),
            1 => {
                let hit = response
                    .hits
                    .hits
                    .into_iter()
                    .next()
                    .ok_or_else(|| StoreError::not_found("race", race_id))?;
                Race::from_document(&hit.source)
            },
            hits => Err(StoreError::consistency(format!(
                "Expected exactly one race to match race id [{race_id}] but there were [{hits}] matches."
            ))),
        }
    }

    #[tracing::instrument(skip(self, listing))]
    fn list(&self, listing: &RaceListing) -> StoreResult<Vec<Race>> {
        let mut filters = vec![term("environment", self.environment.as_str())];
        filters.extend(day_range(listing.from_date, listing.to_date));
        if let Some(track) = &listing.track {
            filters.push(term("track", track.as_str()));
        }
        if let Some(name) = &listing.benchmark_name {
            filters.push(json!({"bool": {
                "should": [term("user-tags.benchmark-name", name.as_str()), term("user-tags.name", name.as_str())],
                "minimum_should_match": 1,
            }}));
        }
        if let Some(challenge) = &listing.challenge {
            filters.push(term("challenge", challenge.as_str()));
        }
        for (key, value) in &listing.user_tags {
            filters.push(term(&format!("user-tags.{key}"), value.as_str()));
        }
        let body = json!({
            "query": {"bool": {"filter": filters}},
            "size": listing.max_results,
            "sort": [{"race-timestamp": {"order": "desc"}}],
        });
        let index = TemplateKind::Races.index_pattern();
        let response = self.client.execute("list_races", |t| t.search(&index, &body))?;
        response.hits.hits.iter().map(|hit| Race::from_document(&hit.source)).collect()
    }

    #[tracing::instrument(skip(self, race_ids), fields(races = race_ids.len()))]
    fn delete_races(&self, race_ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>> {
        if dry_run {
            tracing::info!(races = ?race_ids, "dry run: not deleting races");
            return Ok(dry_run_deletions(race_ids));
        }
        let mut deletions = Vec::with_capacity(race_ids.len());
        for race_id in race_ids {
            let body = self.environment_and_race(race_id);
            let mut deleted = 0;
            for kind in [TemplateKind::Races, TemplateKind::Metrics, TemplateKind::Results] {
                let index = kind.index_pattern();
                deleted += self.client.execute("delete_race", |t| t.delete_by_query(&index, &body))?;
            }
            let outcome = if deleted > 0 { DeleteOutcome::Deleted } else { DeleteOutcome::NotFound };
            tracing::info!(race_id = %race_id, deleted, ?outcome, "deleted race documents");
            deletions.push(Deletion::new(race_id.as_str(), outcome));
        }
        Ok(deletions)
    }

    #[tracing::instrument(skip(self, annotation))]
    fn add_annotation(&self, annotation: &Annotation, dry_run: bool) -> StoreResult<Option<String>> {
        if dry_run {
            tracing::info!(message = %annotation.message, "dry run: not adding annotation");
            return Ok(None);
        }
        let index = TemplateKind::Annotations.index_pattern();
        reconcile(&self.client, &self.templates, TemplateKind::Annotations, false)?;
        if !self.client.execute("index_exists", |t| t.index_exists(&index))? {
            self.client.execute("create_index", |t| t.create_index(&index))?;
        }

        let midnight = annotation.race_timestamp.date_naive().and_time(NaiveTime::MIN).and_utc();
        let mut doc = Meta::new();
        doc.insert("environment".into(), json!(annotation.environment));
        doc.insert("race-timestamp".into(), json!(to_iso8601(&midnight)));
        for (key, value) in [
            ("track", &annotation.track),
            ("chart", &annotation.chart),
            ("chart-name", &annotation.chart_name),
        ] {
            if let Some(value) = value {
                doc.insert(key.into(), json!(value));
            }
        }
        doc.insert("message".into(), json!(annotation.message));

        let id = Uuid::new_v4().to_string();
        let doc = Value::Object(doc);
        self.client.execute("add_annotation", |t| t.index_doc(&index, Some(&id), &doc))?;
        tracing::info!(annotation_id = %id, "added annotation");
        Ok(Some(id))
    }

    #[tracing::instrument(skip(self, listing))]
    fn list_annotations(&self, listing: &AnnotationListing) -> StoreResult<Vec<Annotation>> {
        let index = TemplateKind::Annotations.index_pattern();
        if !self.client.execute("index_exists", |t| t.index_exists(&index))? {
            tracing::debug!(index = %index, "no annotations stored yet");
            return Ok(Vec::new());
        }
        let mut filters = vec![term("environment", self.environment.as_str())];
        filters.extend(day_range(listing.from_date, listing.to_date));
        if let Some(track) = &listing.track {
            // annotations without a track apply to every track
            filters.push(json!({"bool": {
                "should": [
                    term("track", track.as_str()),
                    {"bool": {"must_not": {"exists": {"field": "track"}}}},
                ],
                "minimum_should_match": 1,
            }}));
        }
        let body = json!({
            "query": {"bool": {"filter": filters}},
            "size": listing.max_results,
            "sort": [
                {"race-timestamp": {"order": "desc"}},
                {"track": {"order": "asc"}},
                {"chart": {"order": "asc"}},
            ],
        });
        let response = self.client.execute("list_annotations", |t| t.search(&index, &body))?;
        response.hits.hits.into_iter().map(Self::annotation_from).collect()
    }

    #[tracing::instrument(skip(self, ids), fields(annotations = ids.len()))]
    fn delete_annotations(&self, ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>> {
        if dry_run {
            tracing::info!(annotations = ?ids, "dry run: not deleting annotations");
            return Ok(dry_run_deletions(ids));
        }
        let index = TemplateKind::Annotations.index_pattern();
        ids.iter()
            .map(|id| {
                let deleted = self.client.execute("delete_annotation", |t| t.delete(&index, id))?;
                let outcome = if deleted { DeleteOutcome::Deleted } else { DeleteOutcome::NotFound };
                Ok(Deletion::new(id.as_str(), outcome))
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::testutil::{FakeDatastore, RecordingSleeper, resilient_client};

    fn store(fake: &Arc<FakeDatastore>) -> RemoteRaceStore {
        let client = resilient_client(fake, &Arc::new(RecordingSleeper::default()));
        RemoteRaceStore::new(&StoreSettings::default(), client, TemplateProvider::default())
    }

    #[test]
    fn test_day_range() {
        assert!(day_range(None, None).is_none());
        let from = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let range = day_range(Some(from), None).unwrap();
        assert_eq!(range["range"]["race-timestamp"], json!({"gte": "20240301", "format": "basic_date"}));
    }

    #[test]
    fn test_annotation_is_normalized_to_midnight() {
        let fake = Arc::new(FakeDatastore::new());
        let store = store(&fake);
        let annotation = Annotation::builder()
            .environment("local")
            .race_timestamp(Utc.with_ymd_and_hms(2024, 3, 5, 17, 45, 12).unwrap())
            .message("upgraded JDK")
            .build();

        let id = store.add_annotation(&annotation, false).unwrap().unwrap();
        let docs = fake.documents("benchmark-annotations");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["race-timestamp"], json!("20240305T000000Z"));
        assert!(docs[0].get("track").is_none());

        let listed = store.list_annotations(&AnnotationListing::builder().build()).unwrap();
        assert_eq!(listed[0].id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let fake = Arc::new(FakeDatastore::new());
        let store = store(&fake);
        let annotation = Annotation::builder()
            .environment("local")
            .race_timestamp(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap())
            .message("m")
            .build();
        assert_eq!(store.add_annotation(&annotation, true).unwrap(), None);
        let ids = vec!["a".to_owned()];
        assert_eq!(store.delete_races(&ids, true).unwrap()[0].outcome, DeleteOutcome::Skipped);
        assert!(fake.index_names().is_empty());
        assert_eq!(fake.calls("delete_by_query"), 0);
    }
}
