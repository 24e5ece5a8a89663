//! Flattened race results in a remote datastore.

use benchmark_metrics::{Race, ResultsStore, StoreResult};
use serde_json::Value;

use crate::{
    remote_store::BULK_CHUNK_SIZE,
    resilient::ResilientClient,
    templates::{TemplateKind, TemplateProvider},
};

/// Writes one document per result metric into `benchmark-results-YYYY-MM`.
#[derive(Debug, Clone)]
pub struct RemoteResultsStore {
    client: ResilientClient,
    templates: TemplateProvider,
}

impl RemoteResultsStore {
    #[must_use]
    pub fn new(client: ResilientClient, templates: TemplateProvider) -> Self {
        Self { client, templates }
    }
}

impl ResultsStore for RemoteResultsStore {
    #[tracing::instrument(skip(self, race), fields(race_id = %race.race_id))]
    fn store_results(&self, race: &Race) -> StoreResult<()> {
        let docs: Vec<Value> = race.to_result_documents().into_iter().map(Value::Object).collect();
        if docs.is_empty() {
            tracing::debug!("race has no results to store");
            return Ok(());
        }
        let kind = TemplateKind::Results;
        let template = self.templates.template(kind)?;
        self.client.execute("put_template", |t| t.put_template(kind.template_name(), &template))?;

        let index = kind.index_name(&race.race_timestamp);
        for chunk in docs.chunks(BULK_CHUNK_SIZE) {
            self.client.execute("bulk_index", |t| t.bulk_index(&index, chunk))?;
        }
        tracing::info!(index = %index, docs = docs.len(), "stored race results");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use benchmark_metrics::{GlobalStats, testutil::sample_race};
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        testutil::{FakeDatastore, RecordingSleeper, resilient_client},
        transport::Transport,
    };

    fn store(fake: &Arc<FakeDatastore>) -> RemoteResultsStore {
        RemoteResultsStore::new(
            resilient_client(fake, &Arc::new(RecordingSleeper::default())),
            TemplateProvider::default(),
        )
    }

    #[test]
    fn test_race_without_results_writes_nothing() {
        let fake = Arc::new(FakeDatastore::new());
        let race = sample_race("r1", Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        store(&fake).store_results(&race).unwrap();
        assert_eq!(fake.calls("put_template"), 0);
        assert_eq!(fake.calls("bulk_index"), 0);
    }

    #[test]
    fn test_results_land_in_monthly_index() {
        let fake = Arc::new(FakeDatastore::new());
        let mut race = sample_race("r1", Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        race.add_results(GlobalStats { merge_time: Some(12.0), ..GlobalStats::default() }).unwrap();

        store(&fake).store_results(&race).unwrap();
        let docs = fake.documents("benchmark-results-2024-02");
        assert!(!docs.is_empty());
        assert!(docs.iter().all(|d| d["race-id"] == "r1" && d["active"] == true));
        assert!(fake.get_template("benchmark-results").unwrap().is_some());
    }
}
