//! Configuration-driven selection of store backends.
//!
//! [`StoreFactory`] resolves the datastore configuration once, including
//! credentials from the environment, and hands out stores that share one
//! [`ResilientClient`]. The backend enums dispatch to the selected variant
//! so call sites only see the store traits.

use std::sync::Arc;

use benchmark_metrics::{
    Annotation, AnnotationListing, Clock, CompositeRaceStore, Deletion, FileRaceStore,
    LocalMetricsStore, MetricRecord, MetricsStore, NoopResultsStore, OpenContext, Percentiles,
    Query, Race, RaceListing, RaceStore, ResultsStore, SampleType, SortKey, Stats, StoreCore,
    StoreResult, StoreSettings,
};
use bytes::Bytes;

use crate::{
    config::{DatastoreSelection, ReportingConfig, ResolvedDatastore},
    http::HttpTransport,
    race_store::RemoteRaceStore,
    remote_store::RemoteMetricsStore,
    resilient::{ResilientClient, Sleeper},
    results::RemoteResultsStore,
    templates::TemplateProvider,
    transport::Transport,
};

#[derive(Debug, Clone)]
struct RemoteBackend {
    client: ResilientClient,
    templates: TemplateProvider,
    overwrite_templates: bool,
}

/// Builds metrics, race and results stores for one configuration.
///
/// ```
/// use benchmark_metrics_remote::{MetricsStoreBackend, ReportingConfig, StoreFactory};
///
/// let factory = StoreFactory::new(ReportingConfig::default())?;
/// let store = factory.metrics_store(std::sync::Arc::new(benchmark_metrics::SystemClock::new()));
/// assert!(matches!(store, MetricsStoreBackend::Local(_)));
/// # Ok::<(), benchmark_metrics::StoreError>(())
/// ```
#[derive(Debug, Clone)]
pub struct StoreFactory {
    settings: StoreSettings,
    remote: Option<RemoteBackend>,
}

impl StoreFactory {
    /// Resolves `config` against the process environment and connects
    /// over HTTP when a remote datastore is selected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`](benchmark_metrics::StoreError::Config)
    /// for invalid or conflicting settings, or the error of building the
    /// HTTP client.
    pub fn new(config: ReportingConfig) -> StoreResult<Self> {
        let ReportingConfig { settings, datastore } = config;
        match datastore {
            DatastoreSelection::InMemory => Ok(Self { settings, remote: None }),
            DatastoreSelection::Remote(datastore) => {
                let resolved = datastore.resolve_from_env()?;
                let transport = Arc::new(HttpTransport::new(&resolved)?);
                Ok(Self::remote(settings, &resolved, transport))
            },
        }
    }

    /// Like [`new`](Self::new), with an explicit environment lookup and
    /// transport.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`](benchmark_metrics::StoreError::Config)
    /// for invalid or conflicting settings.
    pub fn with_transport<F>(
        config: ReportingConfig,
        env: F,
        transport: Arc<dyn Transport>,
    ) -> StoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ReportingConfig { settings, datastore } = config;
        match datastore {
            DatastoreSelection::InMemory => Ok(Self { settings, remote: None }),
            DatastoreSelection::Remote(datastore) => {
                let resolved = datastore.resolve(env)?;
                Ok(Self::remote(settings, &resolved, transport))
            },
        }
    }

    fn remote(
        settings: StoreSettings,
        resolved: &ResolvedDatastore,
        transport: Arc<dyn Transport>,
    ) -> Self {
        tracing::info!(endpoint = %resolved.endpoint(), secure = resolved.secure(), "using remote datastore");
        let remote = RemoteBackend {
            client: ResilientClient::new(transport, *resolved.retry()),
            templates: TemplateProvider::from_datastore(resolved),
            overwrite_templates: resolved.overwrite_existing_templates(),
        };
        Self { settings, remote: Some(remote) }
    }

    /// Replaces the sleeper of the shared client.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        if let Some(remote) = self.remote.as_mut() {
            remote.client = remote.client.clone().with_sleeper(sleeper);
        }
        self
    }

    #[must_use]
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Whether a remote datastore is configured.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    #[must_use]
    pub fn metrics_store(&self, clock: Arc<dyn Clock>) -> MetricsStoreBackend {
        match &self.remote {
            None => MetricsStoreBackend::Local(LocalMetricsStore::new(self.settings.clone(), clock)),
            Some(remote) => MetricsStoreBackend::Remote(RemoteMetricsStore::new(
                self.settings.clone(),
                clock,
                remote.client.clone(),
                remote.templates,
                remote.overwrite_templates,
            )),
        }
    }

    #[must_use]
    pub fn race_store(&self) -> RaceStoreBackend {
        let file = FileRaceStore::new(&self.settings);
        match &self.remote {
            None => RaceStoreBackend::File(file),
            Some(remote) => RaceStoreBackend::Composite(CompositeRaceStore::new(
                file,
                RemoteRaceStore::new(&self.settings, remote.client.clone(), remote.templates),
            )),
        }
    }

    #[must_use]
    pub fn results_store(&self) -> ResultsStoreBackend {
        match &self.remote {
            None => ResultsStoreBackend::Noop(NoopResultsStore),
            Some(remote) => {
                ResultsStoreBackend::Remote(RemoteResultsStore::new(remote.client.clone(), remote.templates))
            },
        }
    }
}

/// Metrics store selected by the [`StoreFactory`].
#[derive(Debug)]
pub enum MetricsStoreBackend {
    Local(LocalMetricsStore),
    Remote(RemoteMetricsStore),
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Self::Local($store) => $call,
            Self::Remote($store) => $call,
        }
    };
}

impl MetricsStore for MetricsStoreBackend {
    fn core(&self) -> &StoreCore {
        dispatch!(self, s => s.core())
    }

    fn core_mut(&mut self) -> &mut StoreCore {
        dispatch!(self, s => s.core_mut())
    }

    fn open(&mut self, context: OpenContext, create: bool) -> StoreResult<()> {
        dispatch!(self, s => s.open(context, create))
    }

    fn flush(&mut self, refresh: bool) -> StoreResult<()> {
        dispatch!(self, s => s.flush(refresh))
    }

    fn add(&mut self, record: MetricRecord) -> StoreResult<()> {
        dispatch!(self, s => s.add(record))
    }

    fn to_externalizable(&mut self, clear: bool) -> StoreResult<Option<Bytes>> {
        dispatch!(self, s => s.to_externalizable(clear))
    }

    fn get_raw(&self, query: &Query) -> StoreResult<Vec<MetricRecord>> {
        dispatch!(self, s => s.get_raw(query))
    }

    fn get_one(&self, query: &Query, sort: Option<SortKey>) -> StoreResult<Option<MetricRecord>> {
        dispatch!(self, s => s.get_one(query, sort))
    }

    fn get_error_rate(
        &self,
        task: &str,
        operation_type: Option<&str>,
        sample_type: Option<SampleType>,
    ) -> StoreResult<f64> {
        dispatch!(self, s => s.get_error_rate(task, operation_type, sample_type))
    }

    fn get_stats(&self, query: &Query) -> StoreResult<Option<Stats>> {
        dispatch!(self, s => s.get_stats(query))
    }

    fn get_percentiles(
        &self,
        query: &Query,
        percentiles: Option<&[f64]>,
    ) -> StoreResult<Option<Percentiles>> {
        dispatch!(self, s => s.get_percentiles(query, percentiles))
    }
}

/// Race store selected by the [`StoreFactory`].
#[derive(Debug)]
pub enum RaceStoreBackend {
    File(FileRaceStore),
    /// Writes to the race files and the datastore; reads from the datastore.
    Composite(CompositeRaceStore<FileRaceStore, RemoteRaceStore>),
}

impl RaceStoreBackend {
    fn store(&self) -> &dyn RaceStore {
        match self {
            Self::File(store) => store,
            Self::Composite(store) => store,
        }
    }
}

impl RaceStore for RaceStoreBackend {
    fn store_race(&self, race: &Race) -> StoreResult<()> {
        self.store().store_race(race)
    }

    fn find_by_race_id(&self, race_id: &str) -> StoreResult<Race> {
        self.store().find_by_race_id(race_id)
    }

    fn list(&self, listing: &RaceListing) -> StoreResult<Vec<Race>> {
        self.store().list(listing)
    }

    fn delete_races(&self, race_ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>> {
        self.store().delete_races(race_ids, dry_run)
    }

    fn add_annotation(&self, annotation: &Annotation, dry_run: bool) -> StoreResult<Option<String>> {
        self.store().add_annotation(annotation, dry_run)
    }

    fn list_annotations(&self, listing: &AnnotationListing) -> StoreResult<Vec<Annotation>> {
        self.store().list_annotations(listing)
    }

    fn delete_annotations(&self, ids: &[String], dry_run: bool) -> StoreResult<Vec<Deletion>> {
        self.store().delete_annotations(ids, dry_run)
    }
}

/// Results store selected by the [`StoreFactory`].
#[derive(Debug)]
pub enum ResultsStoreBackend {
    Noop(NoopResultsStore),
    Remote(RemoteResultsStore),
}

impl ResultsStore for ResultsStoreBackend {
    fn store_results(&self, race: &Race) -> StoreResult<()> {
        match self {
            Self::Noop(store) => store.store_results(race),
            Self::Remote(store) => store.store_results(race),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use benchmark_metrics::{ConfigError, StoreError, testutil::ManualClock};

    use super::*;
    use crate::{config::DatastoreConfig, testutil::FakeDatastore};

    fn remote_config() -> ReportingConfig {
        let datastore = DatastoreConfig::builder().host("metrics.example.org").build().unwrap();
        ReportingConfig { settings: StoreSettings::default(), datastore: DatastoreSelection::Remote(datastore) }
    }

    #[test]
    fn test_in_memory_selects_local_backends() {
        let factory = StoreFactory::new(ReportingConfig::default()).unwrap();
        assert!(!factory.is_remote());
        assert!(matches!(factory.metrics_store(Arc::new(ManualClock::default())), MetricsStoreBackend::Local(_)));
        assert!(matches!(factory.race_store(), RaceStoreBackend::File(_)));
        assert!(matches!(factory.results_store(), ResultsStoreBackend::Noop(_)));
    }

    #[test]
    fn test_remote_selects_remote_backends() {
        let factory =
            StoreFactory::with_transport(remote_config(), |_| None, Arc::new(FakeDatastore::new())).unwrap();
        assert!(factory.is_remote());
        assert!(matches!(factory.metrics_store(Arc::new(ManualClock::default())), MetricsStoreBackend::Remote(_)));
        assert!(matches!(factory.race_store(), RaceStoreBackend::Composite(_)));
        assert!(matches!(factory.results_store(), ResultsStoreBackend::Remote(_)));
    }

    #[test]
    fn test_credentials_are_resolved_at_construction() {
        let env = |name: &str| match name {
            crate::config::ENV_USER => Some("bench".to_owned()),
            crate::config::ENV_API_KEY => Some("key".to_owned()),
            _ => None,
        };
        let result = StoreFactory::with_transport(remote_config(), env, Arc::new(FakeDatastore::new()));
        assert!(matches!(result, Err(StoreError::Config(ConfigError::Conflicting { .. }))));
    }
}
