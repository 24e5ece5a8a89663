//! The metrics store abstraction.
//!
//! [`MetricsStore`] is the per-race recording and query API. Backends share
//! the run bookkeeping in [`StoreCore`] and implement a small set of
//! required methods: [`add`](MetricsStore::add) for raw ingestion,
//! [`flush`](MetricsStore::flush), and the query primitives. Everything
//! else (value/doc writes, unit/median/mean lookups, meta handling) is
//! provided on top of them.
//!
//! # Lifecycle
//!
//! ```text
//! open ──► put_value_* / put_doc ──► flush* ──► close ──► get_* (read back)
//!   ▲                                                        │
//!   └──────────────── open (next race) ◄─────────────────────┘
//! ```
//!
//! Writes require an open store. Reads require that the store was bound to
//! a race by `open`; they keep working after `close` so statistics can be
//! computed once all records have been flushed.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    clock::{Clock, StopWatch},
    config::StoreSettings,
    error::{StoreError, StoreResult},
    meta::MetaInfo,
    percentile::DEFAULT_PERCENTILES,
    types::{
        MetaScope, Meta, MetricRecord, MetricValue, OpenContext, Percentiles, Query, SampleType,
        SortKey, Stats,
    },
};

/// Metric name whose records stand for one attempted operation each.
pub const SERVICE_TIME: &str = "service_time";

/// A value write, see [`MetricsStore::put_value_cluster_level`].
///
/// ```
/// use benchmark_metrics::{Sample, SampleType};
///
/// let sample = Sample::builder()
///     .name("service_time")
///     .value(12.5)
///     .unit("ms")
///     .task("index-append")
///     .sample_type(SampleType::Warmup)
///     .build();
/// assert_eq!(sample.name, "service_time");
/// ```
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct Sample {
    #[builder(into)]
    pub name: String,
    #[builder(into)]
    pub value: MetricValue,
    #[builder(into)]
    pub unit: Option<String>,
    #[builder(into)]
    pub task: Option<String>,
    #[builder(into)]
    pub operation: Option<String>,
    #[builder(into)]
    pub operation_type: Option<String>,
    #[builder(default)]
    pub sample_type: SampleType,
    /// Overrides the clock's current time.
    pub absolute_time: Option<DateTime<Utc>>,
    /// Overrides the stopwatch reading.
    pub relative_time: Option<Duration>,
    /// Merged on top of the scope meta.
    #[builder(default)]
    pub meta: Meta,
}

/// A free-form document write, see [`MetricsStore::put_doc`].
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct Document {
    #[builder(into)]
    pub name: String,
    #[builder(into)]
    pub value: Option<MetricValue>,
    #[builder(into)]
    pub unit: Option<String>,
    /// Additional fields, e.g. `per-shard` or `job`.
    #[builder(default)]
    pub fields: Meta,
    /// Meta scope; documents without a level carry no meta at all.
    pub level: Option<MetaScope>,
    #[builder(into)]
    pub node_name: Option<String>,
    #[builder(default)]
    pub meta: Meta,
    pub absolute_time: Option<DateTime<Utc>>,
    pub relative_time: Option<Duration>,
}

/// Run bookkeeping shared by every backend.
#[derive(Debug)]
pub struct StoreCore {
    settings: StoreSettings,
    clock: Arc<dyn Clock>,
    stop_watch: StopWatch,
    meta_info: MetaInfo,
    context: Option<OpenContext>,
    opened: bool,
}

impl StoreCore {
    #[must_use]
    pub fn new(settings: StoreSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            stop_watch: StopWatch::default(),
            meta_info: MetaInfo::new(),
            context: None,
            opened: false,
        }
    }

    /// Starts from previously captured meta info.
    #[must_use]
    pub fn with_meta_info(mut self, meta_info: MetaInfo) -> Self {
        self.meta_info = meta_info;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    #[must_use]
    pub fn meta_info(&self) -> &MetaInfo {
        &self.meta_info
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened
    }

    #[must_use]
    pub fn context(&self) -> Option<&OpenContext> {
        self.context.as_ref()
    }

    /// Binds the core to a run and starts the relative-time stopwatch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the context has an empty race id.
    pub fn open(&mut self, context: OpenContext) -> StoreResult<()> {
        context.validate()?;
        tracing::info!(
            race_id = %context.race_id,
            race_timestamp = %context.race_timestamp_iso(),
            track = ?context.track,
            challenge = ?context.challenge,
            car = ?context.car,
            "opening metrics store",
        );
        for (key, value) in &self.settings.user_tags {
            self.meta_info.add(MetaScope::Cluster, None, format!("tag_{key}"), value.as_str())?;
        }
        self.stop_watch.start(self.clock.as_ref());
        self.context = Some(context);
        self.opened = true;
        Ok(())
    }

    /// Marks the store closed and drops all meta info. The run binding is
    /// kept so records can still be read back.
    pub fn close(&mut self) {
        self.opened = false;
        self.meta_info.clear();
    }

    pub fn reset_relative_time(&mut self) {
        self.stop_watch.start(self.clock.as_ref());
    }

    /// Adds meta info that applies to every record created afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] for a node scope without a node name.
    pub fn add_meta_info(
        &mut self,
        scope: MetaScope,
        scope_key: Option<&str>,
        key: &str,
        value: Value,
    ) -> StoreResult<()> {
        self.meta_info.add(scope, scope_key, key, value)?;
        Ok(())
    }

    /// Returns the run binding of an open store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store is not open.
    pub fn require_open(&self, operation: &'static str) -> StoreResult<&OpenContext> {
        match (&self.context, self.opened) {
            (Some(context), true) => Ok(context),
            _ => Err(StoreError::not_open(operation)),
        }
    }

    /// Returns the run binding of a store that has been opened at least once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    pub fn require_bound(&self, operation: &'static str) -> StoreResult<&OpenContext> {
        self.context.as_ref().ok_or(StoreError::not_open(operation))
    }

    fn timestamps(
        &self,
        absolute_time: Option<DateTime<Utc>>,
        relative_time: Option<Duration>,
    ) -> (i64, u64) {
        let absolute = absolute_time.unwrap_or_else(|| self.clock.now());
        let relative = relative_time.unwrap_or_else(|| self.stop_watch.split(self.clock.as_ref()));
        (absolute.timestamp_millis(), u64::try_from(relative.as_millis()).unwrap_or(u64::MAX))
    }

    /// Synthesizes the record for a value write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store is not open.
    pub fn value_record(
        &self,
        level: MetaScope,
        node_name: Option<&str>,
        sample: Sample,
    ) -> StoreResult<MetricRecord> {
        let context = self.require_open("put_value")?;
        let mut meta = self.meta_info.snapshot(level, node_name);
        meta.extend(sample.meta);
        let (timestamp, relative_time) = self.timestamps(sample.absolute_time, sample.relative_time);
        let track_params = &self.settings.track_params;

        Ok(MetricRecord {
            timestamp,
            relative_time,
            race_id: context.race_id.clone(),
            race_timestamp: context.race_timestamp_iso(),
            environment: self.settings.environment.clone(),
            track: context.track.clone(),
            challenge: context.challenge.clone(),
            car: context.car_name(),
            name: sample.name,
            value: Some(sample.value),
            unit: sample.unit,
            sample_type: Some(sample.sample_type),
            meta: Some(meta),
            task: sample.task.filter(|t| !t.is_empty()),
            operation: sample.operation.filter(|o| !o.is_empty()),
            operation_type: sample.operation_type.filter(|o| !o.is_empty()),
            track_params: (!track_params.is_empty()).then(|| track_params.clone()),
            extra: Meta::new(),
        })
    }

    /// Synthesizes the record for a free-form document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store is not open.
    pub fn doc_record(&self, doc: Document) -> StoreResult<MetricRecord> {
        let context = self.require_open("put_doc")?;
        let meta = doc.level.map(|level| {
            let mut meta = self.meta_info.snapshot(level, doc.node_name.as_deref());
            meta.extend(doc.meta);
            meta
        });
        let (timestamp, relative_time) = self.timestamps(doc.absolute_time, doc.relative_time);
        let track_params = &self.settings.track_params;

        Ok(MetricRecord {
            timestamp,
            relative_time,
            race_id: context.race_id.clone(),
            race_timestamp: context.race_timestamp_iso(),
            environment: self.settings.environment.clone(),
            track: context.track.clone(),
            challenge: context.challenge.clone(),
            car: context.car_name(),
            name: doc.name,
            value: doc.value,
            unit: doc.unit,
            sample_type: None,
            meta: meta.filter(|m| !m.is_empty()),
            task: None,
            operation: None,
            operation_type: None,
            track_params: (!track_params.is_empty()).then(|| track_params.clone()),
            extra: doc.fields,
        })
    }
}

/// Per-race recording and query API.
///
/// Implementations provide [`core`](Self::core), raw ingestion via
/// [`add`](Self::add), [`flush`](Self::flush), the externalizable
/// representation, and the query primitives. A store is owned by a single
/// writer; it carries no internal locking.
pub trait MetricsStore {
    /// Shared run bookkeeping.
    fn core(&self) -> &StoreCore;

    /// Mutable access to the shared run bookkeeping.
    fn core_mut(&mut self) -> &mut StoreCore;

    /// Binds the store to a run.
    ///
    /// `create` is `true` when the store is opened for writing and backing
    /// collections may need to be created.
    ///
    /// # Errors
    ///
    /// Returns an error if the context is invalid or the backend cannot be
    /// prepared.
    fn open(&mut self, context: OpenContext, create: bool) -> StoreResult<()>;

    /// Persists buffered records.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the records.
    fn flush(&mut self, refresh: bool) -> StoreResult<()>;

    /// Raw ingestion of one record. This is the only backend-specific write.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot accept the record.
    fn add(&mut self, record: MetricRecord) -> StoreResult<()>;

    /// Serializes all buffered records into a compressed blob.
    ///
    /// Returns `None` when the backend has nothing to externalize.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if encoding fails.
    fn to_externalizable(&mut self, clear: bool) -> StoreResult<Option<Bytes>>;

    /// All records matching the query.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get_raw(&self, query: &Query) -> StoreResult<Vec<MetricRecord>>;

    /// First record matching the query under an optional sort order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get_one(&self, query: &Query, sort: Option<SortKey>) -> StoreResult<Option<MetricRecord>>;

    /// Fraction of failed `service_time` records of a task, in `[0.0, 1.0]`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get_error_rate(
        &self,
        task: &str,
        operation_type: Option<&str>,
        sample_type: Option<SampleType>,
    ) -> StoreResult<f64>;

    /// Count, min, max, average and sum of the numeric values, or `None`
    /// when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get_stats(&self, query: &Query) -> StoreResult<Option<Stats>>;

    /// Percentiles of the numeric values, or `None` when nothing matches.
    /// Defaults to [`DEFAULT_PERCENTILES`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get_percentiles(
        &self,
        query: &Query,
        percentiles: Option<&[f64]>,
    ) -> StoreResult<Option<Percentiles>>;

    /// Flushes and closes the store, then clears the meta info.
    ///
    /// The store is closed even if the flush fails; the flush error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store is not open, or the
    /// error of the final flush.
    fn close(&mut self) -> StoreResult<()> {
        self.core().require_open("close")?;
        tracing::info!("closing metrics store");
        let flushed = self.flush(true);
        self.core_mut().close();
        flushed
    }

    /// The run binding established by the last `open`.
    fn open_context(&self) -> Option<&OpenContext> {
        self.core().context()
    }

    /// Re-zeroes the run-relative clock without touching stored records.
    fn reset_relative_time(&mut self) {
        self.core_mut().reset_relative_time();
    }

    /// Adds scope meta info for subsequently created records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] for a node scope without a node name.
    fn add_meta_info(
        &mut self,
        scope: MetaScope,
        scope_key: Option<&str>,
        key: &str,
        value: Value,
    ) -> StoreResult<()> {
        self.core_mut().add_meta_info(scope, scope_key, key, value)
    }

    /// Records a value carrying cluster-level meta.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store is not open.
    fn put_value_cluster_level(&mut self, sample: Sample) -> StoreResult<()> {
        let record = self.core().value_record(MetaScope::Cluster, None, sample)?;
        self.add(record)
    }

    /// Records a value carrying cluster- and node-level meta.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store is not open.
    fn put_value_node_level(&mut self, node_name: &str, sample: Sample) -> StoreResult<()> {
        let record = self.core().value_record(MetaScope::Node, Some(node_name), sample)?;
        self.add(record)
    }

    /// Records a free-form document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store is not open.
    fn put_doc(&mut self, doc: Document) -> StoreResult<()> {
        let record = self.core().doc_record(doc)?;
        self.add(record)
    }

    /// Restores records produced by [`to_externalizable`](Self::to_externalizable),
    /// in their original order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the blob cannot be decoded.
    fn bulk_add(&mut self, blob: &[u8]) -> StoreResult<()> {
        if blob.is_empty() {
            return Ok(());
        }
        tracing::debug!(bytes = blob.len(), "restoring externalized metrics records");
        for record in crate::local::decode_records(blob)? {
            self.add(record)?;
        }
        Ok(())
    }

    /// Values of all records matching the query.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get(&self, query: &Query) -> StoreResult<Vec<MetricValue>> {
        Ok(self.get_raw(query)?.into_iter().filter_map(|r| r.value).collect())
    }

    /// Unit of the first record matching the query, ignoring sample type.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get_unit(&self, query: &Query) -> StoreResult<Option<String>> {
        let query = query.clone().maybe_sample_type(None);
        Ok(self.get_raw(&query)?.into_iter().next().and_then(|r| r.unit))
    }

    /// The 50th percentile, or `None` when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get_median(&self, query: &Query) -> StoreResult<Option<f64>> {
        Ok(self.get_percentiles(query, Some(&[50.0]))?.and_then(|p| p.get(50.0)))
    }

    /// Average of the numeric values, or `None` when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotOpen`] if the store was never opened.
    fn get_mean(&self, query: &Query) -> StoreResult<Option<f64>> {
        Ok(self.get_stats(query)?.map(|s| s.avg))
    }
}

/// Percentile list to use for a request, falling back to the defaults.
#[must_use]
pub fn requested_percentiles(percentiles: Option<&[f64]>) -> &[f64] {
    percentiles.unwrap_or(&DEFAULT_PERCENTILES)
}

/// Error rate from failure and success counts.
///
/// No errors yields exactly `0.0` and no successes yields exactly `1.0`.
#[must_use]
pub fn error_rate(errors: u64, successes: u64) -> f64 {
    if errors == 0 {
        0.0
    } else if successes == 0 {
        1.0
    } else {
        errors as f64 / (errors + successes) as f64
    }
}
