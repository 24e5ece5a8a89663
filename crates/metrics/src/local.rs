//! In-process metrics store.
//!
//! [`LocalMetricsStore`] keeps every record in an in-memory sequence and
//! answers queries by scanning it. Percentiles are computed exactly with
//! [`percentile_value`](crate::percentile::percentile_value).
//!
//! The buffered records can be moved to another process: a worker calls
//! [`to_externalizable`](MetricsStore::to_externalizable) and the
//! coordinator restores them with [`bulk_add`](MetricsStore::bulk_add).
//! The blob is the JSON-encoded record sequence compressed with zstd.
//!
//! # Example
//!
//! ```
//! use benchmark_metrics::{LocalMetricsStore, MetricsStore, OpenContext, Query, Sample};
//!
//! let mut store = LocalMetricsStore::default();
//! store.open(OpenContext::builder().race_id("r1").race_timestamp(chrono::Utc::now()).build(), true)?;
//! store.put_value_cluster_level(Sample::builder().name("service_time").value(10.0).build())?;
//! store.close()?;
//!
//! let stats = store.get_stats(&Query::metric("service_time"))?.expect("one record");
//! assert_eq!(stats.count, 1);
//! # Ok::<(), benchmark_metrics::StoreError>(())
//! ```

use std::{io::Read, sync::Arc};

use bytes::Bytes;
use fail::fail_point;
use serde_json::Value;

use crate::{
    clock::{Clock, SystemClock},
    config::StoreSettings,
    error::{StoreError, StoreResult},
    meta::MetaInfo,
    percentile::percentile_value,
    store::{MetricsStore, SERVICE_TIME, StoreCore, error_rate, requested_percentiles},
    types::{MetricRecord, OpenContext, Percentiles, Query, SampleType, SortField, SortKey, Stats},
};

const ZSTD_LEVEL: i32 = 3;

/// Metrics store that keeps all records in memory.
#[derive(Debug)]
pub struct LocalMetricsStore {
    core: StoreCore,
    records: Vec<MetricRecord>,
}

impl LocalMetricsStore {
    #[must_use]
    pub fn new(settings: StoreSettings, clock: Arc<dyn Clock>) -> Self {
        Self { core: StoreCore::new(settings, clock), records: Vec::new() }
    }

    /// Creates a store that starts from previously captured meta info.
    #[must_use]
    pub fn with_meta_info(settings: StoreSettings, clock: Arc<dyn Clock>, meta_info: MetaInfo) -> Self {
        Self { core: StoreCore::new(settings, clock).with_meta_info(meta_info), records: Vec::new() }
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Buffered records in insertion order.
    #[must_use]
    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    /// Records of the bound race that match the query.
    fn matching<'a>(
        &'a self,
        context: &'a OpenContext,
        query: &'a Query,
    ) -> impl Iterator<Item = &'a MetricRecord> + 'a {
        self.records.iter().filter(move |r| r.race_id == context.race_id && query.matches(r))
    }

    fn sorted_values(&self, context: &OpenContext, query: &Query) -> Vec<f64> {
        let mut values: Vec<f64> =
            self.matching(context, query).filter_map(MetricRecord::number).collect();
        values.sort_by(f64::total_cmp);
        values
    }
}

impl Default for LocalMetricsStore {
    fn default() -> Self {
        Self::new(StoreSettings::default(), Arc::new(SystemClock::new()))
    }
}

/// Encodes records as the externalizable blob.
pub(crate) fn encode_records(records: &[MetricRecord]) -> StoreResult<Bytes> {
    let json = serde_json::to_vec(records)
        .map_err(|e| StoreError::serialization_with_source("failed to encode metrics records", e))?;
    let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
        .map_err(|e| StoreError::serialization_with_source("failed to compress metrics records", e))?;
    tracing::debug!(
        raw_bytes = json.len(),
        compressed_bytes = compressed.len(),
        "compressed externalized metrics records",
    );
    Ok(Bytes::from(compressed))
}

/// Decodes a blob produced by [`encode_records`].
pub(crate) fn decode_records(blob: &[u8]) -> StoreResult<Vec<MetricRecord>> {
    let mut json = Vec::new();
    zstd::stream::read::Decoder::new(blob)
        .and_then(|mut decoder| decoder.read_to_end(&mut json))
        .map_err(|e| StoreError::serialization_with_source("failed to decompress metrics records", e))?;
    serde_json::from_slice(&json)
        .map_err(|e| StoreError::serialization_with_source("failed to decode metrics records", e))
}

fn sort_value(record: &MetricRecord, field: SortField) -> f64 {
    match field {
        SortField::RelativeTime => record.relative_time as f64,
        SortField::Timestamp => record.timestamp as f64,
        SortField::Value => record.number().unwrap_or(f64::NEG_INFINITY),
    }
}

impl MetricsStore for LocalMetricsStore {
    fn core(&self) -> &StoreCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StoreCore {
        &mut self.core
    }

    #[tracing::instrument(skip(self, context), fields(race_id = %context.race_id))]
    fn open(&mut self, context: OpenContext, _create: bool) -> StoreResult<()> {
        self.core.open(context)
    }

    fn flush(&mut self, _refresh: bool) -> StoreResult<()> {
        Ok(())
    }

    fn add(&mut self, record: MetricRecord) -> StoreResult<()> {
        self.records.push(record);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn to_externalizable(&mut self, clear: bool) -> StoreResult<Option<Bytes>> {
        fail_point!("local-externalize", |_| Err(StoreError::serialization("injected failure")));
        if self.records.is_empty() {
            return Ok(None);
        }
        let blob = encode_records(&self.records)?;
        if clear {
            self.records.clear();
        }
        Ok(Some(blob))
    }

    fn get_raw(&self, query: &Query) -> StoreResult<Vec<MetricRecord>> {
        let context = self.core.require_bound("get")?;
        Ok(self.matching(context, query).cloned().collect())
    }

    fn get_one(&self, query: &Query, sort: Option<SortKey>) -> StoreResult<Option<MetricRecord>> {
        let context = self.core.require_bound("get_one")?;
        let mut candidates: Vec<&MetricRecord> = self.matching(context, query).collect();
        if let Some(key) = sort {
            candidates.sort_by(|a, b| {
                let ordering = sort_value(a, key.field).total_cmp(&sort_value(b, key.field));
                if key.descending { ordering.reverse() } else { ordering }
            });
        }
        Ok(candidates.first().map(|r| (*r).clone()))
    }

    #[tracing::instrument(skip(self))]
    fn get_error_rate(
        &self,
        task: &str,
        operation_type: Option<&str>,
        sample_type: Option<SampleType>,
    ) -> StoreResult<f64> {
        let context = self.core.require_bound("get_error_rate")?;
        let query = Query::metric(SERVICE_TIME)
            .task(task)
            .maybe_operation_type(operation_type)
            .maybe_sample_type(sample_type);
        let (errors, successes) = self.matching(context, &query).fold((0u64, 0u64), |(e, s), r| {
            if r.meta_value("success") == Some(&Value::Bool(false)) { (e + 1, s) } else { (e, s + 1) }
        });
        Ok(error_rate(errors, successes))
    }

    fn get_stats(&self, query: &Query) -> StoreResult<Option<Stats>> {
        let context = self.core.require_bound("get_stats")?;
        let values = self.sorted_values(context, query);
        let (Some(&min), Some(&max)) = (values.first(), values.last()) else {
            return Ok(None);
        };
        let sum: f64 = values.iter().sum();
        Ok(Some(Stats { count: values.len() as u64, min, max, avg: sum / values.len() as f64, sum }))
    }

    fn get_percentiles(
        &self,
        query: &Query,
        percentiles: Option<&[f64]>,
    ) -> StoreResult<Option<Percentiles>> {
        let context = self.core.require_bound("get_percentiles")?;
        let values = self.sorted_values(context, query);
        if values.is_empty() {
            return Ok(None);
        }
        let entries = requested_percentiles(percentiles)
            .iter()
            .filter_map(|&p| percentile_value(&values, p).map(|v| (p, v)))
            .collect();
        Ok(Some(Percentiles::new(entries)))
    }
}
