//! Metrics store backed by a remote datastore.
//!
//! Records are buffered in memory and only leave the process on
//! [`flush`](MetricsStore::flush), as one chunked bulk write through the
//! [`ResilientClient`]. Records that were never flushed are lost if the
//! process dies.
//!
//! Each run writes into one index, `benchmark-metrics-YYYY-MM`, picked from
//! the race timestamp. Opening for writing reconciles the metrics template
//! and creates the index; opening for reading prefers a migrated
//! `<index>.new` when one exists. The index is resolved once per `open`.

use std::{sync::Arc, time::Instant};

use benchmark_metrics::{
    Clock, Meta, MetricRecord, MetricsStore, OpenContext, Percentiles, Query, SampleType, SortKey,
    Stats, StoreCore, StoreError, StoreResult, StoreSettings,
    store::{SERVICE_TIME, error_rate, requested_percentiles},
};
use bytes::Bytes;
use fail::fail_point;
use serde_json::{Value, json};

use crate::{
    resilient::ResilientClient,
    templates::{TemplateKind, TemplateProvider, migrated_index_name, reconcile},
    transport::SearchResponse,
};

/// Documents per bulk request.
pub const BULK_CHUNK_SIZE: usize = 5000;

/// Maximum number of hits a raw query returns.
pub const MAX_QUERY_SIZE: usize = 10_000;

/// Metrics store that persists records into a remote datastore.
#[derive(Debug)]
pub struct RemoteMetricsStore {
    core: StoreCore,
    client: ResilientClient,
    templates: TemplateProvider,
    overwrite_templates: bool,
    index: Option<String>,
    docs: Vec<Value>,
}

impl RemoteMetricsStore {
    #[must_use]
    pub fn new(
        settings: StoreSettings,
        clock: Arc<dyn Clock>,
        client: ResilientClient,
        templates: TemplateProvider,
        overwrite_templates: bool,
    ) -> Self {
        Self {
            core: StoreCore::new(settings, clock),
            client,
            templates,
            overwrite_templates,
            index: None,
            docs: Vec::new(),
        }
    }

    /// Index resolved by the last `open`.
    #[must_use]
    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    /// Number of records waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.docs.len()
    }

    fn bound_index(&self, operation: &'static str) -> StoreResult<(&OpenContext, &str)> {
        let context = self.core.require_bound(operation)?;
        let index = self.index.as_deref().ok_or(StoreError::not_open(operation))?;
        Ok((context, index))
    }

    fn search(&self, operation: &'static str, body: &Value) -> StoreResult<SearchResponse> {
        let (_, index) = self.bound_index(operation)?;
        tracing::debug!(index, query = %body, "issuing metrics query");
        self.client.execute(operation, |t| t.search(index, body))
    }

    /// Bool filter ANDing the race id with every criterion of `query`.
    fn filter(&self, context: &OpenContext, query: &Query) -> Value {
        let mut filters = vec![
            json!({"term": {"race-id": context.race_id}}),
            json!({"term": {"name": query.name}}),
        ];
        if let Some(task) = &query.task {
            filters.push(json!({"term": {"task": task}}));
        }
        if let Some(operation_type) = &query.operation_type {
            filters.push(json!({"term": {"operation-type": operation_type}}));
        }
        if let Some(sample_type) = query.sample_type {
            filters.push(json!({"term": {"sample-type": sample_type.as_str()}}));
        }
        if let Some(node_name) = &query.node_name {
            filters.push(json!({"term": {"meta.node_name": node_name}}));
        }
        json!({"bool": {"filter": filters}})
    }

    fn query_body(&self, operation: &'static str, query: &Query) -> StoreResult<Value> {
        let (context, _) = self.bound_index(operation)?;
        Ok(json!({"query": self.filter(context, query)}))
    }
}

fn decode_record(source: Meta) -> StoreResult<MetricRecord> {
    serde_json::from_value(Value::Object(source))
        .map_err(|e| StoreError::serialization_with_source("failed to decode metrics record", e))
}

fn stats_from(aggregation: &Value) -> Option<Stats> {
    let count = aggregation.get("count").and_then(Value::as_u64)?;
    if count == 0 {
        return None;
    }
    let field = |name: &str| aggregation.get(name).and_then(Value::as_f64);
    Some(Stats { count, min: field("min")?, max: field("max")?, avg: field("avg")?, sum: field("sum")? })
}

impl MetricsStore for RemoteMetricsStore {
    fn core(&self) -> &StoreCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StoreCore {
        &mut self.core
    }

    #[tracing::instrument(skip(self, context), fields(race_id = %context.race_id))]
    fn open(&mut self, context: OpenContext, create: bool) -> StoreResult<()> {
        context.validate()?;
        if !self.docs.is_empty() {
            tracing::warn!(
                discarded = self.docs.len(),
                index = ?self.index,
                "discarding metrics records that were never flushed",
            );
            self.docs.clear();
        }
        let mut index = TemplateKind::Metrics.index_name(&context.race_timestamp);
        if create {
            reconcile(&self.client, &self.templates, TemplateKind::Metrics, self.overwrite_templates)?;
            if !self.client.execute("index_exists", |t| t.index_exists(&index))? {
                tracing::info!(index = %index, "creating metrics index");
                self.client.execute("create_index", |t| t.create_index(&index))?;
            }
        } else {
            let migrated = migrated_index_name(&index);
            if self.client.execute("index_exists", |t| t.index_exists(&migrated))? {
                tracing::info!(index = %migrated, "reading metrics from migrated index");
                index = migrated;
            }
        }
        self.client.execute("refresh", |t| t.refresh(&index))?;
        self.core.open(context)?;
        self.index = Some(index);
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(pending = self.docs.len()))]
    fn flush(&mut self, refresh: bool) -> StoreResult<()> {
        if self.docs.is_empty() && !refresh {
            return Ok(());
        }
        let index = self.index.clone().ok_or(StoreError::not_open("flush"))?;
        if !self.docs.is_empty() {
            fail_point!("remote-flush-before-bulk", |_| Err(StoreError::Transport {
                operation: "bulk_index".into(),
                endpoint: self.client.endpoint(),
                message: "injected failure".into(),
            }));
            let started = Instant::now();
            for chunk in self.docs.chunks(BULK_CHUNK_SIZE) {
                self.client.execute("bulk_index", |t| t.bulk_index(&index, chunk))?;
            }
            tracing::info!(
                index = %index,
                docs = self.docs.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "flushed metrics records",
            );
            self.docs.clear();
        }
        if refresh {
            self.client.execute("refresh", |t| t.refresh(&index))?;
        }
        Ok(())
    }

    fn add(&mut self, record: MetricRecord) -> StoreResult<()> {
        let doc = serde_json::to_value(&record)
            .map_err(|e| StoreError::serialization_with_source("failed to encode metrics record", e))?;
        self.docs.push(doc);
        Ok(())
    }

    fn to_externalizable(&mut self, _clear: bool) -> StoreResult<Option<Bytes>> {
        Ok(None)
    }

    #[tracing::instrument(skip(self), fields(name = %query.name))]
    fn get_raw(&self, query: &Query) -> StoreResult<Vec<MetricRecord>> {
        let mut body = self.query_body("get", query)?;
        body["size"] = json!(MAX_QUERY_SIZE);
        body["track_total_hits"] = json!(true);
        let response = self.search("get", &body)?;
        let returned = response.hits.hits.len() as u64;
        if response.total() != returned {
            tracing::warn!(
                total = response.total(),
                returned,
                name = %query.name,
                "metrics query returned fewer hits than matched",
            );
        }
        response.hits.hits.into_iter().map(|hit| decode_record(hit.source)).collect()
    }

    fn get_one(&self, query: &Query, sort: Option<SortKey>) -> StoreResult<Option<MetricRecord>> {
        let mut body = self.query_body("get_one", query)?;
        body["size"] = json!(1);
        if let Some(key) = sort {
            let order = if key.descending { "desc" } else { "asc" };
            let mut sort = Meta::new();
            sort.insert(key.field.as_str().to_owned(), json!({"order": order}));
            body["sort"] = json!([sort]);
        }
        let response = self.search("get_one", &body)?;
        response.hits.hits.into_iter().next().map(|hit| decode_record(hit.source)).transpose()
    }

    #[tracing::instrument(skip(self))]
    fn get_error_rate(
        &self,
        task: &str,
        operation_type: Option<&str>,
        sample_type: Option<SampleType>,
    ) -> StoreResult<f64> {
        let query = Query::metric(SERVICE_TIME)
            .task(task)
            .maybe_operation_type(operation_type)
            .maybe_sample_type(sample_type);
        let mut body = self.query_body("get_error_rate", &query)?;
        body["size"] = json!(0);
        body["aggs"] = json!({"error_rate": {"terms": {"field": "meta.success"}}});
        let response = self.search("get_error_rate", &body)?;

        let (mut errors, mut successes) = (0u64, 0u64);
        let buckets = response
            .aggregation("error_rate")
            .and_then(|agg| agg.get("buckets"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for bucket in buckets {
            let count = bucket.get("doc_count").and_then(Value::as_u64).unwrap_or(0);
            let key = bucket.get("key_as_string").or_else(|| bucket.get("key"));
            match key.and_then(Value::as_str) {
                Some("true") => successes += count,
                Some("false") => errors += count,
                _ => tracing::warn!(bucket = %bucket, task, "ignoring unrecognized error rate bucket"),
            }
        }
        Ok(error_rate(errors, successes))
    }

    fn get_stats(&self, query: &Query) -> StoreResult<Option<Stats>> {
        let mut body = self.query_body("get_stats", query)?;
        body["size"] = json!(0);
        body["aggs"] = json!({"metric_stats": {"stats": {"field": "value"}}});
        let response = self.search("get_stats", &body)?;
        Ok(response.aggregation("metric_stats").and_then(stats_from))
    }

    fn get_percentiles(
        &self,
        query: &Query,
        percentiles: Option<&[f64]>,
    ) -> StoreResult<Option<Percentiles>> {
        let percents = requested_percentiles(percentiles);
        let mut body = self.query_body("get_percentiles", query)?;
        body["size"] = json!(0);
        body["aggs"] = json!({
            "percentile_stats": {"percentiles": {"field": "value", "percents": percents}},
        });
        let response = self.search("get_percentiles", &body)?;
        if response.total() == 0 {
            return Ok(None);
        }
        let values = response
            .aggregation("percentile_stats")
            .and_then(|agg| agg.get("values"))
            .and_then(Value::as_object)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|(key, value)| Some((key.parse::<f64>().ok()?, value.as_f64()?)))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(Some(Percentiles::new(values)))
    }
}
