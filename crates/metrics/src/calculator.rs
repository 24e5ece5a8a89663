//! Aggregation of recorded metrics into race results.
//!
//! [`GlobalStatsCalculator`] reads a closed metrics store back and produces
//! the [`GlobalStats`] of a challenge: request metrics for every reported
//! task plus the cluster counters. [`SystemStatsCalculator`] produces the
//! per-node summaries. Both only use the query API of [`MetricsStore`], so
//! they work the same on every backend.

use serde_json::Value;

use crate::{
    error::StoreResult,
    percentile::percentiles_for_sample_size,
    schedule::{Challenge, Task, Track},
    stats::{
        DiskUsage, GlobalStats, LatencyStats, MlProcessingTime, ShardStats, SummaryStats,
        SystemStats, TransformMetric,
    },
    store::{MetricsStore, SERVICE_TIME},
    types::{Meta, MetricRecord, Query, SampleType, SortField, SortKey},
};

/// Computes the [`GlobalStats`] of a challenge.
pub fn calculate_results<S: MetricsStore + ?Sized>(
    store: &S,
    track: &Track,
    challenge: &Challenge,
) -> StoreResult<GlobalStats> {
    GlobalStatsCalculator::new(store, track, challenge).calculate()
}

/// Computes the [`SystemStats`] of one node.
pub fn calculate_system_results<S: MetricsStore + ?Sized>(
    store: &S,
    node_name: &str,
) -> StoreResult<SystemStats> {
    SystemStatsCalculator::new(store, node_name).calculate()
}

/// Aggregates the request metrics and cluster counters of a challenge.
#[derive(Debug)]
pub struct GlobalStatsCalculator<'a, S: ?Sized> {
    store: &'a S,
    track: &'a Track,
    challenge: &'a Challenge,
}

impl<'a, S: MetricsStore + ?Sized> GlobalStatsCalculator<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, track: &'a Track, challenge: &'a Challenge) -> Self {
        Self { store, track, challenge }
    }

    /// Runs the aggregation.
    ///
    /// # Errors
    ///
    /// Propagates any query failure of the store.
    #[tracing::instrument(skip(self), fields(challenge = %self.challenge.name))]
    pub fn calculate(&self) -> StoreResult<GlobalStats> {
        let mut result = GlobalStats::default();

        for task in self.challenge.tasks() {
            let name = task.name.as_str();
            let op_type = task.operation.operation_type.as_str();
            let error_rate =
                self.store.get_error_rate(name, Some(op_type), Some(SampleType::Normal))?;
            if !task.operation.include_in_reporting && error_rate <= 0.0 {
                continue;
            }
            tracing::debug!(task = name, "gathering request metrics");
            result.add_op_metrics(
                name,
                task.operation.name.as_str(),
                self.summary_stats("throughput", name, op_type)?,
                self.single_latency("latency", name, op_type)?,
                self.single_latency(SERVICE_TIME, name, op_type)?,
                self.single_latency("processing_time", name, op_type)?,
                error_rate,
                self.duration(name)?,
                self.task_meta(task),
            );
        }

        tracing::debug!("gathering indexing metrics");
        result.total_time = self.sum("indexing_total_time")?;
        result.total_time_per_shard = self.shard_stats("indexing_total_time")?;
        result.indexing_throttle_time = self.sum("indexing_throttle_time")?;
        result.indexing_throttle_time_per_shard = self.shard_stats("indexing_throttle_time")?;
        result.merge_time = self.sum("merges_total_time")?;
        result.merge_time_per_shard = self.shard_stats("merges_total_time")?;
        result.merge_count = self.sum("merges_total_count")?;
        result.refresh_time = self.sum("refresh_total_time")?;
        result.refresh_time_per_shard = self.shard_stats("refresh_total_time")?;
        result.refresh_count = self.sum("refresh_total_count")?;
        result.flush_time = self.sum("flush_total_time")?;
        result.flush_time_per_shard = self.shard_stats("flush_total_time")?;
        result.flush_count = self.sum("flush_total_count")?;
        result.merge_throttle_time = self.sum("merges_total_throttled_time")?;
        result.merge_throttle_time_per_shard = self.shard_stats("merges_total_throttled_time")?;

        result.ml_processing_time = self.ml_processing_time()?;

        tracing::debug!("gathering garbage collection metrics");
        result.young_gc_time = self.sum("node_total_young_gen_gc_time")?;
        result.young_gc_count = self.sum("node_total_young_gen_gc_count")?;
        result.old_gc_time = self.sum("node_total_old_gen_gc_time")?;
        result.old_gc_count = self.sum("node_total_old_gen_gc_count")?;
        result.zgc_cycles_gc_time = self.sum("node_total_zgc_cycles_gc_time")?;
        result.zgc_cycles_gc_count = self.sum("node_total_zgc_cycles_gc_count")?;
        result.zgc_pauses_gc_time = self.sum("node_total_zgc_pauses_gc_time")?;
        result.zgc_pauses_gc_count = self.sum("node_total_zgc_pauses_gc_count")?;

        tracing::debug!("gathering segment memory metrics");
        result.memory_segments = self.median("segments_memory_in_bytes")?;
        result.memory_doc_values = self.median("segments_doc_values_memory_in_bytes")?;
        result.memory_terms = self.median("segments_terms_memory_in_bytes")?;
        result.memory_norms = self.median("segments_norms_memory_in_bytes")?;
        result.memory_points = self.median("segments_points_memory_in_bytes")?;
        result.memory_stored_fields = self.median("segments_stored_fields_memory_in_bytes")?;
        result.dataset_size = self.sum("dataset_size_in_bytes")?;
        result.store_size = self.sum("store_size_in_bytes")?;
        result.translog_size = self.sum("translog_size_in_bytes")?;
        // fractional segment counts are meaningless
        result.segment_count = self.median("segments_count")?.map(|m| m as u64);

        tracing::debug!("gathering transform metrics");
        result.total_transform_processing_times =
            self.transform_metric("total_transform_processing_time")?;
        result.total_transform_index_times = self.transform_metric("total_transform_index_time")?;
        result.total_transform_search_times = self.transform_metric("total_transform_search_time")?;
        result.total_transform_throughput = self.transform_metric("total_transform_throughput")?;

        result.ingest_pipeline_cluster_count = self.sum("ingest_pipeline_cluster_count")?;
        result.ingest_pipeline_cluster_time = self.sum("ingest_pipeline_cluster_time")?;
        result.ingest_pipeline_cluster_failed = self.sum("ingest_pipeline_cluster_failed")?;

        tracing::debug!("gathering disk usage metrics");
        result.disk_usage_total = self.disk_usage("disk_usage_total")?;
        result.disk_usage_inverted_index = self.disk_usage("disk_usage_inverted_index")?;
        result.disk_usage_stored_fields = self.disk_usage("disk_usage_stored_fields")?;
        result.disk_usage_doc_values = self.disk_usage("disk_usage_doc_values")?;
        result.disk_usage_points = self.disk_usage("disk_usage_points")?;
        result.disk_usage_norms = self.disk_usage("disk_usage_norms")?;
        result.disk_usage_term_vectors = self.disk_usage("disk_usage_term_vectors")?;

        Ok(result)
    }

    fn task_meta(&self, task: &Task) -> Meta {
        let mut meta = self.track.meta_data.clone();
        meta.extend(self.challenge.meta_data.clone());
        meta.extend(task.operation.meta_data.clone());
        meta.extend(task.meta_data.clone());
        meta
    }

    fn task_query(name: &str, task: &str, op_type: &str) -> Query {
        Query::metric(name).task(task).operation_type(op_type)
    }

    fn summary_stats(&self, name: &str, task: &str, op_type: &str) -> StoreResult<SummaryStats> {
        let query = Self::task_query(name, task, op_type);
        let normal = query.clone().sample_type(SampleType::Normal);
        let unit = self.store.get_unit(&query)?;
        let mean = self.store.get_mean(&normal)?;
        let median = self.store.get_median(&normal)?;
        let stats = self.store.get_stats(&normal)?;
        Ok(match (mean, median, stats) {
            (Some(mean), Some(median), Some(stats)) => SummaryStats {
                min: Some(stats.min),
                mean: Some(mean),
                median: Some(median),
                max: Some(stats.max),
                unit,
            },
            _ => SummaryStats::unit_only(unit),
        })
    }

    fn single_latency(&self, name: &str, task: &str, op_type: &str) -> StoreResult<LatencyStats> {
        let query = Self::task_query(name, task, op_type);
        let normal = query.clone().sample_type(SampleType::Normal);
        let sample_size = self.store.get_stats(&normal)?.map_or(0, |s| s.count);
        if sample_size == 0 {
            return Ok(LatencyStats::default());
        }
        let Some(percentiles) =
            self.store.get_percentiles(&normal, Some(percentiles_for_sample_size(sample_size)))?
        else {
            return Ok(LatencyStats::default());
        };
        let mean = self.store.get_mean(&normal)?;
        let unit = self.store.get_unit(&query)?;
        Ok(LatencyStats::new(&percentiles, mean, unit))
    }

    fn duration(&self, task: &str) -> StoreResult<Option<u64>> {
        let last = self.store.get_one(
            &Query::metric(SERVICE_TIME).task(task),
            Some(SortKey::descending(SortField::RelativeTime)),
        )?;
        Ok(last.map(|r| r.relative_time))
    }

    fn sum(&self, name: &str) -> StoreResult<Option<f64>> {
        let values: Vec<f64> =
            self.store.get(&Query::metric(name))?.iter().filter_map(|v| v.as_f64()).collect();
        Ok((!values.is_empty()).then(|| values.iter().sum()))
    }

    fn median(&self, name: &str) -> StoreResult<Option<f64>> {
        self.store.get_median(&Query::metric(name))
    }

    fn shard_stats(&self, name: &str) -> StoreResult<Option<ShardStats>> {
        let query = Query::metric(name);
        let mut values: Vec<f64> = self
            .store
            .get_raw(&query)?
            .iter()
            .filter_map(|r| r.extra.get("per-shard").and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_f64)
            .collect();
        if values.is_empty() {
            return Ok(None);
        }
        values.sort_by(f64::total_cmp);
        let unit = self.store.get_unit(&query)?;
        Ok(Some(ShardStats {
            min: values[0],
            median: middle_value(&values),
            max: values[values.len() - 1],
            unit,
        }))
    }

    fn ml_processing_time(&self) -> StoreResult<Vec<MlProcessingTime>> {
        let records = self.store.get_raw(&Query::metric("ml_processing_time"))?;
        Ok(records
            .iter()
            .filter_map(|r| {
                let number = |key: &str| r.extra.get(key).and_then(Value::as_f64);
                let job = r.extra.get("job").and_then(Value::as_str);
                match (job, number("min"), number("mean"), number("median"), number("max")) {
                    (Some(job), Some(min), Some(mean), Some(median), Some(max)) => {
                        Some(MlProcessingTime {
                            job: job.to_owned(),
                            min,
                            mean,
                            median,
                            max,
                            unit: r.unit.clone(),
                        })
                    },
                    _ => {
                        tracing::warn!("skipping incomplete ml_processing_time record");
                        None
                    },
                }
            })
            .collect())
    }

    fn transform_metric(&self, name: &str) -> StoreResult<Vec<TransformMetric>> {
        let records = self.store.get_raw(&Query::metric(name))?;
        Ok(records
            .iter()
            .filter_map(|r| {
                let id = r.meta_value("transform_id").map(label)?;
                Some(TransformMetric { id, mean: r.number()?, unit: r.unit.clone() })
            })
            .collect())
    }

    fn disk_usage(&self, name: &str) -> StoreResult<Vec<DiskUsage>> {
        let records = self.store.get_raw(&Query::metric(name))?;
        Ok(records
            .iter()
            .filter_map(|r: &MetricRecord| {
                let index = r.meta_value("index").map(label)?;
                let field = r.meta_value("field").map(label)?;
                Some(DiskUsage { index, field, value: r.number()?, unit: r.unit.clone() })
            })
            .collect())
    }
}

/// Median of sorted values; the mean of the two middle values for an even count.
fn middle_value(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 { (sorted[mid - 1] + sorted[mid]) / 2.0 } else { sorted[mid] }
}

fn label(value: &Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), str::to_owned)
}

/// Summarizes the node-level values of one node.
#[derive(Debug)]
pub struct SystemStatsCalculator<'a, S: ?Sized> {
    store: &'a S,
    node_name: &'a str,
}

impl<'a, S: MetricsStore + ?Sized> SystemStatsCalculator<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, node_name: &'a str) -> Self {
        Self { store, node_name }
    }

    /// Runs the aggregation; metrics without a record are left out.
    ///
    /// # Errors
    ///
    /// Propagates any query failure of the store.
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    pub fn calculate(&self) -> StoreResult<SystemStats> {
        let mut result = SystemStats::default();
        self.add(&mut result, "final_index_size_bytes", "index_size")?;
        self.add(&mut result, "disk_io_write_bytes", "bytes_written")?;
        self.add(&mut result, "node_startup_time", "startup_time")?;
        Ok(result)
    }

    fn add(&self, result: &mut SystemStats, metric: &str, summary_name: &str) -> StoreResult<()> {
        let query = Query::metric(metric).node(self.node_name);
        match self.store.get_one(&query, None)?.and_then(|r| r.value) {
            Some(value) => {
                let unit = self.store.get_unit(&query)?;
                result.add_node_metrics(self.node_name, summary_name, value, unit);
            },
            None => tracing::debug!(metric, "skipping incomplete record"),
        }
        Ok(())
    }
}
