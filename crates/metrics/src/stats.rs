//! Aggregated results of a race.
//!
//! [`GlobalStats`] holds the per-task request metrics and the cluster-wide
//! counters computed at the end of a run; [`SystemStats`] holds the per-node
//! summaries. Both serialize to the nested form persisted with the race and
//! flatten to one document per metric via `as_flat_list`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    percentile::encode_float_key,
    types::{Meta, MetricValue, Percentiles},
};

/// Min, mean, median and max of a metric such as throughput.
///
/// All statistics are `None` when the task produced no normal samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub min: Option<f64>,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub max: Option<f64>,
    pub unit: Option<String>,
}

impl SummaryStats {
    /// Stats without any values, keeping only the unit.
    #[must_use]
    pub fn unit_only(unit: Option<String>) -> Self {
        Self { unit, ..Self::default() }
    }

    #[must_use]
    pub fn has_values(&self) -> bool {
        self.min.is_some() && self.mean.is_some() && self.median.is_some() && self.max.is_some()
    }
}

/// Percentiles of a latency-like metric, keyed by their encoded names
/// (`"99_9"`), plus `mean` and `unit`. Empty when there were no samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LatencyStats(Meta);

impl LatencyStats {
    #[must_use]
    pub fn new(percentiles: &Percentiles, mean: Option<f64>, unit: Option<String>) -> Self {
        let mut fields = Meta::new();
        for (percentile, value) in percentiles.iter() {
            fields.insert(encode_float_key(percentile), json!(value));
        }
        fields.insert("mean".to_owned(), json!(mean));
        fields.insert("unit".to_owned(), json!(unit));
        Self(fields)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of one percentile, e.g. `percentile(99.9)`.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        self.0.get(&encode_float_key(percentile)).and_then(Value::as_f64)
    }

    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        self.0.get("mean").and_then(Value::as_f64)
    }

    #[must_use]
    pub fn unit(&self) -> Option<&str> {
        self.0.get("unit").and_then(Value::as_str)
    }

    #[must_use]
    pub fn as_map(&self) -> &Meta {
        &self.0
    }
}

/// Request metrics of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpMetrics {
    pub task: String,
    pub operation: String,
    pub throughput: SummaryStats,
    pub latency: LatencyStats,
    pub service_time: LatencyStats,
    pub processing_time: LatencyStats,
    pub error_rate: f64,
    /// Relative time of the task's last `service_time` sample in ms.
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Distribution of a per-shard counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStats {
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub unit: Option<String>,
}

/// Processing time statistics of one ML job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlProcessingTime {
    pub job: String,
    pub min: f64,
    pub mean: f64,
    pub median: f64,
    pub max: f64,
    pub unit: Option<String>,
}

/// A transform counter of one transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformMetric {
    pub id: String,
    pub mean: f64,
    pub unit: Option<String>,
}

/// Disk usage of one field of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub index: String,
    pub field: String,
    pub value: f64,
    pub unit: Option<String>,
}

/// Results of a race: per-task request metrics and cluster counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalStats {
    pub op_metrics: Vec<OpMetrics>,

    pub total_time: Option<f64>,
    pub total_time_per_shard: Option<ShardStats>,
    pub indexing_throttle_time: Option<f64>,
    pub indexing_throttle_time_per_shard: Option<ShardStats>,
    pub merge_time: Option<f64>,
    pub merge_time_per_shard: Option<ShardStats>,
    pub merge_count: Option<f64>,
    pub refresh_time: Option<f64>,
    pub refresh_time_per_shard: Option<ShardStats>,
    pub refresh_count: Option<f64>,
    pub flush_time: Option<f64>,
    pub flush_time_per_shard: Option<ShardStats>,
    pub flush_count: Option<f64>,
    pub merge_throttle_time: Option<f64>,
    pub merge_throttle_time_per_shard: Option<ShardStats>,
    pub ml_processing_time: Vec<MlProcessingTime>,

    pub young_gc_time: Option<f64>,
    pub young_gc_count: Option<f64>,
    pub old_gc_time: Option<f64>,
    pub old_gc_count: Option<f64>,
    pub zgc_cycles_gc_time: Option<f64>,
    pub zgc_cycles_gc_count: Option<f64>,
    pub zgc_pauses_gc_time: Option<f64>,
    pub zgc_pauses_gc_count: Option<f64>,

    pub memory_segments: Option<f64>,
    pub memory_doc_values: Option<f64>,
    pub memory_terms: Option<f64>,
    pub memory_norms: Option<f64>,
    pub memory_points: Option<f64>,
    pub memory_stored_fields: Option<f64>,
    pub dataset_size: Option<f64>,
    pub store_size: Option<f64>,
    pub translog_size: Option<f64>,
    pub segment_count: Option<u64>,

    pub total_transform_search_times: Vec<TransformMetric>,
    pub total_transform_index_times: Vec<TransformMetric>,
    pub total_transform_processing_times: Vec<TransformMetric>,
    pub total_transform_throughput: Vec<TransformMetric>,

    pub ingest_pipeline_cluster_count: Option<f64>,
    pub ingest_pipeline_cluster_time: Option<f64>,
    pub ingest_pipeline_cluster_failed: Option<f64>,

    pub disk_usage_total: Vec<DiskUsage>,
    pub disk_usage_inverted_index: Vec<DiskUsage>,
    pub disk_usage_stored_fields: Vec<DiskUsage>,
    pub disk_usage_doc_values: Vec<DiskUsage>,
    pub disk_usage_points: Vec<DiskUsage>,
    pub disk_usage_norms: Vec<DiskUsage>,
    pub disk_usage_term_vectors: Vec<DiskUsage>,
}

fn document(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Meta {
    entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

fn single(value: impl Serialize) -> Value {
    json!({ "single": value })
}

impl GlobalStats {
    /// Appends the metrics of one task. Empty meta is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn add_op_metrics(
        &mut self,
        task: impl Into<String>,
        operation: impl Into<String>,
        throughput: SummaryStats,
        latency: LatencyStats,
        service_time: LatencyStats,
        processing_time: LatencyStats,
        error_rate: f64,
        duration: Option<u64>,
        meta: Meta,
    ) {
        self.op_metrics.push(OpMetrics {
            task: task.into(),
            operation: operation.into(),
            throughput,
            latency,
            service_time,
            processing_time,
            error_rate,
            duration,
            meta: (!meta.is_empty()).then_some(meta),
        });
    }

    /// Names of all tasks with request metrics, in insertion order.
    #[must_use]
    pub fn tasks(&self) -> Vec<&str> {
        self.op_metrics.iter().map(|m| m.task.as_str()).collect()
    }

    /// Request metrics of a task.
    #[must_use]
    pub fn metrics(&self, task: &str) -> Option<&OpMetrics> {
        self.op_metrics.iter().find(|m| m.task == task)
    }

    fn scalars(&self) -> [(&'static str, Option<f64>); 29] {
        [
            ("total_time", self.total_time),
            ("indexing_throttle_time", self.indexing_throttle_time),
            ("merge_time", self.merge_time),
            ("merge_count", self.merge_count),
            ("refresh_time", self.refresh_time),
            ("refresh_count", self.refresh_count),
            ("flush_time", self.flush_time),
            ("flush_count", self.flush_count),
            ("merge_throttle_time", self.merge_throttle_time),
            ("young_gc_time", self.young_gc_time),
            ("young_gc_count", self.young_gc_count),
            ("old_gc_time", self.old_gc_time),
            ("old_gc_count", self.old_gc_count),
            ("zgc_cycles_gc_time", self.zgc_cycles_gc_time),
            ("zgc_cycles_gc_count", self.zgc_cycles_gc_count),
            ("zgc_pauses_gc_time", self.zgc_pauses_gc_time),
            ("zgc_pauses_gc_count", self.zgc_pauses_gc_count),
            ("memory_segments", self.memory_segments),
            ("memory_doc_values", self.memory_doc_values),
            ("memory_terms", self.memory_terms),
            ("memory_norms", self.memory_norms),
            ("memory_points", self.memory_points),
            ("memory_stored_fields", self.memory_stored_fields),
            ("dataset_size", self.dataset_size),
            ("store_size", self.store_size),
            ("translog_size", self.translog_size),
            ("ingest_pipeline_cluster_count", self.ingest_pipeline_cluster_count),
            ("ingest_pipeline_cluster_time", self.ingest_pipeline_cluster_time),
            ("ingest_pipeline_cluster_failed", self.ingest_pipeline_cluster_failed),
        ]
    }

    fn per_shard(&self) -> [(&'static str, &Option<ShardStats>); 6] {
        [
            ("total_time_per_shard", &self.total_time_per_shard),
            ("indexing_throttle_time_per_shard", &self.indexing_throttle_time_per_shard),
            ("merge_time_per_shard", &self.merge_time_per_shard),
            ("refresh_time_per_shard", &self.refresh_time_per_shard),
            ("flush_time_per_shard", &self.flush_time_per_shard),
            ("merge_throttle_time_per_shard", &self.merge_throttle_time_per_shard),
        ]
    }

    fn transforms(&self) -> [(&'static str, &[TransformMetric]); 4] {
        [
            ("total_transform_search_times", &self.total_transform_search_times),
            ("total_transform_index_times", &self.total_transform_index_times),
            ("total_transform_processing_times", &self.total_transform_processing_times),
            ("total_transform_throughput", &self.total_transform_throughput),
        ]
    }

    fn disk_usage(&self) -> [(&'static str, &[DiskUsage]); 7] {
        [
            ("disk_usage_total", &self.disk_usage_total),
            ("disk_usage_inverted_index", &self.disk_usage_inverted_index),
            ("disk_usage_stored_fields", &self.disk_usage_stored_fields),
            ("disk_usage_doc_values", &self.disk_usage_doc_values),
            ("disk_usage_points", &self.disk_usage_points),
            ("disk_usage_norms", &self.disk_usage_norms),
            ("disk_usage_term_vectors", &self.disk_usage_term_vectors),
        ]
    }

    /// One document per metric, stably sorted by metric name.
    ///
    /// Request metrics carry `task` and `operation` (and `meta` when
    /// present); per-job, per-transform and per-field metrics carry their
    /// identifying keys. Scalars are wrapped as `{"single": value}`.
    #[must_use]
    pub fn as_flat_list(&self) -> Vec<Meta> {
        let mut all = Vec::new();

        for item in &self.op_metrics {
            let op_doc = |name: &'static str, value: Value| {
                let mut doc = document([
                    ("task", json!(item.task)),
                    ("operation", json!(item.operation)),
                    ("name", json!(name)),
                    ("value", value),
                ]);
                if let Some(meta) = &item.meta {
                    doc.insert("meta".to_owned(), Value::Object(meta.clone()));
                }
                doc
            };
            all.push(op_doc("throughput", json!(item.throughput)));
            all.push(op_doc("latency", Value::Object(item.latency.as_map().clone())));
            all.push(op_doc("service_time", Value::Object(item.service_time.as_map().clone())));
            all.push(op_doc("processing_time", Value::Object(item.processing_time.as_map().clone())));
            all.push(op_doc("error_rate", single(item.error_rate)));
            all.push(op_doc("duration", single(item.duration)));
        }

        for (name, value) in self.scalars() {
            if let Some(value) = value {
                all.push(document([("name", json!(name)), ("value", single(value))]));
            }
        }
        if let Some(count) = self.segment_count {
            all.push(document([("name", json!("segment_count")), ("value", single(count))]));
        }

        for (name, stats) in self.per_shard() {
            if let Some(stats) = stats {
                all.push(document([("name", json!(name)), ("value", json!(stats))]));
            }
        }

        for job in &self.ml_processing_time {
            all.push(document([
                ("job", json!(job.job)),
                ("name", json!("ml_processing_time")),
                (
                    "value",
                    json!({"min": job.min, "mean": job.mean, "median": job.median, "max": job.max}),
                ),
            ]));
        }

        for (name, transforms) in self.transforms() {
            for transform in transforms {
                all.push(document([
                    ("id", json!(transform.id)),
                    ("name", json!(name)),
                    ("value", single(transform.mean)),
                ]));
            }
        }

        for (name, usages) in self.disk_usage() {
            for usage in usages {
                all.push(document([
                    ("index", json!(usage.index)),
                    ("field", json!(usage.field)),
                    ("name", json!(name)),
                    ("value", single(usage.value)),
                ]));
            }
        }

        all.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        all
    }
}

fn name_of(doc: &Meta) -> &str {
    doc.get("name").and_then(Value::as_str).unwrap_or_default()
}

/// A summary value of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetric {
    pub node: String,
    pub name: String,
    pub value: MetricValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Per-node summaries such as final index size or startup time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemStats {
    pub node_metrics: Vec<NodeMetric>,
}

impl SystemStats {
    pub fn add_node_metrics(
        &mut self,
        node: impl Into<String>,
        name: impl Into<String>,
        value: MetricValue,
        unit: Option<String>,
    ) {
        self.node_metrics.push(NodeMetric {
            node: node.into(),
            name: name.into(),
            value,
            unit: unit.filter(|u| !u.is_empty()),
        });
    }

    /// One `{node, name, value: {single}}` document per metric, sorted by name.
    #[must_use]
    pub fn as_flat_list(&self) -> Vec<Meta> {
        let mut all: Vec<Meta> = self
            .node_metrics
            .iter()
            .map(|m| {
                document([
                    ("node", json!(m.node)),
                    ("name", json!(m.name)),
                    ("value", json!({ "single": m.value.to_json() })),
                ])
            })
            .collect();
        all.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        all
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn latency() -> LatencyStats {
        LatencyStats::new(
            &Percentiles::new(vec![(50.0, 10.0), (100.0, 20.0)]),
            Some(12.0),
            Some("ms".into()),
        )
    }

    fn stats_with_task() -> GlobalStats {
        let mut stats = GlobalStats::default();
        let mut meta = Meta::new();
        meta.insert("tag".into(), json!("a"));
        stats.add_op_metrics(
            "index-append",
            "bulk",
            SummaryStats {
                min: Some(1.0),
                mean: Some(2.0),
                median: Some(2.0),
                max: Some(3.0),
                unit: Some("docs/s".into()),
            },
            latency(),
            latency(),
            LatencyStats::default(),
            0.0,
            Some(1500),
            meta,
        );
        stats
    }

    #[test]
    fn test_latency_stats_keys() {
        let latency = latency();
        assert_eq!(latency.percentile(50.0), Some(10.0));
        assert_eq!(latency.mean(), Some(12.0));
        assert_eq!(latency.unit(), Some("ms"));
        let keys: Vec<&String> = latency.as_map().keys().collect();
        assert!(keys.iter().any(|k| k.as_str() == "100_0"));
        assert_eq!(serde_json::to_value(LatencyStats::default()).unwrap(), json!({}));
    }

    #[test]
    fn test_tasks_and_metrics_lookup() {
        let stats = stats_with_task();
        assert_eq!(stats.tasks(), vec!["index-append"]);
        assert_eq!(stats.metrics("index-append").unwrap().operation, "bulk");
        assert!(stats.metrics("missing").is_none());
    }

    #[test]
    fn test_flat_list_of_op_metrics() {
        let flat = stats_with_task().as_flat_list();
        let names: Vec<&str> = flat.iter().map(name_of).collect();
        assert_eq!(
            names,
            vec!["duration", "error_rate", "latency", "processing_time", "service_time", "throughput"]
        );
        let duration = &flat[0];
        assert_eq!(duration["value"], json!({"single": 1500}));
        assert_eq!(duration["task"], json!("index-append"));
        assert_eq!(duration["meta"], json!({"tag": "a"}));
        assert_eq!(flat[3]["value"], json!({}));
    }

    #[test]
    fn test_flat_list_of_cluster_metrics() {
        let mut stats = GlobalStats {
            total_time: Some(120.0),
            segment_count: Some(7),
            merge_time_per_shard: Some(ShardStats { min: 1.0, median: 2.0, max: 3.0, unit: None }),
            ..GlobalStats::default()
        };
        stats.ml_processing_time.push(MlProcessingTime {
            job: "job-1".into(),
            min: 1.0,
            mean: 2.0,
            median: 2.0,
            max: 3.0,
            unit: Some("ms".into()),
        });
        stats.total_transform_throughput.push(TransformMetric {
            id: "t1".into(),
            mean: 4.5,
            unit: None,
        });
        stats.disk_usage_total.push(DiskUsage {
            index: "logs".into(),
            field: "message".into(),
            value: 1024.0,
            unit: Some("byte".into()),
        });

        let flat = stats.as_flat_list();
        let names: Vec<&str> = flat.iter().map(name_of).collect();
        assert_eq!(
            names,
            vec![
                "disk_usage_total",
                "merge_time_per_shard",
                "ml_processing_time",
                "segment_count",
                "total_time",
                "total_transform_throughput",
            ]
        );
        assert_eq!(flat[0]["field"], json!("message"));
        assert_eq!(flat[1]["value"]["median"], json!(2.0));
        assert_eq!(flat[2]["value"], json!({"min": 1.0, "mean": 2.0, "median": 2.0, "max": 3.0}));
        assert_eq!(flat[3]["value"], json!({"single": 7}));
        assert_eq!(flat[5]["id"], json!("t1"));
    }

    #[test]
    fn test_global_stats_roundtrip_through_json() {
        let stats = stats_with_task();
        let restored: GlobalStats =
            serde_json::from_value(serde_json::to_value(&stats).unwrap()).unwrap();
        assert_eq!(restored, stats);
    }

    #[test]
    fn test_system_stats_flat_list_sorted() {
        let mut stats = SystemStats::default();
        stats.add_node_metrics("n0", "startup_time", MetricValue::from(3.2), Some("s".into()));
        stats.add_node_metrics("n0", "index_size", MetricValue::from(2048.0), None);
        let flat = stats.as_flat_list();
        assert_eq!(flat[0]["name"], json!("index_size"));
        assert_eq!(flat[1]["value"], json!({"single": 3.2}));
        assert_eq!(stats.node_metrics[1].unit, None);
    }
}
