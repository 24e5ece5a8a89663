//! Record model shared by every metrics store backend.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, StoreError, StoreResult};

/// Open-ended, ordered key/value map used for meta data and extra fields.
pub type Meta = serde_json::Map<String, Value>;

/// Timestamp format used for race timestamps in documents (`20240131T101500Z`).
pub const RACE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Formats a timestamp in the compact ISO-8601 form used by race documents.
#[must_use]
pub fn to_iso8601(ts: &DateTime<Utc>) -> String {
    ts.format(RACE_TIMESTAMP_FORMAT).to_string()
}

/// Parses a compact ISO-8601 race timestamp.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if the value is not in
/// `%Y%m%dT%H%M%SZ` form.
pub fn from_iso8601(value: &str) -> StoreResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, RACE_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::serialization_with_source(format!("invalid race timestamp [{value}]"), e))
}

/// Phase of the benchmark in which a sample was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    /// Sample taken while the system under test warms up.
    Warmup = 0,
    /// Sample taken during measurement.
    #[default]
    Normal = 1,
}

impl SampleType {
    /// Lowercase name as stored in records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warmup => "warmup",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applicability of a meta info tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaScope {
    /// Applies to every record of the run.
    Cluster,
    /// Applies to records tagged with one node name.
    Node,
}

impl FromStr for MetaScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(Self::Cluster),
            "node" => Ok(Self::Node),
            other => Err(ConfigError::UnknownScope { scope: other.to_owned() }),
        }
    }
}

/// Value of a metric: a plain number or a structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// A numeric sample.
    Number(f64),
    /// A structured payload, e.g. per-shard or per-job values.
    Structured(Value),
}

impl MetricValue {
    /// Returns the numeric value, if this is a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Structured(_) => None,
        }
    }

    /// Converts the value into a JSON value.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::Structured(v) => v.clone(),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<Value> for MetricValue {
    fn from(value: Value) -> Self {
        match value.as_f64() {
            Some(n) => Self::Number(n),
            None => Self::Structured(value),
        }
    }
}

/// One immutable observation.
///
/// The fixed core is typed; everything a free-form document adds on top
/// (e.g. `per-shard` or `job`) lands in [`extra`](Self::extra).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricRecord {
    /// Absolute time in epoch milliseconds.
    #[serde(rename = "@timestamp")]
    pub timestamp: i64,
    /// Milliseconds since the run-relative stopwatch was started.
    pub relative_time: u64,
    pub race_id: String,
    pub race_timestamp: String,
    pub environment: String,
    pub track: Option<String>,
    pub challenge: Option<String>,
    pub car: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<MetricValue>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_type: Option<SampleType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_params: Option<Meta>,
    /// Additional document fields.
    #[serde(flatten)]
    pub extra: Meta,
}

impl MetricRecord {
    /// Returns a meta value by key.
    #[must_use]
    pub fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta.as_ref().and_then(|m| m.get(key))
    }

    /// Returns the numeric value of this record, if any.
    #[must_use]
    pub fn number(&self) -> Option<f64> {
        self.value.as_ref().and_then(MetricValue::as_f64)
    }
}

/// Binds a store to one run.
#[derive(Debug, Clone, PartialEq, bon::Builder, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OpenContext {
    #[builder(into)]
    pub race_id: String,
    pub race_timestamp: DateTime<Utc>,
    #[builder(into)]
    pub track: Option<String>,
    #[builder(into)]
    pub challenge: Option<String>,
    /// Car names; joined with `+` in records.
    #[builder(default)]
    #[serde(default)]
    pub car: Vec<String>,
}

impl OpenContext {
    /// Car names joined with `+`, or `None` when no car is set.
    #[must_use]
    pub fn car_name(&self) -> Option<String> {
        if self.car.is_empty() { None } else { Some(self.car.join("+")) }
    }

    /// Race timestamp in compact ISO-8601 form.
    #[must_use]
    pub fn race_timestamp_iso(&self) -> String {
        to_iso8601(&self.race_timestamp)
    }

    /// Checks that the context identifies a run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the race id is empty.
    pub fn validate(&self) -> StoreResult<()> {
        if self.race_id.is_empty() {
            return Err(ConfigError::Missing { field: "race id" }.into());
        }
        Ok(())
    }
}

/// Record field a query may sort on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    RelativeTime,
    Timestamp,
    Value,
}

impl SortField {
    /// Field name in the record schema.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelativeTime => "relative-time",
            Self::Timestamp => "@timestamp",
            Self::Value => "value",
        }
    }
}

/// Sort order for [`get_one`](crate::MetricsStore::get_one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

impl SortKey {
    #[must_use]
    pub fn ascending(field: SortField) -> Self {
        Self { field, descending: false }
    }

    #[must_use]
    pub fn descending(field: SortField) -> Self {
        Self { field, descending: true }
    }
}

/// Filter over the records of the open race.
///
/// The race id filter is implicit; every other criterion is optional and
/// ANDed with the rest.
///
/// ```
/// use benchmark_metrics::{Query, SampleType};
///
/// let query = Query::metric("service_time").task("index-append").sample_type(SampleType::Normal);
/// assert_eq!(query.name, "service_time");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub task: Option<String>,
    pub operation_type: Option<String>,
    pub sample_type: Option<SampleType>,
    pub node_name: Option<String>,
}

impl Query {
    /// Matches records with the given metric name.
    #[must_use]
    pub fn metric(name: impl Into<String>) -> Self {
        Self { name: name.into(), task: None, operation_type: None, sample_type: None, node_name: None }
    }

    #[must_use]
    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    #[must_use]
    pub fn maybe_task(mut self, task: Option<&str>) -> Self {
        self.task = task.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    #[must_use]
    pub fn maybe_operation_type(mut self, operation_type: Option<&str>) -> Self {
        self.operation_type = operation_type.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn sample_type(mut self, sample_type: SampleType) -> Self {
        self.sample_type = Some(sample_type);
        self
    }

    #[must_use]
    pub fn maybe_sample_type(mut self, sample_type: Option<SampleType>) -> Self {
        self.sample_type = sample_type;
        self
    }

    #[must_use]
    pub fn node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// Returns `true` if the record satisfies every criterion of this query.
    #[must_use]
    pub fn matches(&self, record: &MetricRecord) -> bool {
        record.name == self.name
            && self.task.as_ref().is_none_or(|t| record.task.as_ref() == Some(t))
            && self
                .operation_type
                .as_ref()
                .is_none_or(|op| record.operation_type.as_ref() == Some(op))
            && self.sample_type.is_none_or(|st| record.sample_type == Some(st))
            && self
                .node_name
                .as_ref()
                .is_none_or(|n| record.meta_value("node_name").and_then(Value::as_str) == Some(n))
    }
}

/// Summary statistics over the numeric values of a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub sum: f64,
}

/// Percentile values in ascending percentile order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Percentiles(Vec<(f64, f64)>);

impl Percentiles {
    /// Creates a new set from `(percentile, value)` pairs, sorted by percentile.
    #[must_use]
    pub fn new(mut entries: Vec<(f64, f64)>) -> Self {
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self(entries)
    }

    /// Value at the given percentile, if it was computed.
    #[must_use]
    pub fn get(&self, percentile: f64) -> Option<f64> {
        self.0.iter().find(|(p, _)| *p == percentile).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn record(name: &str) -> MetricRecord {
        MetricRecord {
            timestamp: 1_000,
            relative_time: 10,
            race_id: "race-1".into(),
            race_timestamp: "20240131T101500Z".into(),
            environment: "local".into(),
            track: Some("geonames".into()),
            challenge: None,
            car: Some("defaults".into()),
            name: name.into(),
            value: Some(MetricValue::Number(1.0)),
            unit: Some("ms".into()),
            sample_type: Some(SampleType::Normal),
            meta: None,
            task: Some("index".into()),
            operation: None,
            operation_type: Some("bulk".into()),
            track_params: None,
            extra: Meta::new(),
        }
    }

    #[test]
    fn test_iso8601_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 31, 10, 15, 0).unwrap();
        assert_eq!(to_iso8601(&ts), "20240131T101500Z");
        assert_eq!(from_iso8601("20240131T101500Z").unwrap(), ts);
        assert!(from_iso8601("2024-01-31").is_err());
    }

    #[test]
    fn test_sample_type_serializes_lowercase() {
        assert_eq!(serde_json::to_value(SampleType::Warmup).unwrap(), json!("warmup"));
        assert!(SampleType::Warmup < SampleType::Normal);
    }

    #[test]
    fn test_meta_scope_parse() {
        assert_eq!("node".parse::<MetaScope>().unwrap(), MetaScope::Node);
        assert_eq!(
            "rack".parse::<MetaScope>(),
            Err(ConfigError::UnknownScope { scope: "rack".into() })
        );
    }

    #[test]
    fn test_metric_value_from_json_normalizes_numbers() {
        assert_eq!(MetricValue::from(json!(5)), MetricValue::Number(5.0));
        assert_eq!(MetricValue::from(json!([1, 2])), MetricValue::Structured(json!([1, 2])));
    }

    #[test]
    fn test_record_schema_field_names() {
        let mut r = record("latency");
        r.extra.insert("per-shard".into(), json!([1, 2]));
        let doc = serde_json::to_value(&r).unwrap();
        assert_eq!(doc["@timestamp"], json!(1_000));
        assert_eq!(doc["relative-time"], json!(10));
        assert_eq!(doc["race-id"], json!("race-1"));
        assert_eq!(doc["sample-type"], json!("normal"));
        assert_eq!(doc["operation-type"], json!("bulk"));
        assert_eq!(doc["per-shard"], json!([1, 2]));
        assert!(doc.get("operation").is_none());

        let back: MetricRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_query_matches_optional_filters() {
        let r = record("latency");
        assert!(Query::metric("latency").matches(&r));
        assert!(Query::metric("latency").task("index").operation_type("bulk").matches(&r));
        assert!(!Query::metric("latency").task("search").matches(&r));
        assert!(!Query::metric("latency").sample_type(SampleType::Warmup).matches(&r));
        assert!(!Query::metric("service_time").matches(&r));
        assert!(!Query::metric("latency").node("node-0").matches(&r));
    }

    #[test]
    fn test_query_matches_node_name_in_meta() {
        let mut r = record("cpu");
        let mut meta = Meta::new();
        meta.insert("node_name".into(), json!("node-0"));
        r.meta = Some(meta);
        assert!(Query::metric("cpu").node("node-0").matches(&r));
        assert!(!Query::metric("cpu").node("node-1").matches(&r));
    }

    #[test]
    fn test_open_context_car_name() {
        let ctx = OpenContext::builder()
            .race_id("r")
            .race_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .car(vec!["4gheap".into(), "trial-license".into()])
            .build();
        assert_eq!(ctx.car_name().as_deref(), Some("4gheap+trial-license"));

        let no_car = OpenContext::builder()
            .race_id("r")
            .race_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .build();
        assert_eq!(no_car.car_name(), None);
    }

    #[test]
    fn test_percentiles_sorted_lookup() {
        let p = Percentiles::new(vec![(100.0, 9.0), (50.0, 5.0), (99.9, 8.5)]);
        let keys: Vec<f64> = p.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![50.0, 99.9, 100.0]);
        assert_eq!(p.get(99.9), Some(8.5));
        assert_eq!(p.get(90.0), None);
    }
}
