//! Shared test utilities for the remote stores.
//!
//! [`FakeDatastore`] is an in-process [`Transport`] that keeps indices and
//! templates in memory and evaluates the subset of the query language the
//! stores issue:
//!
//! - `bool` with `filter`, `must`, `must_not` and `should` clauses
//! - `term` on dotted field paths, `exists`, `range` with `basic_date` support, `match_all`
//! - `sort`, `size` and `track_total_hits`
//! - `terms`, `stats` and `percentiles` aggregations
//!
//! Failures are scripted per transport method with
//! [`fail_next`](FakeDatastore::fail_next); every call is counted.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! benchmark-metrics-remote = { path = "../metrics-remote", features = ["testutil"] }
//! ```

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use benchmark_metrics::{
    BulkItemFailure, Endpoint, Meta, StoreSettings, percentile::percentile_value,
    testutil::ManualClock,
};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{Value, json};

use crate::{
    config::RetryPolicy,
    error::{TransportError, TransportResult},
    remote_store::RemoteMetricsStore,
    resilient::{ResilientClient, Sleeper},
    templates::TemplateProvider,
    transport::{Hit, Hits, SearchResponse, TotalHits, Transport},
};

/// Default `size` of a search request.
const DEFAULT_SEARCH_SIZE: usize = 10;

/// [`Sleeper`] that records requested waits instead of blocking.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Every wait requested so far, in order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
    }
}

#[derive(Debug, Clone)]
struct StoredDoc {
    id: String,
    source: Meta,
}

#[derive(Debug, Default)]
struct FakeState {
    templates: BTreeMap<String, Value>,
    indices: BTreeMap<String, Vec<StoredDoc>>,
    failures: HashMap<&'static str, VecDeque<TransportError>>,
    calls: HashMap<&'static str, usize>,
    next_id: u64,
}

impl FakeState {
    fn generate_id(&mut self) -> String {
        self.next_id += 1;
        format!("doc-{}", self.next_id)
    }

    fn matching_indices(&self, pattern: &str) -> Vec<String> {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.indices.keys().filter(|name| name.starts_with(prefix)).cloned().collect(),
            None => self.indices.keys().filter(|name| *name == pattern).cloned().collect(),
        }
    }
}

fn index_not_found(index: &str) -> TransportError {
    TransportError::Api { status: 404, reason: format!("index_not_found_exception: [{index}]") }
}

/// In-memory datastore for tests.
#[derive(Debug)]
pub struct FakeDatastore {
    endpoint: Endpoint,
    state: Mutex<FakeState>,
}

impl Default for FakeDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDatastore {
    #[must_use]
    pub fn new() -> Self {
        Self { endpoint: Endpoint::new("fake-datastore", 9200), state: Mutex::new(FakeState::default()) }
    }

    /// Makes the next calls of `method` fail with `errors`, one per call.
    pub fn fail_next(&self, method: &'static str, errors: impl IntoIterator<Item = TransportError>) {
        self.state.lock().failures.entry(method).or_default().extend(errors);
    }

    /// Number of calls of `method`, including failed ones.
    #[must_use]
    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// Sources of the documents in `index`, in insertion order.
    #[must_use]
    pub fn documents(&self, index: &str) -> Vec<Meta> {
        self.state
            .lock()
            .indices
            .get(index)
            .map(|docs| docs.iter().map(|d| d.source.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of all indices.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.state.lock().indices.keys().cloned().collect()
    }

    fn begin(&self, method: &'static str) -> TransportResult<MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock();
        *state.calls.entry(method).or_default() += 1;
        if let Some(error) = state.failures.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(state)
    }
}

impl Transport for FakeDatastore {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn get_template(&self, name: &str) -> TransportResult<Option<Value>> {
        Ok(self.begin("get_template")?.templates.get(name).cloned())
    }

    fn put_template(&self, name: &str, template: &Value) -> TransportResult<()> {
        self.begin("put_template")?.templates.insert(name.to_owned(), template.clone());
        Ok(())
    }

    fn index_exists(&self, index: &str) -> TransportResult<bool> {
        Ok(self.begin("index_exists")?.indices.contains_key(index))
    }

    fn create_index(&self, index: &str) -> TransportResult<()> {
        self.begin("create_index")?.indices.entry(index.to_owned()).or_default();
        Ok(())
    }

    fn refresh(&self, index: &str) -> TransportResult<()> {
        let state = self.begin("refresh")?;
        if state.matching_indices(index).is_empty() && !index.ends_with('*') {
            return Err(index_not_found(index));
        }
        Ok(())
    }

    fn bulk_index(&self, index: &str, docs: &[Value]) -> TransportResult<()> {
        let mut state = self.begin("bulk_index")?;
        let mut failures = Vec::new();
        let mut accepted = Vec::new();
        for doc in docs {
            match doc.as_object() {
                Some(source) => accepted.push(source.clone()),
                None => failures.push(BulkItemFailure {
                    status: 400,
                    error_type: "mapper_parsing_exception".into(),
                    reason: Some("document is not an object".into()),
                }),
            }
        }
        for source in accepted {
            let id = state.generate_id();
            state.indices.entry(index.to_owned()).or_default().push(StoredDoc { id, source });
        }
        if failures.is_empty() { Ok(()) } else { Err(TransportError::Bulk { items: failures }) }
    }

    fn index_doc(&self, index: &str, id: Option<&str>, doc: &Value) -> TransportResult<()> {
        let mut state = self.begin("index_doc")?;
        let source = doc
            .as_object()
            .cloned()
            .ok_or_else(|| TransportError::Api { status: 400, reason: "mapper_parsing_exception".into() })?;
        let id = match id {
            Some(id) => id.to_owned(),
            None => state.generate_id(),
        };
        let docs = state.indices.entry(index.to_owned()).or_default();
        docs.retain(|d| d.id != id);
        docs.push(StoredDoc { id, source });
        Ok(())
    }

    fn search(&self, index: &str, body: &Value) -> TransportResult<SearchResponse> {
        let state = self.begin("search")?;
        let names = state.matching_indices(index);
        if names.is_empty() && !index.ends_with('*') {
            return Err(index_not_found(index));
        }
        let query = body.get("query").cloned().unwrap_or_else(|| json!({"match_all": {}}));
        let mut matched: Vec<StoredDoc> = names
            .iter()
            .filter_map(|name| state.indices.get(name))
            .flatten()
            .filter(|doc| matches(&query, &doc.source))
            .cloned()
            .collect();
        drop(state);

        if let Some(sort) = body.get("sort") {
            let keys = sort_keys(sort);
            matched.sort_by(|a, b| compare_docs(&keys, &a.source, &b.source));
        }
        let mut aggregations = Meta::new();
        if let Some(aggs) = body.get("aggs").and_then(Value::as_object) {
            for (name, clause) in aggs {
                aggregations.insert(name.clone(), aggregate(clause, &matched));
            }
        }
        let size = body
            .get("size")
            .and_then(Value::as_u64)
            .and_then(|s| usize::try_from(s).ok())
            .unwrap_or(DEFAULT_SEARCH_SIZE);
        let total = matched.len() as u64;
        let hits = matched
            .into_iter()
            .take(size)
            .map(|doc| Hit { id: doc.id, source: doc.source })
            .collect();
        Ok(SearchResponse { hits: Hits { total: TotalHits { value: total }, hits }, aggregations })
    }

    fn delete_by_query(&self, index: &str, body: &Value) -> TransportResult<u64> {
        let mut state = self.begin("delete_by_query")?;
        let query = body.get("query").cloned().unwrap_or_else(|| json!({"match_all": {}}));
        let mut deleted = 0u64;
        for name in state.matching_indices(index) {
            if let Some(docs) = state.indices.get_mut(&name) {
                let before = docs.len();
                docs.retain(|doc| !matches(&query, &doc.source));
                deleted += (before - docs.len()) as u64;
            }
        }
        Ok(deleted)
    }

    fn delete(&self, index: &str, id: &str) -> TransportResult<bool> {
        let mut state = self.begin("delete")?;
        let Some(docs) = state.indices.get_mut(index) else {
            return Ok(false);
        };
        let before = docs.len();
        docs.retain(|doc| doc.id != id);
        Ok(docs.len() < before)
    }
}

// ============================================================================
// Query evaluation
// ============================================================================

fn lookup<'a>(doc: &'a Meta, path: &str) -> Option<&'a Value> {
    if let Some(value) = doc.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn clauses(clause: &Value, key: &str) -> Vec<Value> {
    match clause.get(key) {
        Some(Value::Array(items)) => items.clone(),
        Some(item @ Value::Object(_)) => vec![item.clone()],
        _ => Vec::new(),
    }
}

fn matches(query: &Value, doc: &Meta) -> bool {
    let Some(query) = query.as_object() else {
        return true;
    };
    query.iter().all(|(kind, clause)| match kind.as_str() {
        "bool" => {
            let required = clauses(clause, "filter").into_iter().chain(clauses(clause, "must"));
            let should = clauses(clause, "should");
            required.into_iter().all(|c| matches(&c, doc))
                && clauses(clause, "must_not").iter().all(|c| !matches(c, doc))
                && (should.is_empty() || should.iter().any(|c| matches(c, doc)))
        },
        "exists" => clause
            .get("field")
            .and_then(Value::as_str)
            .and_then(|field| lookup(doc, field))
            .is_some_and(|value| !value.is_null()),
        "term" => clause.as_object().is_some_and(|fields| {
            fields.iter().all(|(field, expected)| {
                let expected = expected.get("value").unwrap_or(expected);
                lookup(doc, field).is_some_and(|actual| term_equals(actual, expected))
            })
        }),
        "range" => clause.as_object().is_some_and(|fields| {
            fields.iter().all(|(field, bounds)| {
                lookup(doc, field).is_some_and(|actual| in_range(actual, bounds))
            })
        }),
        "match_all" => true,
        _ => false,
    })
}

fn term_equals(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(items), _) => items.iter().any(|item| term_equals(item, expected)),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

fn in_range(actual: &Value, bounds: &Value) -> bool {
    let basic_date = bounds.get("format").and_then(Value::as_str) == Some("basic_date");
    let check = |op: &str, accept: fn(Ordering) -> bool| match bounds.get(op) {
        None | Some(Value::Null) => true,
        Some(bound) => {
            let ordering = if basic_date {
                match (actual.as_str(), bound.as_str()) {
                    (Some(a), Some(b)) => Some(a.get(..8).unwrap_or(a).cmp(b)),
                    _ => None,
                }
            } else {
                compare_values(actual, bound)
            };
            ordering.is_some_and(accept)
        },
    };
    check("gte", |o| o != Ordering::Less)
        && check("gt", |o| o == Ordering::Greater)
        && check("lte", |o| o != Ordering::Greater)
        && check("lt", |o| o == Ordering::Less)
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => Some(a.as_f64()?.total_cmp(&b.as_f64()?)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn sort_keys(sort: &Value) -> Vec<(String, bool)> {
    let entries = match sort {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let mut keys = Vec::new();
    for entry in entries {
        match entry {
            Value::String(field) => keys.push((field, false)),
            Value::Object(map) => {
                for (field, order) in map {
                    let order = order.get("order").unwrap_or(&order).as_str().unwrap_or("asc");
                    keys.push((field, order == "desc"));
                }
            },
            _ => {},
        }
    }
    keys
}

fn compare_docs(keys: &[(String, bool)], a: &Meta, b: &Meta) -> Ordering {
    for (field, descending) in keys {
        let ordering = match (lookup(a, field), lookup(b, field)) {
            (Some(x), Some(y)) => {
                let ordering = compare_values(x, y).unwrap_or(Ordering::Equal);
                if *descending { ordering.reverse() } else { ordering }
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

// ============================================================================
// Aggregations
// ============================================================================

fn numbers(field: &str, docs: &[StoredDoc]) -> Vec<f64> {
    let mut values: Vec<f64> =
        docs.iter().filter_map(|d| lookup(&d.source, field).and_then(Value::as_f64)).collect();
    values.sort_by(f64::total_cmp);
    values
}

fn aggregate(clause: &Value, docs: &[StoredDoc]) -> Value {
    let field_of = |agg: &Value| agg.get("field").and_then(Value::as_str).unwrap_or("value").to_owned();
    if let Some(terms) = clause.get("terms") {
        let field = field_of(terms);
        let mut buckets: Vec<(Value, u64)> = Vec::new();
        for doc in docs {
            let Some(value) = lookup(&doc.source, &field) else { continue };
            match buckets.iter_mut().find(|(key, _)| key == value) {
                Some((_, count)) => *count += 1,
                None => buckets.push((value.clone(), 1)),
            }
        }
        buckets.sort_by(|a, b| b.1.cmp(&a.1));
        let buckets: Vec<Value> = buckets
            .into_iter()
            .map(|(key, doc_count)| match key {
                Value::Bool(flag) => {
                    json!({"key": u8::from(flag), "key_as_string": flag.to_string(), "doc_count": doc_count})
                },
                other => json!({"key": other, "doc_count": doc_count}),
            })
            .collect();
        return json!({"buckets": buckets});
    }
    if let Some(stats) = clause.get("stats") {
        let values = numbers(&field_of(stats), docs);
        let count = values.len();
        let sum: f64 = values.iter().sum();
        return if count == 0 {
            json!({"count": 0, "min": null, "max": null, "avg": null, "sum": 0.0})
        } else {
            json!({
                "count": count,
                "min": values.first(),
                "max": values.last(),
                "avg": sum / count as f64,
                "sum": sum,
            })
        };
    }
    if let Some(percentiles) = clause.get("percentiles") {
        let values = numbers(&field_of(percentiles), docs);
        let mut out = Meta::new();
        for percent in percentiles.get("percents").and_then(Value::as_array).into_iter().flatten() {
            if let Some(p) = percent.as_f64() {
                out.insert(format!("{p:?}"), json!(percentile_value(&values, p)));
            }
        }
        return json!({"values": out});
    }
    Value::Null
}

// ============================================================================
// Factories
// ============================================================================

/// A client over `fake` whose waits are recorded by `sleeper`.
#[must_use]
pub fn resilient_client(fake: &Arc<FakeDatastore>, sleeper: &Arc<RecordingSleeper>) -> ResilientClient {
    ResilientClient::new(fake.clone(), RetryPolicy::default()).with_sleeper(sleeper.clone())
}

/// An unopened remote metrics store over `fake` on a [`ManualClock`].
#[must_use]
pub fn remote_store(fake: &Arc<FakeDatastore>) -> RemoteMetricsStore {
    let client = resilient_client(fake, &Arc::new(RecordingSleeper::default()));
    RemoteMetricsStore::new(
        StoreSettings::default(),
        Arc::new(ManualClock::default()),
        client,
        TemplateProvider::default(),
        false,
    )
}
