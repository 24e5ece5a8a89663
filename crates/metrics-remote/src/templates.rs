//! Index templates, index naming and template reconciliation.
//!
//! The datastore keeps one composable index template per document kind.
//! The bundled templates live in `resources/` and are embedded at compile
//! time; configured shard and replica counts override
//! `template.settings.index`.
//!
//! Metrics, races and results are written into monthly indices named after
//! the race timestamp (`benchmark-metrics-2024-03`), so one run always
//! lands in exactly one index no matter how long it takes. Annotations use
//! a single fixed index.

use std::{collections::BTreeMap, fmt};

use benchmark_metrics::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{config::ResolvedDatastore, resilient::ResilientClient};

/// Kind of document a template and its indices are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    Metrics,
    Races,
    Results,
    Annotations,
}

impl TemplateKind {
    /// Name of the index template.
    #[must_use]
    pub fn template_name(self) -> &'static str {
        match self {
            Self::Metrics => "benchmark-metrics",
            Self::Races => "benchmark-races",
            Self::Results => "benchmark-results",
            Self::Annotations => "benchmark-annotations",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Self::Metrics => include_str!("../resources/metrics-template.json"),
            Self::Races => include_str!("../resources/races-template.json"),
            Self::Results => include_str!("../resources/results-template.json"),
            Self::Annotations => include_str!("../resources/annotations-template.json"),
        }
    }

    /// Index that holds the documents of a race started at `race_timestamp`.
    #[must_use]
    pub fn index_name(self, race_timestamp: &DateTime<Utc>) -> String {
        match self {
            Self::Annotations => self.template_name().to_owned(),
            _ => format!("{}-{}", self.template_name(), race_timestamp.format("%Y-%m")),
        }
    }

    /// Pattern matching every index of this kind.
    #[must_use]
    pub fn index_pattern(self) -> String {
        match self {
            Self::Annotations => self.template_name().to_owned(),
            _ => format!("{}-*", self.template_name()),
        }
    }
}

/// Name of the index that replaces `index` after a migration.
#[must_use]
pub fn migrated_index_name(index: &str) -> String {
    format!("{index}.new")
}

/// Bundled templates with configured shard and replica overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateProvider {
    number_of_shards: Option<u32>,
    number_of_replicas: Option<u32>,
}

impl TemplateProvider {
    #[must_use]
    pub fn new(number_of_shards: Option<u32>, number_of_replicas: Option<u32>) -> Self {
        Self { number_of_shards, number_of_replicas }
    }

    #[must_use]
    pub fn from_datastore(datastore: &ResolvedDatastore) -> Self {
        Self::new(datastore.number_of_shards(), datastore.number_of_replicas())
    }

    /// The full template document for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the bundled template is
    /// malformed.
    pub fn template(&self, kind: TemplateKind) -> StoreResult<Value> {
        let mut template: Value = serde_json::from_str(kind.source()).map_err(|e| {
            StoreError::serialization_with_source(
                format!("invalid bundled template [{}]", kind.template_name()),
                e,
            )
        })?;
        let index_settings = template
            .pointer_mut("/template/settings/index")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                StoreError::serialization(format!(
                    "bundled template [{}] has no index settings",
                    kind.template_name()
                ))
            })?;
        if let Some(shards) = self.number_of_shards {
            index_settings.insert("number_of_shards".into(), Value::from(shards));
        }
        if let Some(replicas) = self.number_of_replicas {
            index_settings.insert("number_of_replicas".into(), Value::from(replicas));
        }
        Ok(template)
    }
}

/// Flattens nested objects into dotted key paths. Arrays are leaves.
#[must_use]
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    fn walk(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                    walk(&path, child, out);
                }
            },
            _ => {
                out.insert(prefix.to_owned(), value.clone());
            },
        }
    }

    let mut out = BTreeMap::new();
    walk("", value, &mut out);
    out
}

/// One differing key path between two templates.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateChange {
    Removed { path: String, old: Value },
    Added { path: String, new: Value },
    Changed { path: String, old: Value, new: Value },
}

impl fmt::Display for TemplateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removed { path, old } => write!(f, "- {path}: {old}"),
            Self::Added { path, new } => write!(f, "+ {path}: {new}"),
            Self::Changed { path, old, new } => write!(f, "~ {path}: {old} -> {new}"),
        }
    }
}

/// Key-order-insensitive difference between two templates.
#[must_use]
pub fn diff(old: &Value, new: &Value) -> Vec<TemplateChange> {
    let old = flatten(old);
    let new = flatten(new);
    let mut changes = Vec::new();
    for (path, old_value) in &old {
        match new.get(path) {
            None => changes.push(TemplateChange::Removed { path: path.clone(), old: old_value.clone() }),
            Some(new_value) if new_value != old_value => changes.push(TemplateChange::Changed {
                path: path.clone(),
                old: old_value.clone(),
                new: new_value.clone(),
            }),
            Some(_) => {},
        }
    }
    for (path, new_value) in &new {
        if !old.contains_key(path) {
            changes.push(TemplateChange::Added { path: path.clone(), new: new_value.clone() });
        }
    }
    changes
}

/// What [`reconcile`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// No template existed; it was created.
    Created,
    /// The stored template matches the bundled one.
    Unchanged,
    /// The stored template differs but overwriting is disabled.
    Kept,
    /// The stored template differed and was replaced.
    Overwritten,
}

fn template_body(template: &Value) -> Value {
    template.get("template").cloned().unwrap_or_else(|| Value::Object(Map::new()))
}

/// Makes sure the template of `kind` exists, replacing a differing one only
/// when `overwrite` is set.
///
/// # Errors
///
/// Returns an error if the template cannot be read or written.
#[tracing::instrument(skip(client, provider), fields(template = kind.template_name()))]
pub fn reconcile(
    client: &ResilientClient,
    provider: &TemplateProvider,
    kind: TemplateKind,
    overwrite: bool,
) -> StoreResult<Reconciliation> {
    let name = kind.template_name();
    let desired = provider.template(kind)?;
    let existing = client.execute("get_template", |t| t.get_template(name))?;

    let outcome = match existing {
        None => {
            tracing::info!(template = name, "creating index template");
            Reconciliation::Created
        },
        Some(existing) => {
            let changes = diff(&template_body(&existing), &template_body(&desired));
            if changes.is_empty() {
                tracing::debug!(template = name, "keeping existing index template (identical)");
                return Ok(Reconciliation::Unchanged);
            }
            let changes: Vec<String> = changes.iter().map(ToString::to_string).collect();
            if !overwrite {
                tracing::debug!(
                    template = name,
                    diff = %changes.join("\n"),
                    "keeping existing index template (overwrite disabled)",
                );
                return Ok(Reconciliation::Kept);
            }
            tracing::warn!(template = name, diff = %changes.join("\n"), "overwriting existing index template");
            Reconciliation::Overwritten
        },
    };
    client.execute("put_template", |t| t.put_template(name, &desired))?;
    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::{config::RetryPolicy, testutil::FakeDatastore, transport::Transport};

    #[test]
    fn test_index_names() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 0).unwrap();
        assert_eq!(TemplateKind::Metrics.index_name(&ts), "benchmark-metrics-2024-03");
        assert_eq!(TemplateKind::Results.index_name(&ts), "benchmark-results-2024-03");
        assert_eq!(TemplateKind::Annotations.index_name(&ts), "benchmark-annotations");
        assert_eq!(TemplateKind::Races.index_pattern(), "benchmark-races-*");
        assert_eq!(migrated_index_name("benchmark-metrics-2024-03"), "benchmark-metrics-2024-03.new");
    }

    #[test]
    fn test_every_bundled_template_parses() {
        let provider = TemplateProvider::default();
        for kind in [TemplateKind::Metrics, TemplateKind::Races, TemplateKind::Results, TemplateKind::Annotations] {
            let template = provider.template(kind).unwrap();
            assert!(template.pointer("/template/mappings").is_some(), "{kind:?}");
        }
    }

    #[test]
    fn test_shard_and_replica_overrides() {
        let template = TemplateProvider::new(Some(3), Some(2)).template(TemplateKind::Metrics).unwrap();
        assert_eq!(template.pointer("/template/settings/index/number_of_shards"), Some(&json!(3)));
        assert_eq!(template.pointer("/template/settings/index/number_of_replicas"), Some(&json!(2)));
    }

    #[test]
    fn test_flatten_uses_dotted_paths() {
        let flat = flatten(&json!({"a": {"b": 1, "c": {"d": [1, 2]}}, "e": {}}));
        assert_eq!(flat.get("a.b"), Some(&json!(1)));
        assert_eq!(flat.get("a.c.d"), Some(&json!([1, 2])));
        assert_eq!(flat.get("e"), Some(&json!({})));
    }

    #[test]
    fn test_diff_ignores_key_order() {
        let old = json!({"settings": {"a": 1, "b": 2}});
        let new = json!({"settings": {"b": 2, "a": 1}});
        assert!(diff(&old, &new).is_empty());

        let changed = diff(&json!({"x": 1, "y": 2}), &json!({"x": 3, "z": 4}));
        let lines: Vec<String> = changed.iter().map(ToString::to_string).collect();
        assert_eq!(lines, vec!["~ x: 1 -> 3", "- y: 2", "+ z: 4"]);
    }

    fn client(fake: &Arc<FakeDatastore>) -> ResilientClient {
        ResilientClient::new(fake.clone(), RetryPolicy::default())
    }

    #[test]
    fn test_reconcile_creates_missing_template() {
        let fake = Arc::new(FakeDatastore::new());
        let provider = TemplateProvider::default();
        let outcome = reconcile(&client(&fake), &provider, TemplateKind::Metrics, false).unwrap();
        assert_eq!(outcome, Reconciliation::Created);
        assert!(fake.get_template("benchmark-metrics").unwrap().is_some());

        let again = reconcile(&client(&fake), &provider, TemplateKind::Metrics, false).unwrap();
        assert_eq!(again, Reconciliation::Unchanged);
        assert_eq!(fake.calls("put_template"), 1);
    }

    #[test]
    fn test_reconcile_respects_overwrite_flag() {
        let fake = Arc::new(FakeDatastore::new());
        let old = TemplateProvider::new(Some(1), None).template(TemplateKind::Metrics).unwrap();
        fake.put_template("benchmark-metrics", &old).unwrap();
        let provider = TemplateProvider::new(Some(5), None);

        let kept = reconcile(&client(&fake), &provider, TemplateKind::Metrics, false).unwrap();
        assert_eq!(kept, Reconciliation::Kept);
        let stored = fake.get_template("benchmark-metrics").unwrap().unwrap();
        assert_eq!(stored.pointer("/template/settings/index/number_of_shards"), Some(&json!(1)));

        let overwritten = reconcile(&client(&fake), &provider, TemplateKind::Metrics, true).unwrap();
        assert_eq!(overwritten, Reconciliation::Overwritten);
        let stored = fake.get_template("benchmark-metrics").unwrap().unwrap();
        assert_eq!(stored.pointer("/template/settings/index/number_of_shards"), Some(&json!(5)));
    }
}
