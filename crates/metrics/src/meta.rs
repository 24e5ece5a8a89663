//! Scoped meta information attached to records.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    error::ConfigError,
    types::{Meta, MetaScope},
};

/// Cluster-wide and per-node meta data owned by one store.
///
/// Records receive a copy of the merged meta at creation time, so later
/// additions never show up on records that already exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaInfo {
    cluster: Meta,
    nodes: BTreeMap<String, Meta>,
}

impl MetaInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a meta value to a scope.
    ///
    /// `scope_key` is ignored for [`MetaScope::Cluster`] and names the node
    /// for [`MetaScope::Node`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if a node-level value is added
    /// without a node name.
    pub fn add(
        &mut self,
        scope: MetaScope,
        scope_key: Option<&str>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ConfigError> {
        match scope {
            MetaScope::Cluster => {
                self.cluster.insert(key.into(), value.into());
            },
            MetaScope::Node => {
                let node = scope_key.ok_or(ConfigError::Missing { field: "node name" })?;
                self.nodes.entry(node.to_owned()).or_default().insert(key.into(), value.into());
            },
        }
        Ok(())
    }

    #[must_use]
    pub fn cluster(&self) -> &Meta {
        &self.cluster
    }

    #[must_use]
    pub fn node(&self, node_name: &str) -> Option<&Meta> {
        self.nodes.get(node_name)
    }

    /// Snapshot of the meta that applies at the given level.
    ///
    /// Node level merges the node's values over the cluster values.
    #[must_use]
    pub fn snapshot(&self, level: MetaScope, node_name: Option<&str>) -> Meta {
        let mut meta = self.cluster.clone();
        if level == MetaScope::Node
            && let Some(node) = node_name.and_then(|n| self.nodes.get(n))
        {
            meta.extend(node.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        meta
    }

    pub fn clear(&mut self) {
        self.cluster.clear();
        self.nodes.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_node_snapshot_includes_cluster() {
        let mut info = MetaInfo::new();
        info.add(MetaScope::Cluster, None, "source_revision", "abc").unwrap();
        info.add(MetaScope::Node, Some("node-0"), "jvm", "17").unwrap();

        let node = info.snapshot(MetaScope::Node, Some("node-0"));
        assert_eq!(node.get("source_revision"), Some(&json!("abc")));
        assert_eq!(node.get("jvm"), Some(&json!("17")));

        let cluster = info.snapshot(MetaScope::Cluster, None);
        assert_eq!(cluster.get("jvm"), None);
    }

    #[test]
    fn test_node_value_overrides_cluster_value() {
        let mut info = MetaInfo::new();
        info.add(MetaScope::Cluster, None, "os", "linux").unwrap();
        info.add(MetaScope::Node, Some("n"), "os", "darwin").unwrap();
        assert_eq!(info.snapshot(MetaScope::Node, Some("n")).get("os"), Some(&json!("darwin")));
    }

    #[test]
    fn test_unknown_node_gets_cluster_only() {
        let mut info = MetaInfo::new();
        info.add(MetaScope::Cluster, None, "k", 1).unwrap();
        let meta = info.snapshot(MetaScope::Node, Some("other"));
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn test_node_scope_requires_node_name() {
        let mut info = MetaInfo::new();
        assert_eq!(
            info.add(MetaScope::Node, None, "k", 1),
            Err(ConfigError::Missing { field: "node name" })
        );
    }

    #[test]
    fn test_clear() {
        let mut info = MetaInfo::new();
        info.add(MetaScope::Cluster, None, "k", 1).unwrap();
        info.add(MetaScope::Node, Some("n"), "k", 1).unwrap();
        info.clear();
        assert!(info.cluster().is_empty());
        assert!(info.node("n").is_none());
    }
}
