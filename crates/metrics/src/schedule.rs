//! Read-only view of the benchmark definition.
//!
//! Tracks, challenges and their task schedule are loaded elsewhere; the
//! metrics subsystem only needs names, meta data and the reporting flags.

use serde::{Deserialize, Serialize};

use crate::types::Meta;

/// A benchmark track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    #[serde(default)]
    pub meta_data: Meta,
}

impl Track {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), meta_data: Meta::new() }
    }
}

/// A challenge: a named schedule of tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub name: String,
    /// Challenges generated on the fly are not recorded on races.
    #[serde(default)]
    pub auto_generated: bool,
    #[serde(default)]
    pub meta_data: Meta,
    /// Groups of tasks; tasks within one group run in parallel.
    #[serde(default)]
    pub schedule: Vec<Vec<Task>>,
}

impl Challenge {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Every scheduled task in schedule order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.schedule.iter().flatten()
    }
}

/// One scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub operation: Operation,
    #[serde(default)]
    pub meta_data: Meta,
}

impl Task {
    #[must_use]
    pub fn new(name: impl Into<String>, operation: Operation) -> Self {
        Self { name: name.into(), operation, meta_data: Meta::new() }
    }
}

/// The operation a task executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(rename = "type")]
    pub operation_type: String,
    #[serde(default = "default_include_in_reporting")]
    pub include_in_reporting: bool,
    #[serde(default)]
    pub meta_data: Meta,
}

fn default_include_in_reporting() -> bool {
    true
}

impl Operation {
    #[must_use]
    pub fn new(name: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation_type: operation_type.into(),
            include_in_reporting: true,
            meta_data: Meta::new(),
        }
    }

    /// Marks the operation as excluded from reports.
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.include_in_reporting = false;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_deserialize_challenge() {
        let challenge: Challenge = serde_json::from_value(json!({
            "name": "append-no-conflicts",
            "schedule": [
                [{"name": "index-append", "operation": {"name": "bulk", "type": "bulk"}}],
                [
                    {"name": "q1", "operation": {"name": "term", "type": "search"}},
                    {"name": "wait", "operation": {"name": "wait", "type": "sleep", "include_in_reporting": false}}
                ]
            ]
        }))
        .unwrap();
        let names: Vec<&str> = challenge.tasks().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["index-append", "q1", "wait"]);
        assert!(challenge.tasks().next().unwrap().operation.include_in_reporting);
        assert!(!challenge.tasks().last().unwrap().operation.include_in_reporting);
    }
}
