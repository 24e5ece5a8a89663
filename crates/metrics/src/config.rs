//! Settings shared by every store backend.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, types::Meta};

const DEFAULT_ENVIRONMENT: &str = "local";

const DEFAULT_RACE_ROOT: &str = "benchmarks";

/// Run-independent settings of a store.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
///
/// use benchmark_metrics::StoreSettings;
///
/// let settings = StoreSettings::builder()
///     .environment("nightly")
///     .user_tags(BTreeMap::from([("intention".to_owned(), "baseline".to_owned())]))
///     .build()?;
/// assert_eq!(settings.environment(), "nightly");
/// # Ok::<(), benchmark_metrics::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    /// Name of the environment the benchmark runs in.
    #[serde(default = "default_environment")]
    pub(crate) environment: String,

    /// Track parameters, copied onto every value record when non-empty.
    #[serde(default)]
    pub(crate) track_params: Meta,

    /// User tags; stored as `tag_<key>` cluster meta when a store is opened.
    #[serde(default)]
    pub(crate) user_tags: BTreeMap<String, String>,

    /// Directory that holds one sub-directory per race.
    #[serde(default = "default_race_root")]
    pub(crate) race_root: PathBuf,
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_owned()
}

fn default_race_root() -> PathBuf {
    PathBuf::from(DEFAULT_RACE_ROOT)
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            track_params: Meta::new(),
            user_tags: BTreeMap::new(),
            race_root: default_race_root(),
        }
    }
}

#[bon::bon]
impl StoreSettings {
    /// Creates validated settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the environment name is empty.
    #[builder]
    pub fn new(
        #[builder(into, default = default_environment())] environment: String,
        #[builder(default)] track_params: Meta,
        #[builder(default)] user_tags: BTreeMap<String, String>,
        #[builder(into, default = default_race_root())] race_root: PathBuf,
    ) -> Result<Self, ConfigError> {
        if environment.is_empty() {
            return Err(ConfigError::Missing { field: "environment" });
        }
        Ok(Self { environment, track_params, user_tags, race_root })
    }

    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    #[must_use]
    pub fn track_params(&self) -> &Meta {
        &self.track_params
    }

    #[must_use]
    pub fn user_tags(&self) -> &BTreeMap<String, String> {
        &self.user_tags
    }

    #[must_use]
    pub fn race_root(&self) -> &PathBuf {
        &self.race_root
    }
}
