//! Configuration of the remote datastore and of reporting as a whole.
//!
//! [`DatastoreConfig`] is what a user writes down. Credentials may also come
//! from the environment; [`DatastoreConfig::resolve`] merges both sources
//! once, validates the result and produces an immutable
//! [`ResolvedDatastore`]. Nothing below the factory reads the environment.

use std::{fmt, path::PathBuf, time::Duration};

use benchmark_metrics::{ConfigError, Endpoint, StoreSettings};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Environment variable that overrides the configured user.
pub const ENV_USER: &str = "BENCHMARK_DATASTORE_USER";

/// Environment variable that overrides the configured password.
pub const ENV_PASSWORD: &str = "BENCHMARK_DATASTORE_PASSWORD";

/// Environment variable that overrides the configured API key.
pub const ENV_API_KEY: &str = "BENCHMARK_DATASTORE_API_KEY";

const DEFAULT_PORT: u16 = 9200;

/// Default request timeout (120 seconds).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_MAX_RETRIES: u32 = 10;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

/// Retry budget of the [`ResilientClient`](crate::ResilientClient).
///
/// The wait before retry `k` (counting from zero) is
/// `base_delay * 2^k + base_delay * jitter` with `jitter` drawn uniformly
/// from `[0, 1)`. Growth is not capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    #[serde(with = "humantime_serde", default = "default_base_delay")]
    #[builder(default = DEFAULT_BASE_DELAY)]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES, base_delay: DEFAULT_BASE_DELAY }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` for a jitter value in `[0, 1)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let exponential =
            self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        exponential.saturating_add(self.base_delay.mul_f64(jitter.clamp(0.0, 1.0)))
    }

    /// Total number of attempts, including the first one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Connection and provisioning settings of a remote datastore.
///
/// # Example
///
/// ```
/// use benchmark_metrics_remote::DatastoreConfig;
///
/// let config = DatastoreConfig::builder()
///     .host("metrics.example.org")
///     .secure(true)
///     .user("bench")
///     .password("secret")
///     .number_of_shards(2)
///     .build()?;
/// let resolved = config.resolve(|_| None)?;
/// assert_eq!(resolved.endpoint().port, 9200);
/// # Ok::<(), benchmark_metrics::ConfigError>(())
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatastoreConfig {
    pub(crate) host: String,

    #[serde(default = "default_port")]
    pub(crate) port: u16,

    /// Use HTTPS.
    #[serde(default)]
    pub(crate) secure: bool,

    #[serde(default)]
    pub(crate) user: Option<String>,

    #[serde(default)]
    pub(crate) password: Option<Zeroizing<String>>,

    #[serde(default)]
    pub(crate) api_key: Option<Zeroizing<String>>,

    #[serde(default = "default_true")]
    pub(crate) verify_certs: bool,

    /// PEM bundle of additional certificate authorities.
    #[serde(default)]
    pub(crate) ca_path: Option<PathBuf>,

    /// Overrides the shard count of every template.
    #[serde(default)]
    pub(crate) number_of_shards: Option<i64>,

    /// Overrides the replica count of every template.
    #[serde(default)]
    pub(crate) number_of_replicas: Option<i64>,

    /// Replace stored templates that differ from the bundled ones.
    #[serde(default)]
    pub(crate) overwrite_existing_templates: bool,

    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub(crate) request_timeout: Duration,

    #[serde(default)]
    pub(crate) retry: RetryPolicy,
}

impl fmt::Debug for DatastoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatastoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("verify_certs", &self.verify_certs)
            .field("ca_path", &self.ca_path)
            .field("number_of_shards", &self.number_of_shards)
            .field("number_of_replicas", &self.number_of_replicas)
            .field("overwrite_existing_templates", &self.overwrite_existing_templates)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

#[bon::bon]
impl DatastoreConfig {
    /// Creates a new configuration.
    ///
    /// Credentials are validated by [`resolve`](Self::resolve), after
    /// environment overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for an empty host and
    /// [`ConfigError::BelowMinimum`] for a shard count below one or a
    /// negative replica count.
    #[builder]
    pub fn new(
        #[builder(into)] host: String,
        #[builder(default = DEFAULT_PORT)] port: u16,
        #[builder(default)] secure: bool,
        #[builder(into)] user: Option<String>,
        #[builder(with = |password: impl Into<String>| Zeroizing::new(password.into()))]
        password: Option<Zeroizing<String>>,
        #[builder(with = |key: impl Into<String>| Zeroizing::new(key.into()))]
        api_key: Option<Zeroizing<String>>,
        #[builder(default = true)] verify_certs: bool,
        #[builder(into)] ca_path: Option<PathBuf>,
        number_of_shards: Option<i64>,
        number_of_replicas: Option<i64>,
        #[builder(default)] overwrite_existing_templates: bool,
        #[builder(default = DEFAULT_REQUEST_TIMEOUT)] request_timeout: Duration,
        #[builder(default)] retry: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            host,
            port,
            secure,
            user,
            password,
            api_key,
            verify_certs,
            ca_path,
            number_of_shards,
            number_of_replicas,
            overwrite_existing_templates,
            request_timeout,
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Missing { field: "datastore.host" });
        }
        if let Some(shards) = self.number_of_shards
            && shards < 1
        {
            return Err(ConfigError::BelowMinimum {
                field: "datastore.number_of_shards",
                min: 1,
                value: shards,
            });
        }
        if let Some(replicas) = self.number_of_replicas
            && replicas < 0
        {
            return Err(ConfigError::BelowMinimum {
                field: "datastore.number_of_replicas",
                min: 0,
                value: replicas,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.as_str(), self.port)
    }

    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Merges environment overrides into the credentials and validates the
    /// result.
    ///
    /// `env` looks up one variable; empty values count as unset. The
    /// variables are [`ENV_USER`], [`ENV_PASSWORD`] and [`ENV_API_KEY`].
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Conflicting`] if both a user and an API key are set
    /// - [`ConfigError::Missing`] if a user is set without a password
    /// - the errors of [`DatastoreConfig::new`] for deserialized settings
    pub fn resolve<F>(&self, env: F) -> Result<ResolvedDatastore, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.validate()?;
        let env = |name: &str| env(name).filter(|v| !v.is_empty());
        let user = env(ENV_USER).or_else(|| self.user.clone().filter(|u| !u.is_empty()));
        let password = env(ENV_PASSWORD)
            .map(Zeroizing::new)
            .or_else(|| self.password.clone().filter(|p| !p.is_empty()));
        let api_key = env(ENV_API_KEY)
            .map(Zeroizing::new)
            .or_else(|| self.api_key.clone().filter(|k| !k.is_empty()));

        let credentials = match (user, password, api_key) {
            (Some(_), _, Some(_)) => {
                return Err(ConfigError::Conflicting {
                    message: "both basic authentication (user and password) and an API key are \
                              configured; please provide only one authentication method"
                        .to_owned(),
                });
            },
            (Some(_), None, None) => {
                return Err(ConfigError::Missing { field: "datastore.password" });
            },
            (Some(user), Some(password), None) => Credentials::Basic { user, password },
            (None, _, Some(key)) => Credentials::ApiKey(key),
            (None, _, None) => Credentials::None,
        };

        Ok(ResolvedDatastore {
            endpoint: self.endpoint(),
            secure: self.secure,
            credentials,
            verify_certs: self.verify_certs,
            ca_path: self.ca_path.clone(),
            number_of_shards: self.number_of_shards.and_then(|n| u32::try_from(n).ok()),
            number_of_replicas: self.number_of_replicas.and_then(|n| u32::try_from(n).ok()),
            overwrite_existing_templates: self.overwrite_existing_templates,
            request_timeout: self.request_timeout,
            retry: self.retry,
        })
    }

    /// [`resolve`](Self::resolve) against the process environment.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub fn resolve_from_env(&self) -> Result<ResolvedDatastore, ConfigError> {
        self.resolve(|name| std::env::var(name).ok())
    }
}

/// How requests authenticate against the datastore.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Basic { user: String, password: Zeroizing<String> },
    ApiKey(Zeroizing<String>),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { user, .. } => {
                f.debug_struct("Basic").field("user", user).field("password", &"<redacted>").finish()
            },
            Self::ApiKey(_) => f.debug_tuple("ApiKey").field(&"<redacted>").finish(),
        }
    }
}

/// Validated datastore settings with credentials merged from the
/// environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDatastore {
    endpoint: Endpoint,
    secure: bool,
    credentials: Credentials,
    verify_certs: bool,
    ca_path: Option<PathBuf>,
    number_of_shards: Option<u32>,
    number_of_replicas: Option<u32>,
    overwrite_existing_templates: bool,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl ResolvedDatastore {
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn secure(&self) -> bool {
        self.secure
    }

    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    #[must_use]
    pub fn verify_certs(&self) -> bool {
        self.verify_certs
    }

    #[must_use]
    pub fn ca_path(&self) -> Option<&PathBuf> {
        self.ca_path.as_ref()
    }

    #[must_use]
    pub fn number_of_shards(&self) -> Option<u32> {
        self.number_of_shards
    }

    #[must_use]
    pub fn number_of_replicas(&self) -> Option<u32> {
        self.number_of_replicas
    }

    #[must_use]
    pub fn overwrite_existing_templates(&self) -> bool {
        self.overwrite_existing_templates
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Base URL of the datastore, e.g. `https://metrics.example.org:9200`.
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.endpoint.host, self.endpoint.port)
    }
}

/// Where metrics, races and results go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatastoreSelection {
    /// Metrics stay in memory; races are written as files.
    #[default]
    InMemory,
    /// Everything is written to a remote datastore.
    Remote(DatastoreConfig),
}

/// Reporting configuration read by the [`StoreFactory`](crate::StoreFactory).
///
/// ```
/// use benchmark_metrics_remote::{DatastoreSelection, ReportingConfig};
///
/// let config: ReportingConfig = serde_json::from_str(
///     r#"{"settings": {"environment": "nightly"}, "datastore": {"remote": {"host": "localhost"}}}"#,
/// )?;
/// assert!(matches!(config.datastore, DatastoreSelection::Remote(_)));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportingConfig {
    #[serde(default)]
    pub settings: StoreSettings,
    #[serde(default)]
    pub datastore: DatastoreSelection,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let resolved = DatastoreConfig::builder().host("localhost").build().unwrap().resolve(env(&[])).unwrap();
        assert_eq!(resolved.endpoint(), &Endpoint::new("localhost", 9200));
        assert_eq!(resolved.request_timeout(), Duration::from_secs(120));
        assert_eq!(resolved.retry(), &RetryPolicy::default());
        assert_eq!(resolved.credentials(), &Credentials::None);
        assert!(resolved.verify_certs());
        assert_eq!(resolved.base_url(), "http://localhost:9200");
    }

    #[test]
    fn test_env_overrides_configured_user() {
        let config = DatastoreConfig::builder().host("h").user("config-user").password("pw").build().unwrap();
        let resolved = config.resolve(env(&[(ENV_USER, "env-user")])).unwrap();
        match resolved.credentials() {
            Credentials::Basic { user, password } => {
                assert_eq!(user, "env-user");
                assert_eq!(password.as_str(), "pw");
            },
            other => panic!("unexpected credentials {other:?}"),
        }
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let config = DatastoreConfig::builder().host("h").api_key("k").build().unwrap();
        let resolved = config.resolve(env(&[(ENV_USER, "")])).unwrap();
        assert!(matches!(resolved.credentials(), Credentials::ApiKey(_)));
    }

    #[test]
    fn test_user_and_api_key_conflict() {
        let config = DatastoreConfig::builder().host("h").user("u").password("p").build().unwrap();
        let err = config.resolve(env(&[(ENV_API_KEY, "key")])).unwrap_err();
        assert!(matches!(err, ConfigError::Conflicting { .. }));
    }

    #[test]
    fn test_user_without_password() {
        let config = DatastoreConfig::builder().host("h").build().unwrap();
        let err = config.resolve(env(&[(ENV_USER, "u")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing { field: "datastore.password" });
    }

    #[test]
    fn test_shards_below_minimum() {
        let err = DatastoreConfig::builder().host("h").number_of_shards(0).build().unwrap_err();
        assert_eq!(
            err,
            ConfigError::BelowMinimum { field: "datastore.number_of_shards", min: 1, value: 0 }
        );
    }

    #[test]
    fn test_deserialized_config_is_validated_on_resolve() {
        let config: DatastoreConfig =
            serde_json::from_value(json!({"host": "h", "number_of_shards": 0})).unwrap();
        assert!(matches!(config.resolve(env(&[])), Err(ConfigError::BelowMinimum { .. })));
    }

    #[test]
    fn test_deserialize_durations() {
        let config: DatastoreConfig = serde_json::from_value(json!({
            "host": "h",
            "request_timeout": "30s",
            "retry": {"max_retries": 3, "base_delay": "250ms"},
        }))
        .unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.retry().max_retries, 3);
        assert_eq!(config.retry().base_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config =
            DatastoreConfig::builder().host("h").user("u").password("hunter2").build().unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
        let resolved = config.resolve(env(&[])).unwrap();
        assert!(!format!("{resolved:?}").contains("hunter2"));
    }

    #[test]
    fn test_backoff_doubles_and_adds_jitter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0, 0.0), Duration::from_secs(1));
        assert_eq!(policy.backoff(3, 0.0), Duration::from_secs(8));
        assert_eq!(policy.backoff(2, 0.5), Duration::from_millis(4_500));
        assert_eq!(policy.max_attempts(), 11);
    }

    #[test]
    fn test_reporting_config_defaults_to_in_memory() {
        let config: ReportingConfig = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(config.datastore, DatastoreSelection::InMemory));
        let config: ReportingConfig =
            serde_json::from_value(json!({"datastore": "in-memory"})).unwrap();
        assert!(matches!(config.datastore, DatastoreSelection::InMemory));
    }
}
