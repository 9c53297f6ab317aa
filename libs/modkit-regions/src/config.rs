//! Configuration for the regional endpoint core.
//!
//! Durations use humantime notation (`"5m"`, `"10ms"`, `"1s"`).
//!
//! ```yaml
//! regions:
//!   default_endpoint: "https://acct.example/"
//!   preferred_regions: ["East US", "West US"]
//!   refresh_interval: "5m"
//!   unavailable_duration: "5m"
//!   failover:
//!     max_retries: 120
//!     retry_interval: "1s"
//! ```

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RegionsError;

/// Prefix for environment overrides (`MODKIT_REGIONS_REFRESH_INTERVAL=1m`).
pub const ENV_PREFIX: &str = "MODKIT_REGIONS_";

/// Top-level configuration for [`GlobalEndpointManager`](crate::GlobalEndpointManager)
/// and the retry policies built on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionsConfig {
    /// Global account endpoint. Always the last-resort route.
    pub default_endpoint: Url,

    /// Region names in priority order. Matched case-insensitively.
    #[serde(default)]
    pub preferred_regions: Vec<String>,

    /// Use the regional endpoints reported by the service (default: true).
    /// When disabled every request goes to `default_endpoint`.
    #[serde(default = "default_true")]
    pub enable_endpoint_discovery: bool,

    /// Route writes to multiple regions when the account allows it (default: true).
    #[serde(default = "default_true")]
    pub use_multiple_write_locations: bool,

    /// Interval between background topology refreshes (default: 5m).
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// How long an endpoint stays excluded after being marked unavailable (default: 5m).
    #[serde(default = "default_unavailable_duration", with = "humantime_serde")]
    pub unavailable_duration: Duration,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub pool_exhausted: PoolExhaustedRetryConfig,

    #[serde(default)]
    pub fetch: FetchConfig,
}

/// Cross-region failover retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailoverConfig {
    /// Maximum failovers per logical operation (default: 120)
    pub max_retries: u32,

    /// Delay between failovers after the first one (default: 1s)
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries: 120,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Retries on connection pool exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolExhaustedRetryConfig {
    /// Maximum retries (default: 10)
    pub max_retries: u32,

    /// Fixed wait before each retry (default: 10ms)
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
}

impl Default for PoolExhaustedRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            wait: Duration::from_millis(10),
        }
    }
}

/// Topology document fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Per-request timeout (default: 10s)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Path of the account metadata document relative to an endpoint (default: "/")
    pub account_path: String,

    /// Allow plain `http://` endpoints. Only for tests against mock servers.
    pub allow_insecure_http: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            account_path: "/".to_owned(),
            allow_insecure_http: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_unavailable_duration() -> Duration {
    Duration::from_secs(300)
}

impl RegionsConfig {
    /// Config with defaults for everything but the endpoint.
    #[must_use]
    pub fn new(default_endpoint: Url) -> Self {
        Self {
            default_endpoint,
            preferred_regions: Vec::new(),
            enable_endpoint_discovery: true,
            use_multiple_write_locations: true,
            refresh_interval: default_refresh_interval(),
            unavailable_duration: default_unavailable_duration(),
            failover: FailoverConfig::default(),
            pool_exhausted: PoolExhaustedRetryConfig::default(),
            fetch: FetchConfig::default(),
        }
    }

    #[must_use]
    pub fn with_preferred_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_regions = regions.into_iter().map(Into::into).collect();
        self
    }

    /// Extract the config stored under `key` of an existing figment.
    ///
    /// # Errors
    /// Returns [`RegionsError::ConfigLoad`] if extraction fails and
    /// [`RegionsError::Config`] if the result does not validate.
    pub fn from_figment(figment: &Figment, key: &str) -> Result<Self, RegionsError> {
        let config: Self = figment.extract_inner(key).map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file (config at the `regions` key) with
    /// `MODKIT_REGIONS_*` environment overrides on top.
    ///
    /// Nested keys use a double underscore: `MODKIT_REGIONS_FAILOVER__MAX_RETRIES=5`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the config cannot be
    /// extracted, or validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegionsError> {
        let figment = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__").map(|key| {
                format!("regions.{}", key.as_str()).into()
            }));
        Self::from_figment(&figment, "regions")
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    /// Returns [`RegionsError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<(), RegionsError> {
        match self.default_endpoint.scheme() {
            "https" => {}
            "http" if self.fetch.allow_insecure_http => {}
            other => {
                return Err(RegionsError::Config(format!(
                    "default_endpoint scheme '{other}' not allowed"
                )));
            }
        }
        if self.default_endpoint.host_str().is_none() {
            return Err(RegionsError::Config(
                "default_endpoint must have a host".to_owned(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(RegionsError::Config(
                "refresh_interval must be greater than zero".to_owned(),
            ));
        }
        if self.preferred_regions.iter().any(|r| r.trim().is_empty()) {
            return Err(RegionsError::Config(
                "preferred_regions must not contain blank names".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Serde mapping for `Duration` in humantime notation.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw)
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&raw), &"a duration"))
    }
}
