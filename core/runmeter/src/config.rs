//! Configuration of the run-monitoring engine.
//!
//! The configuration is usually parsed from a TOML document:
//! ```toml
//! log_dir = "runs"
//! interval = "500ms"
//! save_interval = "5s"
//! shutdown_timeout = "5s"
//! tags = ["sweep"]
//!
//! [[adapters]]
//! address = "127.0.0.1:50600"
//! sources = ["rapl/package-0"]
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::retry::ExponentialRetryPolicy;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory where finalized run records are dropped, in the `lobby` subdirectory.
    ///
    /// If not set, records are only kept in memory.
    pub log_dir: Option<PathBuf>,

    /// Duration of the time buckets, and sampling interval of the native counters.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// How long the merger waits for late power readings before closing a bucket.
    ///
    /// Defaults to one `interval`.
    #[serde(with = "humantime_serde")]
    pub lateness: Option<Duration>,

    /// How often the record of the active run is saved to the lobby, if `log_dir` is set.
    #[serde(with = "humantime_serde")]
    pub save_interval: Duration,

    /// Maximum time to wait for the background tasks to stop when a run ends.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum time to wait for a TCP connection to an adapter.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// An adapter that sends nothing (not even a heartbeat) for this long is considered stale.
    #[serde(with = "humantime_serde")]
    pub liveness_timeout: Duration,

    /// How to retry failed connections to adapters.
    pub retry: RetryConfig,

    /// The power adapters to subscribe to.
    pub adapters: Vec<AdapterConfig>,

    /// Tags added to every run.
    pub tags: BTreeSet<String>,
}

/// An adapter endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    /// Address of the adapter, for instance `127.0.0.1:50600`.
    pub address: String,

    /// The sources that this adapter is expected to report.
    ///
    /// They are flagged as unavailable if the adapter cannot be reached.
    /// If empty, the address is used to label the missing source.
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of consecutive failed connection attempts before giving up.
    pub max_retries: u16,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: None,
            interval: Duration::from_millis(500),
            lateness: None,
            save_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            adapters: Vec::new(),
            tags: BTreeSet::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

impl From<&RetryConfig> for ExponentialRetryPolicy {
    fn from(value: &RetryConfig) -> Self {
        ExponentialRetryPolicy {
            max_retries: value.max_retries,
            initial_delay: value.initial_delay,
            max_delay: value.max_delay,
            multiplier: value.multiplier,
        }
    }
}

impl AdapterConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Labels used to report this adapter's sources when it is unavailable.
    pub fn expected_sources(&self) -> Vec<String> {
        if self.sources.is_empty() {
            vec![self.address.clone()]
        } else {
            self.sources.clone()
        }
    }
}

impl Config {
    /// Parses and validates a TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(String::from("interval must be greater than zero")));
        }
        if self.save_interval.is_zero() {
            return Err(ConfigError::Invalid(String::from("save_interval must be greater than zero")));
        }
        if self.retry.multiplier == 0 {
            return Err(ConfigError::Invalid(String::from("retry.multiplier must be at least 1")));
        }
        if self.liveness_timeout.is_zero() {
            return Err(ConfigError::Invalid(String::from("liveness_timeout must be greater than zero")));
        }
        for adapter in &self.adapters {
            if adapter.address.trim().is_empty() {
                return Err(ConfigError::Invalid(String::from("adapter address cannot be empty")));
            }
        }
        Ok(())
    }

    /// The lateness window of the merger.
    pub fn lateness(&self) -> Duration {
        self.lateness.unwrap_or(self.interval)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterConfig) -> Self {
        self.adapters.push(adapter);
        self
    }
}
