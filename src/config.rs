//! Agent configuration loaded from a TOML file
//!
//! # Example TOML
//! ```toml
//! filter-method-names = ["app.service", "app.db"]
//! grouping-method-names = "app.db"          # comma-separated strings work too
//! logger-level = "debug"
//! hide-agent-consumption = true
//! sampling-window-ms = 1000
//! probe-interval-ms = 10
//! listen-address = "0.0.0.0:9100"
//! ```
//!
//! A missing or unreadable file falls back to defaults. The defaults carry no
//! monitored names, so [`AgentProperties::validate`] rejects them: the agent
//! cannot start without knowing what to monitor.

use crate::location::{LocationRules, PrefixRules};
use crate::sampler::SamplerSettings;
use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn, Level};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "CPU_TIME_EXPORTER_CONFIG";

/// Configuration file used when neither CLI nor environment name one
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Default metrics endpoint address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9100";

/// Configuration errors that prevent the agent from starting
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No monitored names configured: set `filter-method-names` to at least one prefix")]
    MissingMonitoredNames,

    #[error("Invalid sampling: probe interval {interval_ms}ms must be > 0 and <= window {window_ms}ms")]
    InvalidSampling { window_ms: u64, interval_ms: u64 },

    #[error("Invalid listen address '{address}': {source}")]
    InvalidListenAddress {
        address: String,
        source: std::net::AddrParseError,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings read once at startup and held for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AgentProperties {
    /// Prefixes a location must start with to be reported
    #[serde(deserialize_with = "name_list")]
    pub filter_method_names: Vec<String>,

    /// Scope prefixes collapsed into a single location
    #[serde(deserialize_with = "name_list")]
    pub grouping_method_names: Vec<String>,

    /// Log level name (`info` if absent or unrecognised)
    pub logger_level: String,

    /// Keep the sampling thread out of its own results
    pub hide_agent_consumption: bool,

    /// Length of one sampling cycle in milliseconds
    pub sampling_window_ms: u64,

    /// Pause between probes in milliseconds
    pub probe_interval_ms: u64,

    /// Address the metrics endpoint binds to
    pub listen_address: String,
}

impl Default for AgentProperties {
    fn default() -> Self {
        Self {
            filter_method_names: Vec::new(),
            grouping_method_names: Vec::new(),
            logger_level: "info".to_string(),
            hide_agent_consumption: false,
            sampling_window_ms: 1000,
            probe_interval_ms: 10,
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
        }
    }
}

/// Where the loaded properties came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Parsed from this file
    File(PathBuf),
    /// File absent; defaults used
    Missing(PathBuf),
    /// File present but unreadable or invalid; defaults used
    Malformed { path: PathBuf, reason: String },
}

impl ConfigSource {
    /// Report the outcome once logging is up
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => info!(path = %path.display(), "loaded configuration"),
            ConfigSource::Missing(path) => info!(
                path = %path.display(),
                "could not locate configuration file, using default values"
            ),
            ConfigSource::Malformed { path, reason } => warn!(
                path = %path.display(),
                reason = %reason,
                "could not load configuration file, using default values"
            ),
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Missing(path) => write!(f, "{} (missing, defaults)", path.display()),
            ConfigSource::Malformed { path, .. } => {
                write!(f, "{} (malformed, defaults)", path.display())
            }
        }
    }
}

/// Resolve the configuration path: explicit, then environment, then default
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    std::env::var_os(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl AgentProperties {
    /// Parse properties from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))
    }

    /// Load from `path`, falling back to defaults when absent or malformed
    pub fn load<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return (Self::default(), ConfigSource::Missing(path));
        }

        match Self::from_file(&path) {
            Ok(properties) => (properties, ConfigSource::File(path)),
            Err(e) => (
                Self::default(),
                ConfigSource::Malformed {
                    path,
                    reason: format!("{e:#}"),
                },
            ),
        }
    }

    /// Check the settings the agent cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules().monitored.is_empty() {
            return Err(ConfigError::MissingMonitoredNames);
        }

        if self.probe_interval_ms == 0 || self.probe_interval_ms > self.sampling_window_ms {
            return Err(ConfigError::InvalidSampling {
                window_ms: self.sampling_window_ms,
                interval_ms: self.probe_interval_ms,
            });
        }

        self.listen_addr()?;
        Ok(())
    }

    /// Monitored and grouping prefixes as resolution rules
    pub fn rules(&self) -> LocationRules {
        LocationRules::new(
            PrefixRules::new(&self.filter_method_names),
            PrefixRules::new(&self.grouping_method_names),
        )
    }

    /// Whether a name passes the monitored-prefix filter
    pub fn is_monitored(&self, name: &str) -> bool {
        self.rules().is_monitored(name)
    }

    pub fn hide_own_thread(&self) -> bool {
        self.hide_agent_consumption
    }

    pub fn sampler_settings(&self) -> SamplerSettings {
        SamplerSettings {
            window: Duration::from_millis(self.sampling_window_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            hide_own_thread: self.hide_agent_consumption,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_address
            .trim()
            .parse()
            .map_err(|source| ConfigError::InvalidListenAddress {
                address: self.listen_address.clone(),
                source,
            })
    }

    /// Log level, accepting both tracing and java.util.logging names
    pub fn logger_level(&self) -> Level {
        match self.logger_level.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" | "finest" | "finer" => Level::TRACE,
            "debug" | "fine" | "config" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" | "severe" | "off" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Accept either `["a", "b"]` or `"a,b"`
fn name_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NameList {
        Joined(String),
        Items(Vec<String>),
    }

    let raw = match NameList::deserialize(deserializer)? {
        NameList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        NameList::Items(items) => items,
    };

    Ok(raw
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect())
}
