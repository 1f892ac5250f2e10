//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{ClientOptions, DEFAULT_MAX_ADDRESSES};

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 600;

/// Client configuration. File: ~/.config/balancebridge/config.toml or
/// /etc/balancebridge/config.toml. Env overrides: BALANCEBRIDGE_REQUEST_TIMEOUT_SECS,
/// BALANCEBRIDGE_MAX_ADDRESSES, BALANCEBRIDGE_LOG_LEVEL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Per-request deadline in seconds (default 30, clamped to 1..=600).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Most addresses accepted in one balance or UTXO request (default 20).
    #[serde(default = "default_max_addresses")]
    pub max_addresses_per_request: usize,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. "info" or "bridge_client=debug". `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
}

fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_addresses() -> usize {
    DEFAULT_MAX_ADDRESSES
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_addresses_per_request: default_max_addresses(),
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Apply env overrides. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("BALANCEBRIDGE_REQUEST_TIMEOUT_SECS") {
            if let Ok(v) = s.trim().parse::<u64>() {
                self.request_timeout_secs = v;
            }
        }
        if let Some(s) = var("BALANCEBRIDGE_MAX_ADDRESSES") {
            if let Ok(v) = s.trim().parse::<usize>() {
                self.max_addresses_per_request = v;
            }
        }
        if let Some(s) = var("BALANCEBRIDGE_LOG_LEVEL") {
            if !s.trim().is_empty() {
                self.log.level = s.trim().to_string();
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        )
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: self.request_timeout(),
            max_addresses_per_request: self.max_addresses_per_request.max(1),
        }
    }
}

/// Load config: defaults, then the first config file found (if any), then env vars.
/// A file that exists but does not parse is an error rather than silently ignored.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/balancebridge/config.toml"));
    }
    out.push(PathBuf::from("/etc/balancebridge/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_toml_str(&s).map_err(|e| match e {
        ConfigError::Parse(source) => ConfigError::File {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config in {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
