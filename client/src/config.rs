use crate::{ledger::TransferMode, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;
use url::Url;

/// Configuration for the `chips` front end, read from YAML.
///
/// Every field has a default so that an empty (or missing) file is valid.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub gateway_url: String,
    pub state_path: String,
    pub transfer_mode: TransferMode,
    pub log_level: String,

    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:8080".to_string(),
            state_path: default_state_path(),
            transfer_mode: TransferMode::default(),
            log_level: "info".to_string(),
            max_attempts: 1,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            channel_capacity: 1_024,
        }
    }
}

fn default_state_path() -> String {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".chipledger")
            .join("identity.json")
            .to_string_lossy()
            .into_owned(),
        None => ".chipledger/identity.json".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid gateway url {value}: {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("gateway url must be http or https: {value}")]
    InvalidScheme { value: String },
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: usize },
    #[error("initial_backoff_ms ({initial}) exceeds max_backoff_ms ({max})")]
    InvalidBackoff { initial: u64, max: u64 },
    #[error("state_path must not be empty")]
    EmptyStatePath,
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

pub struct ValidatedConfig {
    pub gateway_url: Url,
    pub state_path: PathBuf,
    pub transfer_mode: TransferMode,
    pub log_level: Level,
    pub retry_policy: RetryPolicy,
    pub channel_capacity: usize,
}

impl Config {
    /// Load a YAML config file. A missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_string(),
                    source,
                })
            }
        };
        Self::parse(path, &raw)
    }

    pub fn parse(path: &str, raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let gateway_url =
            Url::parse(&self.gateway_url).map_err(|source| ConfigError::InvalidUrl {
                value: self.gateway_url.clone(),
                source,
            })?;
        if !matches!(gateway_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidScheme {
                value: self.gateway_url,
            });
        }
        if self.state_path.trim().is_empty() {
            return Err(ConfigError::EmptyStatePath);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidNonZero {
                field: "max_attempts",
                value: self.max_attempts,
            });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                initial: self.initial_backoff_ms,
                max: self.max_backoff_ms,
            });
        }

        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;

        Ok(ValidatedConfig {
            gateway_url,
            state_path: PathBuf::from(self.state_path),
            transfer_mode: self.transfer_mode,
            log_level,
            retry_policy: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                retry_non_idempotent: false,
            },
            channel_capacity: self.channel_capacity,
        })
    }
}
