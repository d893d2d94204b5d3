//! Layered configuration: serialized defaults, then an optional TOML file,
//! then `LESSONSLOT_`-prefixed environment variables.
//!
//! Nested keys use a double underscore in the environment, e.g.
//! `LESSONSLOT_LOG__FILTER=debug` or `LESSONSLOT_COMPACT_THRESHOLD=500`.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limits::{DEFAULT_MAX_PROMOTION_ATTEMPTS, MAX_PROMOTION_ATTEMPTS};

pub const ENV_PREFIX: &str = "LESSONSLOT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding one `<tenant>.wal` file per tenant.
    pub data_dir: PathBuf,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
    /// Interval of the pending-appointment expiry sweep.
    pub expiry_sweep_secs: u64,
    pub max_promotion_attempts: u32,
    #[serde(default)]
    pub log: LogConfig,
    /// Prometheus exporter port; no exporter when unset.
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG` when that is set.
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            expiry_sweep_secs: 60,
            max_promotion_attempts: DEFAULT_MAX_PROMOTION_ATTEMPTS,
            log: LogConfig::default(),
            metrics_port: None,
        }
    }
}

impl Config {
    /// The provider stack without extraction, so callers can add layers.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load from defaults, the optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compact_threshold == 0 {
            return Err(ConfigError::Validation {
                field: "compact_threshold",
                reason: "must be greater than zero".into(),
            });
        }
        if self.expiry_sweep_secs == 0 {
            return Err(ConfigError::Validation {
                field: "expiry_sweep_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if !(1..=MAX_PROMOTION_ATTEMPTS).contains(&self.max_promotion_attempts) {
            return Err(ConfigError::Validation {
                field: "max_promotion_attempts",
                reason: format!("must be between 1 and {MAX_PROMOTION_ATTEMPTS}"),
            });
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                field: "data_dir",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}
