//! imgbundle configuration.
//!
//! Loaded from `$IMGBUNDLE_CONFIG` or `~/.imgbundle/config.yaml`, then
//! overridden by `IMGBUNDLE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BundleError, Result};

/// Environment variable pointing at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "IMGBUNDLE_CONFIG";

/// Default number of parallel registry existence lookups.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 8;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundleConfig {
    /// Registry connection settings
    pub registry: RegistryConfig,

    /// Maximum number of registry existence lookups in flight during localization
    pub probe_concurrency: usize,

    /// Log level used when `RUST_LOG` is not set
    pub log_level: LogLevel,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
            log_level: LogLevel::Warn,
        }
    }
}

impl BundleConfig {
    /// Load configuration from the default location and apply env overrides.
    ///
    /// A missing file yields defaults.
    pub fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(p) => Some(PathBuf::from(p)),
            Err(_) => Self::default_path(),
        };

        let mut config = match path {
            Some(p) if p.exists() => Self::from_path(&p)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Default config file path (`~/.imgbundle/config.yaml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".imgbundle").join("config.yaml"))
    }

    /// Parse a YAML config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BundleError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&data).map_err(|e| {
            BundleError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `IMGBUNDLE_*` overrides using the given variable lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("IMGBUNDLE_REGISTRY_INSECURE") {
            self.registry.insecure = parse_bool(&v).ok_or_else(|| {
                BundleError::ConfigError(format!(
                    "IMGBUNDLE_REGISTRY_INSECURE must be true or false, got '{}'",
                    v
                ))
            })?;
        }
        if let Some(v) = lookup("IMGBUNDLE_PROBE_CONCURRENCY") {
            self.probe_concurrency = v.parse().map_err(|_| {
                BundleError::ConfigError(format!(
                    "IMGBUNDLE_PROBE_CONCURRENCY must be a positive integer, got '{}'",
                    v
                ))
            })?;
        }
        if let Some(v) = lookup("IMGBUNDLE_LOG_LEVEL") {
            self.log_level = v.parse()?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.probe_concurrency == 0 {
            return Err(BundleError::ConfigError(
                "probe_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Talk plain HTTP instead of HTTPS
    pub insecure: bool,

    /// Override for the credential store location
    pub credentials_path: Option<PathBuf>,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(BundleError::ConfigError(format!(
                "Unknown log level '{}'",
                other
            ))),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
