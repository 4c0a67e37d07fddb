//! Broker configuration
//!
//! Configuration files:
//! - ~/.config/authbroker/broker.yaml - Service settings
//! - ~/.config/authbroker/catalog.yaml - Accounts, providers, applications
//!
//! Environment overrides (applied after the file):
//! - AUTHBROKER_DAEMON_TIMEOUT - idle timeout in seconds, 0 disables it
//! - AUTHBROKER_LOGGING_LEVEL - 0 warn, 1 info, 2 debug, 3+ trace

use anyhow::{Context, Result};
use authbroker_core::Paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::idle::DEFAULT_IDLE_TIMEOUT;
use crate::manager::DEFAULT_APPLICATION_LABEL;
use crate::trust::DEFAULT_LOOKUP_TIMEOUT;

pub const ENV_DAEMON_TIMEOUT: &str = "AUTHBROKER_DAEMON_TIMEOUT";
pub const ENV_LOGGING_LEVEL: &str = "AUTHBROKER_LOGGING_LEVEL";

pub const CONFIG_FILE: &str = "broker.yaml";
pub const CATALOG_FILE: &str = "catalog.yaml";
pub const SOCKET_NAME: &str = "authbroker";
pub const RENDERER_SOCKET_NAME: &str = "authbroker-ui";

/// Service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Exit after this long without activity; <= 0 never exits
    pub idle_timeout_ms: i64,

    /// Bound on resolving a caller's confinement profile
    pub profile_lookup_timeout_ms: u64,

    /// Socket callers connect to; defaults to the runtime dir
    pub socket_path: Option<PathBuf>,

    /// Socket reserved for the dialog renderer; defaults to the runtime dir
    pub renderer_socket_path: Option<PathBuf>,

    /// Metadata catalog; defaults to the config dir
    pub catalog_path: Option<PathBuf>,

    /// Application name shown when the caller is unknown
    pub default_application_label: String,

    /// Dismiss unanswered consent prompts after this many seconds
    pub consent_timeout_secs: Option<u32>,

    /// Numeric verbosity, see [`BrokerConfig::log_directive`]
    pub logging_level: Option<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as i64,
            profile_lookup_timeout_ms: DEFAULT_LOOKUP_TIMEOUT.as_millis() as u64,
            socket_path: None,
            renderer_socket_path: None,
            catalog_path: None,
            default_application_label: DEFAULT_APPLICATION_LABEL.to_string(),
            consent_timeout_secs: None,
            logging_level: None,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from default location
    pub fn load() -> Result<Self> {
        let paths = Paths::new();
        Self::load_from(&paths.config_file(CONFIG_FILE))
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read broker config from {:?}", path))?;
            let config: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse broker config from {:?}", path))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `var`. Values that don't parse are ignored.
    pub fn apply_env_with(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var(ENV_DAEMON_TIMEOUT) {
            match value.trim().parse::<i64>() {
                Ok(secs) => self.idle_timeout_ms = secs.saturating_mul(1000),
                Err(_) => warn!(var = ENV_DAEMON_TIMEOUT, value = %value, "Ignoring invalid timeout"),
            }
        }

        if let Some(value) = var(ENV_LOGGING_LEVEL) {
            match value.trim().parse::<u32>() {
                Ok(level) => self.logging_level = Some(level),
                Err(_) => warn!(var = ENV_LOGGING_LEVEL, value = %value, "Ignoring invalid logging level"),
            }
        }
    }

    /// Default tracing filter directive for the configured verbosity
    pub fn log_directive(&self) -> &'static str {
        match self.logging_level {
            None | Some(1) => "info",
            Some(0) => "warn",
            Some(2) => "debug",
            Some(_) => "trace",
        }
    }

    pub fn socket_path(&self, paths: &Paths) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| paths.socket(SOCKET_NAME))
    }

    pub fn renderer_socket_path(&self, paths: &Paths) -> PathBuf {
        self.renderer_socket_path
            .clone()
            .unwrap_or_else(|| paths.socket(RENDERER_SOCKET_NAME))
    }

    pub fn catalog_path(&self, paths: &Paths) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| paths.config_file(CATALOG_FILE))
    }

    pub fn profile_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.profile_lookup_timeout_ms)
    }

    pub fn consent_timeout(&self) -> Option<Duration> {
        self.consent_timeout_secs
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(u64::from(secs)))
    }
}
