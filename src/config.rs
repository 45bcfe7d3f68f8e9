//! Configuration for guardian-entitlements.

use crate::entitlement::Limits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where entitlement records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// In-process only; state is lost on restart.
    Memory,
    /// Single document under the data directory.
    #[default]
    File,
}

/// Encoding of the file-backed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFormat {
    /// Pretty-printed JSON.
    #[default]
    Json,
    /// MessagePack with named fields.
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl StoreFormat {
    /// Conventional file extension.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "msgpack",
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Root directory for service data.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Record store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Quota and trial limits.
    #[serde(default)]
    pub limits: Limits,

    /// Ownership challenge configuration.
    #[serde(default)]
    pub challenge: ChallengeConfig,

    /// Payment processing configuration.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind.
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Encoding for the file backend.
    #[serde(default)]
    pub format: StoreFormat,

    /// File name under `data_dir`; defaults to `entitlements.<ext>`.
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Ownership challenge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Seconds a challenge stays valid.
    #[serde(default = "default_challenge_expiry")]
    pub expiry_secs: u64,

    /// Seconds between background purges of expired challenges.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

/// Payment processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Capacity of the processed-session cache.
    #[serde(default = "default_session_cache_capacity")]
    pub session_cache_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
            limits: Limits::default(),
            challenge: ChallengeConfig::default(),
            payment: PaymentConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            format: StoreFormat::default(),
            file_name: None,
        }
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_challenge_expiry(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            session_cache_capacity: default_session_cache_capacity(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "guardian")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".guardian"))
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_challenge_expiry() -> u64 {
    300 // 5 minutes
}

const fn default_purge_interval() -> u64 {
    60
}

const fn default_session_cache_capacity() -> usize {
    10_000
}

impl ServiceConfig {
    /// Path of the file-backed store document.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        let name = self
            .store
            .file_name
            .clone()
            .unwrap_or_else(|| format!("entitlements.{}", self.store.format.extension()));
        self.data_dir.join(name)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would disable the limiter.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> crate::Result<()> {
        check_range("limits.window_hours", self.limits.window_hours.into(), MAX_WINDOW_HOURS)?;
        check_range("limits.trial_days", self.limits.trial_days.into(), MAX_TRIAL_DAYS)?;
        if u64::from(self.limits.burst_cooldown_secs) > MAX_INTERVAL_SECS {
            return Err(crate::Error::Config(format!(
                "limits.burst_cooldown_secs must be <= {MAX_INTERVAL_SECS}"
            )));
        }
        check_range("challenge.expiry_secs", self.challenge.expiry_secs, MAX_INTERVAL_SECS)?;
        check_range(
            "challenge.purge_interval_secs",
            self.challenge.purge_interval_secs,
            MAX_INTERVAL_SECS,
        )?;
        Ok(())
    }
}

/// Longest counting window: one year.
const MAX_WINDOW_HOURS: u64 = 8_760;

/// Longest trial: ten years.
const MAX_TRIAL_DAYS: u64 = 3_650;

/// Longest cooldown, challenge lifetime or purge interval: one day.
const MAX_INTERVAL_SECS: u64 = 86_400;

fn check_range(field: &str, value: u64, max: u64) -> crate::Result<()> {
    if value == 0 || value > max {
        return Err(crate::Error::Config(format!(
            "{field} must be between 1 and {max}, got {value}"
        )));
    }
    Ok(())
}
