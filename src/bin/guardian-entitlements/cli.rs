//! Command-line interface definition.

use clap::{Parser, Subcommand, ValueEnum};
use guardian_entitlements::config::{ServiceConfig, StoreBackendKind, StoreFormat};
use guardian_entitlements::EntitlementStatus;
use std::path::PathBuf;

/// Wallet entitlement service: trials, rate limits and paid upgrades.
#[derive(Parser, Debug)]
#[command(name = "guardian-entitlements")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Directory holding the entitlement store.
    #[arg(long, env = "GUARDIAN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Store backend.
    #[arg(long, value_enum, env = "GUARDIAN_STORE_BACKEND")]
    pub store_backend: Option<CliStoreBackend>,

    /// On-disk encoding of the file store.
    #[arg(long, value_enum, env = "GUARDIAN_STORE_FORMAT")]
    pub store_format: Option<CliStoreFormat>,

    /// Log level.
    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "GUARDIAN_LOG_FORMAT")]
    pub log_format: CliLogFormat,

    /// Command to run; defaults to `run`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Service and administration commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the service until interrupted.
    Run,
    /// Print a wallet's record and remaining scans.
    Info {
        /// Wallet address.
        wallet: String,
    },
    /// Force a wallet into a tier.
    SetStatus {
        /// Wallet address.
        wallet: String,
        /// Target tier (FREE, PRO_TRIAL, PRO_PAID, BLOCKED).
        status: EntitlementStatus,
    },
    /// Delete a wallet's record.
    Reset {
        /// Wallet address.
        wallet: String,
    },
    /// Print a wallet's trial state.
    TrialStatus {
        /// Wallet address.
        wallet: String,
    },
    /// Validate and print the effective configuration.
    CheckConfig,
}

/// Store backend CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliStoreBackend {
    /// Volatile in-process store.
    Memory,
    /// Single file in the data directory.
    File,
}

/// Store format CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliStoreFormat {
    /// JSON document.
    Json,
    /// MessagePack document.
    Msgpack,
}

/// Log format CLI enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Convert CLI arguments into a ServiceConfig.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn to_config(&self) -> color_eyre::Result<ServiceConfig> {
        let mut config = if let Some(ref path) = self.config {
            ServiceConfig::from_file(path)?
        } else {
            ServiceConfig::default()
        };

        if let Some(ref data_dir) = self.data_dir {
            config.data_dir.clone_from(data_dir);
        }
        if let Some(backend) = self.store_backend {
            config.store.backend = backend.into();
        }
        if let Some(format) = self.store_format {
            config.store.format = format.into();
        }
        if let Some(ref level) = self.log_level {
            config.log_level.clone_from(level);
        }

        config.validate()?;
        Ok(config)
    }
}

impl From<CliStoreBackend> for StoreBackendKind {
    fn from(b: CliStoreBackend) -> Self {
        match b {
            CliStoreBackend::Memory => StoreBackendKind::Memory,
            CliStoreBackend::File => StoreBackendKind::File,
        }
    }
}

impl From<CliStoreFormat> for StoreFormat {
    fn from(f: CliStoreFormat) -> Self {
        match f {
            CliStoreFormat::Json => StoreFormat::Json,
            CliStoreFormat::Msgpack => StoreFormat::MessagePack,
        }
    }
}
