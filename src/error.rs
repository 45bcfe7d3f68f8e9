//! Error types for guardian-entitlements.
//!
//! Policy rejections (blocked, rate limited, quota reached, trial already
//! used, ...) are ordinary return values and never appear here. This type
//! covers infrastructure failures and malformed caller input only.

use std::io;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in guardian-entitlements.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The entitlement store could not durably persist a change.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed input rejected before reaching the policy.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Challenge is unknown, already consumed or expired.
    #[error("invalid or expired challenge")]
    InvalidChallenge,

    /// Challenge was issued to a different wallet.
    #[error("challenge does not match wallet")]
    ChallengeMismatch,

    /// The ownership proof did not verify.
    #[error("ownership proof rejected")]
    OwnershipProofRejected,
}

impl Error {
    /// Returns true if this error means state could not be persisted.
    ///
    /// Transport layers map these to a server error rather than a policy
    /// response.
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Io(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
