//! Wallet identities.
//!
//! Entitlement records are keyed by the lowercase form of the wallet address.
//! [`WalletAddress::normalize`] is the lenient constructor used on the
//! decision path; [`WalletAddress::parse`] is the strict form the transport
//! layer applies to user input before anything reaches the policy.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Length of a `0x`-prefixed 20-byte hex address.
pub const ADDRESS_LEN: usize = 42;

/// A normalized (lowercase) wallet address.
///
/// Deserialization normalizes, so addresses read back from a store compare
/// equal to those built from request input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WalletAddress(String);

impl<'de> Deserialize<'de> for WalletAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl WalletAddress {
    /// Normalize an address string without validating its shape.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    /// Parse and normalize a strictly formatted `0x` + 40 hex digit address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the address is not well formed.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = Self::normalize(raw);
        if is_valid_address(normalized.as_str()) {
            Ok(normalized)
        } else {
            Err(Error::InvalidInput(format!("invalid wallet address: {raw}")))
        }
    }

    /// The normalized address.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..10).unwrap_or(&self.0)
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletAddress {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

impl From<String> for WalletAddress {
    fn from(raw: String) -> Self {
        Self::normalize(&raw)
    }
}

impl AsRef<str> for WalletAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Check whether a normalized `address` is `0x` followed by exactly 40 hex
/// digits.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    address.len() == ADDRESS_LEN
        && address.starts_with("0x")
        && hex::decode(&address[2..]).is_ok()
}
