//! Entitlement data model.

use crate::error::{Error, Result};
use crate::identity::WalletAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Usage tier of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementStatus {
    /// Limited daily scans.
    #[default]
    Free,
    /// Unlimited scans for the trial period.
    ProTrial,
    /// Unlimited scans.
    ProPaid,
    /// Access denied.
    Blocked,
}

impl EntitlementStatus {
    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::ProTrial => "PRO_TRIAL",
            Self::ProPaid => "PRO_PAID",
            Self::Blocked => "BLOCKED",
        }
    }

    /// Whether this tier has unbounded scans.
    #[must_use]
    pub const fn is_pro(&self) -> bool {
        matches!(self, Self::ProTrial | Self::ProPaid)
    }
}

impl fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "FREE" => Ok(Self::Free),
            "PRO_TRIAL" => Ok(Self::ProTrial),
            "PRO_PAID" => Ok(Self::ProPaid),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(Error::InvalidInput(format!("invalid status: {other}"))),
        }
    }
}

/// Subscription plan purchased through the payment provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// Billed monthly.
    Monthly,
    /// Billed yearly.
    Annual,
}

impl Plan {
    /// Wire name of the plan.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "annual" => Ok(Self::Annual),
            other => Err(Error::InvalidInput(format!(
                "invalid plan {other:?}, use 'monthly' or 'annual'"
            ))),
        }
    }
}

/// Details of the last applied payment confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInfo {
    /// Payment provider customer id.
    pub customer_id: String,
    /// Subscription id, absent for one-off payments.
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Confirmation token of the applied payment session.
    pub session_id: String,
    /// Purchased plan.
    pub plan: Plan,
    /// When the payment was applied.
    pub paid_at: DateTime<Utc>,
}

/// Persistent per-wallet entitlement state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletRecord {
    /// Normalized wallet address.
    pub identity: WalletAddress,
    /// Current tier.
    pub status: EntitlementStatus,
    /// Start of the current trial; set only while `status` is PRO_TRIAL.
    pub trial_start: Option<DateTime<Utc>>,
    /// Whether the self-service trial has ever been started.
    pub trial_used: bool,
    /// Scans counted in the current window.
    pub scans_today: u32,
    /// Most recent recorded scan, `None` if the wallet never scanned.
    pub last_scan_at: Option<DateTime<Utc>>,
    /// Start of the current counting window.
    pub window_start: DateTime<Utc>,
    /// First creation of the record.
    pub created_at: DateTime<Utc>,
    /// Last applied payment.
    pub payment: Option<PaymentInfo>,
}

impl WalletRecord {
    /// A fresh FREE record created at `now`.
    #[must_use]
    pub fn new(identity: WalletAddress, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            status: EntitlementStatus::Free,
            trial_start: None,
            trial_used: false,
            scans_today: 0,
            last_scan_at: None,
            window_start: now,
            created_at: now,
            payment: None,
        }
    }

    /// Session id of the last applied payment, if any.
    #[must_use]
    pub fn payment_session(&self) -> Option<&str> {
        self.payment.as_ref().map(|p| p.session_id.as_str())
    }
}

/// On-disk shape of a record; `trial_used` may be missing in older stores.
#[derive(Deserialize)]
struct StoredRecord {
    identity: WalletAddress,
    #[serde(default)]
    status: EntitlementStatus,
    #[serde(default)]
    trial_start: Option<DateTime<Utc>>,
    #[serde(default)]
    trial_used: Option<bool>,
    #[serde(default)]
    scans_today: u32,
    #[serde(default)]
    last_scan_at: Option<DateTime<Utc>>,
    window_start: DateTime<Utc>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    payment: Option<PaymentInfo>,
}

impl<'de> Deserialize<'de> for WalletRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let stored = StoredRecord::deserialize(deserializer)?;
        Ok(Self {
            trial_used: stored
                .trial_used
                .unwrap_or(stored.trial_start.is_some()),
            identity: stored.identity,
            status: stored.status,
            trial_start: stored.trial_start,
            scans_today: stored.scans_today,
            last_scan_at: stored.last_scan_at,
            window_start: stored.window_start,
            created_at: stored.created_at,
            payment: stored.payment,
        })
    }
}

/// Read-side view of a wallet returned to admin and status callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletInfo {
    /// Record after lazy expiry and window reset.
    #[serde(flatten)]
    pub record: WalletRecord,
    /// Scans left in the current window; only present for FREE wallets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_scans: Option<u32>,
}

/// Trial eligibility summary for a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialStatus {
    /// Wallet address.
    pub wallet: WalletAddress,
    /// Current tier.
    pub entitlement: EntitlementStatus,
    /// Whether the self-service trial was consumed.
    pub trial_used: bool,
    /// Whether `start_trial` would succeed now.
    pub can_start_trial: bool,
    /// End of the active trial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_expires_at: Option<DateTime<Utc>>,
    /// Whole days left in the active trial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_days_remaining: Option<i64>,
}
