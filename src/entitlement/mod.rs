//! Entitlement state machine and scan rate limiting.
//!
//! # Tiers
//!
//! ```text
//!            start_trial (once)          expiry (lazy, on read)
//!   FREE ───────────────────▶ PRO_TRIAL ───────────────────▶ FREE
//!    │                           │
//!    │ apply_payment             │ apply_payment
//!    ▼                           ▼
//!  PRO_PAID ◀────────────────────┘
//!
//!  set_status may move any wallet to any tier (BLOCKED included).
//! ```
//!
//! FREE wallets get a fixed number of scans per rolling window and must wait
//! a cooldown between scans. The cooldown is checked before the quota.

mod decision;
mod policy;
mod types;

pub use decision::{DecisionKind, PaymentOutcome, ScanDecision, TrialOutcome};
pub use policy::EntitlementPolicy;
pub use types::{EntitlementStatus, PaymentInfo, Plan, TrialStatus, WalletInfo, WalletRecord};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Quota and trial parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// FREE scans allowed per window.
    #[serde(default = "default_daily_scan_limit")]
    pub daily_scan_limit: u32,

    /// Minimum seconds between two FREE scans.
    #[serde(default = "default_burst_cooldown")]
    pub burst_cooldown_secs: u32,

    /// Length of the self-service trial in days.
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,

    /// Length of the counting window in hours.
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            daily_scan_limit: default_daily_scan_limit(),
            burst_cooldown_secs: default_burst_cooldown(),
            trial_days: default_trial_days(),
            window_hours: default_window_hours(),
        }
    }
}

impl Limits {
    /// Trial length.
    #[must_use]
    pub fn trial_duration(&self) -> Duration {
        Duration::days(i64::from(self.trial_days))
    }

    /// End of a trial started at `start`, saturating at the latest
    /// representable time.
    #[must_use]
    pub fn trial_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_signed(self.trial_duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Counting window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::hours(i64::from(self.window_hours))
    }

    /// Minimum spacing between FREE scans.
    #[must_use]
    pub fn burst_cooldown(&self) -> Duration {
        Duration::seconds(i64::from(self.burst_cooldown_secs))
    }
}

const fn default_daily_scan_limit() -> u32 {
    5
}

const fn default_burst_cooldown() -> u32 {
    10
}

const fn default_trial_days() -> u32 {
    7
}

const fn default_window_hours() -> u32 {
    24
}
