//! Structured results of policy operations.
//!
//! Rejections are expected outcomes and are modelled as values. Each type
//! serializes with a `status` tag carrying the wire kind so the transport
//! layer can forward it as-is.

use super::types::{EntitlementStatus, Plan};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of a scan permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanDecision {
    /// The scan may proceed.
    #[serde(rename = "OK")]
    Allowed {
        /// Tier the decision was computed against.
        entitlement: EntitlementStatus,
        /// Scans left in the window, `None` when unbounded.
        remaining_scans: Option<u32>,
        /// Whole days left of an active trial.
        #[serde(skip_serializing_if = "Option::is_none")]
        trial_days_remaining: Option<i64>,
    },
    /// The wallet is blocked.
    Blocked,
    /// Scans are arriving faster than the burst cooldown allows.
    RateLimited {
        /// Seconds until the next scan is accepted, in `1..=cooldown`.
        retry_after: u64,
    },
    /// The FREE daily quota is exhausted.
    LimitReached {
        /// Scans counted in the current window.
        scans_used: u32,
        /// Quota that was hit.
        daily_limit: u32,
    },
}

/// Wire kind of a [`ScanDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    /// Allowed.
    Ok,
    /// Blocked wallet.
    Blocked,
    /// Burst cooldown.
    RateLimited,
    /// Daily quota exhausted.
    LimitReached,
}

impl ScanDecision {
    /// Whether the scan may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// The decision kind.
    #[must_use]
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::Allowed { .. } => DecisionKind::Ok,
            Self::Blocked => DecisionKind::Blocked,
            Self::RateLimited { .. } => DecisionKind::RateLimited,
            Self::LimitReached { .. } => DecisionKind::LimitReached,
        }
    }

    /// Tier the decision applies to.
    #[must_use]
    pub fn entitlement(&self) -> EntitlementStatus {
        match self {
            Self::Allowed { entitlement, .. } => *entitlement,
            Self::Blocked => EntitlementStatus::Blocked,
            Self::RateLimited { .. } | Self::LimitReached { .. } => EntitlementStatus::Free,
        }
    }

    /// Remaining scans for an allowed FREE decision.
    #[must_use]
    pub fn remaining_scans(&self) -> Option<u32> {
        match self {
            Self::Allowed {
                remaining_scans, ..
            } => *remaining_scans,
            _ => None,
        }
    }

    /// Human-readable explanation for rejections.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Allowed { .. } => None,
            Self::Blocked => {
                Some("This wallet is temporarily restricted due to abuse.".to_string())
            }
            Self::RateLimited { retry_after } => {
                Some(format!("Please wait {retry_after} seconds between scans."))
            }
            Self::LimitReached { daily_limit, .. } => Some(format!(
                "Free scan limit reached ({daily_limit}/day). Upgrade to Pro for unlimited protection."
            )),
        }
    }
}

/// Outcome of a self-service trial request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialOutcome {
    /// Trial activated.
    TrialStarted {
        /// End of the new trial.
        trial_expires_at: DateTime<Utc>,
        /// Length of the trial in days.
        trial_days: u32,
    },
    /// Blocked wallets cannot start a trial.
    Blocked,
    /// The wallet already pays for Pro.
    AlreadyPro,
    /// A trial is running.
    TrialActive {
        /// End of the running trial.
        trial_expires_at: DateTime<Utc>,
    },
    /// The one-time trial was already consumed.
    TrialAlreadyUsed {
        /// Current tier.
        entitlement: EntitlementStatus,
    },
}

impl TrialOutcome {
    /// Whether a trial was started.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::TrialStarted { .. })
    }

    /// Human-readable explanation.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::TrialStarted { trial_days, .. } => format!(
                "Pro trial activated! You have {trial_days} days of unlimited scans."
            ),
            Self::Blocked => "This wallet is blocked and cannot start a trial.".to_string(),
            Self::AlreadyPro => "This wallet already has Pro access.".to_string(),
            Self::TrialActive { .. } => "Trial is already active.".to_string(),
            Self::TrialAlreadyUsed { .. } => "This wallet has already used its free trial. \
                 Upgrade to Pro for unlimited access."
                .to_string(),
        }
    }
}

/// Outcome of applying a payment confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentOutcome {
    /// The wallet is now PRO_PAID.
    Upgraded {
        /// Purchased plan.
        plan: Plan,
    },
    /// This session was already applied to this wallet.
    AlreadyProcessed,
    /// Blocked wallets cannot upgrade.
    Blocked,
}

impl PaymentOutcome {
    /// Whether the confirmation is acknowledged (applied now or earlier).
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Blocked)
    }

    /// Human-readable explanation.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Upgraded { plan } => {
                format!("Upgraded to Pro ({plan})! Unlimited scans activated.")
            }
            Self::AlreadyProcessed => "Payment already processed.".to_string(),
            Self::Blocked => "This wallet is blocked and cannot upgrade.".to_string(),
        }
    }
}
