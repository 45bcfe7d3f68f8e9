//! Applies verified payment confirmations to wallets.

use crate::entitlement::{EntitlementPolicy, EntitlementStatus, PaymentOutcome, Plan};
use crate::error::{Error, Result};
use crate::identity::WalletAddress;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provider event type carrying a completed checkout.
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// A verified notification that a payment completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    /// Unique confirmation token.
    pub session_id: String,
    /// Wallet the payment was made for.
    pub identity: String,
    /// Purchased plan.
    pub plan: Plan,
    /// Provider customer id.
    pub customer_id: String,
    /// Provider subscription id, absent for one-off payments.
    #[serde(default)]
    pub subscription_id: Option<String>,
}

impl PaymentConfirmation {
    /// Extract a confirmation from a signature-verified provider event.
    ///
    /// Returns `Ok(None)` for event types other than a completed checkout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if a completed checkout lacks the
    /// wallet, plan or session id.
    pub fn from_provider_event(event: &Value) -> Result<Option<Self>> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
        if event_type != CHECKOUT_COMPLETED {
            debug!("Ignoring payment event of type {:?}", event_type);
            return Ok(None);
        }

        let session = event
            .pointer("/data/object")
            .ok_or_else(|| Error::InvalidInput("event has no data.object".into()))?;
        let text = |pointer: &str| session.pointer(pointer).and_then(Value::as_str);

        let session_id = text("/id")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidInput("checkout session has no id".into()))?;
        let identity = text("/metadata/wallet_address")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::InvalidInput(format!("no wallet in session metadata: {session_id}"))
            })?;
        let plan = text("/metadata/plan")
            .ok_or_else(|| Error::InvalidInput(format!("no plan in session: {session_id}")))?
            .parse()?;

        Ok(Some(Self {
            session_id: session_id.to_string(),
            identity: identity.to_string(),
            plan,
            customer_id: text("/customer").unwrap_or_default().to_string(),
            subscription_id: text("/subscription").map(str::to_string),
        }))
    }
}

/// Result of processing a confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessedPayment {
    /// The wallet was upgraded by this confirmation.
    Upgraded {
        /// Upgraded wallet.
        wallet: WalletAddress,
        /// Purchased plan.
        plan: Plan,
    },
    /// The session had already been applied.
    AlreadyProcessed,
    /// The policy refused the payment.
    Rejected {
        /// Refusal returned by the policy.
        outcome: PaymentOutcome,
    },
}

/// Whether a wallet may open a new checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutEligibility {
    /// The wallet may buy Pro.
    Eligible,
    /// Blocked wallets cannot upgrade.
    Blocked,
    /// The wallet already pays for Pro.
    AlreadyPro,
}

/// Runs confirmations through both duplicate guards and the policy.
pub struct PaymentProcessor {
    policy: Arc<EntitlementPolicy>,
}

impl PaymentProcessor {
    /// Create a processor over `policy`.
    #[must_use]
    pub fn new(policy: Arc<EntitlementPolicy>) -> Self {
        Self { policy }
    }

    /// Apply a confirmation exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for confirmations without a wallet or
    /// session, and a persistence error if the upgrade cannot be stored.
    pub fn process(&self, confirmation: &PaymentConfirmation) -> Result<ProcessedPayment> {
        if confirmation.identity.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "no wallet for session {}",
                confirmation.session_id
            )));
        }
        if confirmation.session_id.is_empty() {
            return Err(Error::InvalidInput("empty payment session id".into()));
        }

        if self.policy.is_session_processed(&confirmation.session_id) {
            info!("Session already processed: {}", confirmation.session_id);
            return Ok(ProcessedPayment::AlreadyProcessed);
        }

        let outcome = self.policy.apply_payment(
            &confirmation.identity,
            &confirmation.customer_id,
            &confirmation.session_id,
            confirmation.plan,
            confirmation.subscription_id.as_deref(),
        )?;

        Ok(match outcome {
            PaymentOutcome::Upgraded { plan } => ProcessedPayment::Upgraded {
                wallet: WalletAddress::normalize(&confirmation.identity),
                plan,
            },
            PaymentOutcome::AlreadyProcessed => ProcessedPayment::AlreadyProcessed,
            PaymentOutcome::Blocked => {
                warn!(
                    "Payment {} not applied: {}",
                    confirmation.session_id,
                    outcome.message()
                );
                ProcessedPayment::Rejected { outcome }
            }
        })
    }

    /// Check whether `identity` may start a checkout.
    pub fn checkout_eligibility(&self, identity: &str) -> CheckoutEligibility {
        match self.policy.get_wallet_info(identity).record.status {
            EntitlementStatus::Blocked => CheckoutEligibility::Blocked,
            EntitlementStatus::ProPaid => CheckoutEligibility::AlreadyPro,
            EntitlementStatus::Free | EntitlementStatus::ProTrial => CheckoutEligibility::Eligible,
        }
    }
}
