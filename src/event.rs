//! Entitlement event system.

use crate::entitlement::{EntitlementStatus, Plan};
use crate::identity::WalletAddress;
use tokio::sync::broadcast;

/// Events emitted by the service and the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementEvent {
    /// Service has started.
    Started,

    /// Service is shutting down.
    ShuttingDown,

    /// A scan was counted against a wallet.
    ScanRecorded {
        /// Wallet.
        wallet: WalletAddress,
        /// Scans in the current window after recording.
        scans_today: u32,
    },

    /// A self-service trial was started.
    TrialStarted {
        /// Wallet.
        wallet: WalletAddress,
    },

    /// A trial ran out and the wallet reverted to FREE.
    TrialExpired {
        /// Wallet.
        wallet: WalletAddress,
    },

    /// An administrator changed a wallet's tier.
    StatusChanged {
        /// Wallet.
        wallet: WalletAddress,
        /// New tier.
        status: EntitlementStatus,
    },

    /// A payment confirmation upgraded a wallet.
    PaymentApplied {
        /// Wallet.
        wallet: WalletAddress,
        /// Payment session token.
        session_id: String,
        /// Purchased plan.
        plan: Plan,
    },

    /// A wallet record was deleted.
    IdentityReset {
        /// Wallet.
        wallet: WalletAddress,
    },

    /// A non-fatal error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving entitlement events.
pub type EventsChannel = broadcast::Receiver<EntitlementEvent>;

/// Sender for entitlement events.
pub type EventsSender = broadcast::Sender<EntitlementEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (EventsSender, EventsChannel) {
    broadcast::channel(256)
}
