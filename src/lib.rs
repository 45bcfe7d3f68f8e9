//! Wallet entitlements for a metered scan service.
//!
//! This crate owns the per-wallet entitlement state machine (FREE, PRO_TRIAL,
//! PRO_PAID, BLOCKED), the FREE-tier scan quota and burst limiter, and the
//! exactly-once application of payment confirmations.
//!
//! # Architecture
//!
//! ```text
//!  transport layer (HTTP, webhooks)
//!            │
//!            ▼
//! ┌──────────────────────┐     ┌──────────────────┐
//! │  EntitlementPolicy   │     │  ChallengeStore  │
//! │  (decisions, tiers)  │     │  (ownership)     │
//! └──────────┬───────────┘     └──────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │  EntitlementStore    │──▶ StoreBackend (memory / JSON / msgpack)
//! └──────────────────────┘
//! ```
//!
//! Policy rejections are returned as values ([`ScanDecision`],
//! [`TrialOutcome`], [`PaymentOutcome`]); only infrastructure failures are
//! surfaced through [`Error`].

pub mod challenge;
pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod event;
pub mod identity;
pub mod payment;
pub mod service;
pub mod store;

pub use challenge::{
    AcceptAllVerifier, Challenge, ChallengeStore, OwnershipVerifier, RejectAllVerifier,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ServiceConfig, StoreBackendKind, StoreFormat};
pub use entitlement::{
    EntitlementPolicy, EntitlementStatus, Limits, PaymentInfo, PaymentOutcome, Plan,
    ScanDecision, TrialOutcome, TrialStatus, WalletInfo, WalletRecord,
};
pub use error::{Error, Result};
pub use event::{EntitlementEvent, EventsChannel, EventsSender};
pub use identity::WalletAddress;
pub use payment::{PaymentConfirmation, PaymentProcessor, ProcessedPayment};
pub use service::{RunningService, ServiceBuilder};
pub use store::{EntitlementStore, FileBackend, MemoryBackend, StoreBackend};
