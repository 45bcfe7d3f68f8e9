//! Payment confirmation processing.
//!
//! Confirmations arrive from the payment provider's webhook with
//! at-least-once delivery. Each one goes through two duplicate guards:
//!
//! ```text
//! confirmation received
//!        │
//!        ▼
//! ┌──────────────────────────┐
//! │ is_session_processed     │  store-wide, advisory
//! │ (session cache + scan)   │
//! └─────────┬────────────────┘
//!           │
//!    ┌──────┴──────┐
//!    │             │
//!   SEEN        UNSEEN
//!    │             │
//!    ▼             ▼
//!  ack        apply_payment     per-wallet, authoritative
//!                  │
//!        ┌─────────┼───────────┐
//!        ▼         ▼           ▼
//!    UPGRADED  ALREADY_     BLOCKED
//!              PROCESSED
//! ```

mod cache;
mod processor;

pub use cache::{CacheStats, SessionCache};
pub use processor::{CheckoutEligibility, PaymentConfirmation, PaymentProcessor, ProcessedPayment};
