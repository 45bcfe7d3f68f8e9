//! Wallet ownership challenges.
//!
//! Before a self-service trial or checkout, the caller proves it controls a
//! wallet by signing a one-time challenge message. This module issues the
//! challenges, expires them and guarantees each is consumed at most once.
//! Signature checking itself is delegated to an [`OwnershipVerifier`].

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::identity::WalletAddress;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Random bytes per challenge nonce.
const NONCE_BYTES: usize = 16;

/// Text the wallet signs, followed by the nonce.
pub const CHALLENGE_MESSAGE_PREFIX: &str = "Trial Activation\n\nChallenge: ";

/// Black-box predicate deciding whether `proof` shows control of `wallet`.
pub trait OwnershipVerifier: Send + Sync {
    /// Returns true if `proof` is a valid signature of `message` by `wallet`.
    fn verify(&self, wallet: &WalletAddress, message: &str, proof: &str) -> bool;
}

/// Verifier that rejects every proof. Used when no verifier is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAllVerifier;

impl OwnershipVerifier for RejectAllVerifier {
    fn verify(&self, wallet: &WalletAddress, _message: &str, _proof: &str) -> bool {
        debug!("No ownership verifier configured, rejecting proof for {}", wallet.short());
        false
    }
}

/// Verifier that accepts every non-empty proof. Development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllVerifier;

impl OwnershipVerifier for AcceptAllVerifier {
    fn verify(&self, wallet: &WalletAddress, _message: &str, proof: &str) -> bool {
        warn!(
            "Ownership proof for {} accepted without verification",
            wallet.short()
        );
        !proof.is_empty()
    }
}

/// A freshly issued challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Challenge {
    /// Hex nonce identifying the challenge.
    pub challenge: String,
    /// Exact message the wallet must sign.
    pub message: String,
    /// Seconds until the challenge expires.
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
struct Pending {
    wallet: WalletAddress,
    created_at: DateTime<Utc>,
}

/// Short-lived store of outstanding challenges.
pub struct ChallengeStore {
    pending: Mutex<HashMap<String, Pending>>,
    clock: Arc<dyn Clock>,
    expiry_secs: u64,
}

impl fmt::Debug for ChallengeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeStore")
            .field("pending", &self.pending.lock().len())
            .field("expiry_secs", &self.expiry_secs)
            .finish()
    }
}

impl ChallengeStore {
    /// Create a store whose challenges live for `expiry_secs`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, expiry_secs: u64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            clock,
            expiry_secs,
        }
    }

    /// Issue a challenge for `wallet`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `wallet` is not a well-formed
    /// address.
    pub fn issue(&self, wallet: &str) -> Result<Challenge> {
        let wallet = WalletAddress::parse(wallet)?;
        self.purge_expired();

        let mut bytes = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);

        self.pending.lock().insert(
            nonce.clone(),
            Pending {
                wallet: wallet.clone(),
                created_at: self.clock.now(),
            },
        );

        info!("Challenge generated for {}", wallet.short());
        Ok(Challenge {
            message: challenge_message(&nonce),
            challenge: nonce,
            expires_in: self.expiry_secs,
        })
    }

    /// Verify `proof` over the challenge and consume it.
    ///
    /// The challenge is only consumed once the proof verifies, so a bad
    /// signature does not burn a valid challenge.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidChallenge`] if the challenge is unknown or expired
    /// - [`Error::ChallengeMismatch`] if it was issued to another wallet
    /// - [`Error::OwnershipProofRejected`] if the verifier refuses the proof
    pub fn verify_and_consume(
        &self,
        wallet: &str,
        challenge: &str,
        proof: &str,
        verifier: &dyn OwnershipVerifier,
    ) -> Result<WalletAddress> {
        let wallet = WalletAddress::normalize(wallet);
        self.purge_expired();

        let mut pending = self.pending.lock();
        let entry = pending.get(challenge).ok_or(Error::InvalidChallenge)?;
        if entry.wallet != wallet {
            return Err(Error::ChallengeMismatch);
        }
        if !verifier.verify(&wallet, &challenge_message(challenge), proof) {
            return Err(Error::OwnershipProofRejected);
        }
        pending.remove(challenge);

        debug!("Challenge consumed for {}", wallet.short());
        Ok(wallet)
    }

    /// Drop expired challenges; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let ttl = i64::try_from(self.expiry_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| now - p.created_at <= ttl);
        before - pending.len()
    }

    /// Number of outstanding challenges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no challenges are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Message signed for a challenge nonce.
#[must_use]
pub fn challenge_message(nonce: &str) -> String {
    format!("{CHALLENGE_MESSAGE_PREFIX}{nonce}")
}
