//! Entitlement decisions and tier transitions.
//!
//! Every operation takes a raw wallet string and normalizes it before
//! touching the store. Reads heal stale state (expired trials, elapsed
//! windows) and persist the healed record; a failure to persist a heal is
//! logged and reported as an event but does not fail the read, since the
//! same heal is recomputed on the next access.

use super::decision::{PaymentOutcome, ScanDecision, TrialOutcome};
use super::types::{EntitlementStatus, PaymentInfo, Plan, TrialStatus, WalletInfo, WalletRecord};
use super::Limits;
use crate::clock::Clock;
use crate::error::Result;
use crate::event::{EntitlementEvent, EventsSender};
use crate::identity::WalletAddress;
use crate::payment::SessionCache;
use crate::store::EntitlementStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decision logic over an [`EntitlementStore`].
pub struct EntitlementPolicy {
    store: Arc<EntitlementStore>,
    clock: Arc<dyn Clock>,
    limits: Limits,
    sessions: SessionCache,
    events: Option<EventsSender>,
}

/// What a heal pass changed.
#[derive(Debug, Clone, Copy, Default)]
struct Healed {
    trial_expired: bool,
    window_reset: bool,
}

impl EntitlementPolicy {
    /// Create a policy over `store`, reading time from the store's clock.
    #[must_use]
    pub fn new(store: Arc<EntitlementStore>, limits: Limits) -> Self {
        let clock = Arc::clone(store.clock());
        Self {
            store,
            clock,
            limits,
            sessions: SessionCache::new(),
            events: None,
        }
    }

    /// Publish events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventsSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Use a processed-session cache of the given capacity.
    #[must_use]
    pub fn with_session_cache_capacity(mut self, capacity: usize) -> Self {
        self.sessions = SessionCache::with_capacity(capacity);
        self
    }

    /// Configured limits.
    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<EntitlementStore> {
        &self.store
    }

    /// Processed-session cache.
    #[must_use]
    pub fn session_cache(&self) -> &SessionCache {
        &self.sessions
    }

    /// Decide whether `identity` may scan now, without consuming quota.
    ///
    /// Callers that go on to scan must call [`Self::record_scan`]; prefer
    /// [`Self::try_consume_scan`], which does both atomically.
    pub fn check_scan_permission(&self, identity: &str) -> ScanDecision {
        let wallet = WalletAddress::normalize(identity);
        let now = self.clock.now();

        self.read_healed(&wallet, now, |record| self.evaluate(record, now))
    }

    /// Count a scan for `identity`.
    ///
    /// Does not check permission.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan cannot be persisted.
    pub fn record_scan(&self, identity: &str) -> Result<()> {
        let wallet = WalletAddress::normalize(identity);
        let now = self.clock.now();

        let scans_today = self.store.modify(&wallet, |record| {
            record.scans_today = record.scans_today.saturating_add(1);
            record.last_scan_at = Some(now);
            record.scans_today
        })?;

        debug!("Scan recorded for {} ({} today)", wallet.short(), scans_today);
        self.emit(EntitlementEvent::ScanRecorded {
            wallet,
            scans_today,
        });
        Ok(())
    }

    /// Check permission and, if allowed, count the scan in one atomic step.
    ///
    /// The returned decision is the one the scan was admitted under; an
    /// allowed FREE decision reports `remaining_scans` as it stood before
    /// this scan was counted.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumed scan cannot be persisted; no quota is
    /// consumed in that case.
    pub fn try_consume_scan(&self, identity: &str) -> Result<ScanDecision> {
        let wallet = WalletAddress::normalize(identity);
        let now = self.clock.now();

        let (decision, healed, scans_today) = self.store.modify(&wallet, |record| {
            let healed = self.heal(record, now);
            let decision = self.evaluate(record, now);
            if decision.is_allowed() {
                record.scans_today = record.scans_today.saturating_add(1);
                record.last_scan_at = Some(now);
            }
            (decision, healed, record.scans_today)
        })?;

        self.after_heal(&wallet, healed);
        if decision.is_allowed() {
            self.emit(EntitlementEvent::ScanRecorded {
                wallet,
                scans_today,
            });
        }
        Ok(decision)
    }

    /// Snapshot of a wallet after lazy expiry and window reset.
    pub fn get_wallet_info(&self, identity: &str) -> WalletInfo {
        let wallet = WalletAddress::normalize(identity);
        let now = self.clock.now();

        self.read_healed(&wallet, now, |record| WalletInfo {
            remaining_scans: (record.status == EntitlementStatus::Free)
                .then(|| self.limits.daily_scan_limit.saturating_sub(record.scans_today)),
            record: record.clone(),
        })
    }

    /// Trial eligibility of a wallet.
    pub fn trial_status(&self, identity: &str) -> TrialStatus {
        let wallet = WalletAddress::normalize(identity);
        let now = self.clock.now();

        self.read_healed(&wallet, now, |record| {
            let trial_end = (record.status == EntitlementStatus::ProTrial)
                .then(|| record.trial_start.map(|start| self.limits.trial_end(start)))
                .flatten();
            TrialStatus {
                wallet: record.identity.clone(),
                entitlement: record.status,
                trial_used: record.trial_used,
                can_start_trial: record.status == EntitlementStatus::Free && !record.trial_used,
                trial_expires_at: trial_end,
                trial_days_remaining: trial_end.map(|end| days_until(end, now)),
            }
        })
    }

    /// Administrative tier override.
    ///
    /// Moving to PRO_TRIAL stamps a new trial start but leaves `trial_used`
    /// alone, so an administrative grant does not consume the self-service
    /// trial.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be persisted.
    pub fn set_status(&self, identity: &str, status: EntitlementStatus) -> Result<WalletRecord> {
        let wallet = WalletAddress::normalize(identity);
        let now = self.clock.now();

        let record = self.store.modify(&wallet, |record| {
            record.status = status;
            record.trial_start = (status == EntitlementStatus::ProTrial).then_some(now);
            record.clone()
        })?;

        info!("Status of {} set to {}", wallet.short(), status);
        self.emit(EntitlementEvent::StatusChanged { wallet, status });
        Ok(record)
    }

    /// Delete all state for a wallet; returns whether a record existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion cannot be persisted.
    pub fn reset_identity(&self, identity: &str) -> Result<bool> {
        let wallet = WalletAddress::normalize(identity);

        let Some(removed) = self.store.delete(&wallet)? else {
            return Ok(false);
        };
        if let Some(session_id) = removed.payment_session() {
            self.sessions.invalidate(session_id);
        }

        info!("Wallet {} reset", wallet.short());
        self.emit(EntitlementEvent::IdentityReset { wallet });
        Ok(true)
    }

    /// Start the one-time self-service trial.
    ///
    /// Ownership of the wallet must have been proven by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the outcome cannot be persisted.
    pub fn start_trial(&self, identity: &str) -> Result<TrialOutcome> {
        let wallet = WalletAddress::normalize(identity);
        let now = self.clock.now();

        let (outcome, trial_expired) = self.store.modify(&wallet, |record| {
            let trial_expired = self.expire_trial(record, now);

            let status = record.status;
            let outcome = match status {
                EntitlementStatus::Blocked => TrialOutcome::Blocked,
                EntitlementStatus::ProPaid => TrialOutcome::AlreadyPro,
                EntitlementStatus::ProTrial => TrialOutcome::TrialActive {
                    trial_expires_at: self.limits.trial_end(record.trial_start.unwrap_or(now)),
                },
                EntitlementStatus::Free if record.trial_used => {
                    TrialOutcome::TrialAlreadyUsed {
                        entitlement: status,
                    }
                }
                EntitlementStatus::Free => {
                    record.status = EntitlementStatus::ProTrial;
                    record.trial_start = Some(now);
                    record.trial_used = true;
                    TrialOutcome::TrialStarted {
                        trial_expires_at: self.limits.trial_end(now),
                        trial_days: self.limits.trial_days,
                    }
                }
            };
            (outcome, trial_expired)
        })?;

        self.after_heal(
            &wallet,
            Healed {
                trial_expired,
                window_reset: false,
            },
        );
        if outcome.is_success() {
            info!("Trial started for {}", wallet.short());
            self.emit(EntitlementEvent::TrialStarted { wallet });
        } else {
            debug!("Trial refused for {}: {:?}", wallet.short(), outcome);
        }
        Ok(outcome)
    }

    /// Apply a payment confirmation to a wallet.
    ///
    /// Re-delivery of the session already recorded on a PRO_PAID wallet is
    /// acknowledged without changes. A different session overwrites the
    /// stored payment.
    ///
    /// # Errors
    ///
    /// Returns an error if the upgrade cannot be persisted.
    pub fn apply_payment(
        &self,
        identity: &str,
        customer_id: &str,
        session_id: &str,
        plan: Plan,
        subscription_id: Option<&str>,
    ) -> Result<PaymentOutcome> {
        let wallet = WalletAddress::normalize(identity);
        let now = self.clock.now();

        let outcome = self.store.modify(&wallet, |record| {
            match record.status {
                EntitlementStatus::Blocked => return PaymentOutcome::Blocked,
                EntitlementStatus::ProPaid if record.payment_session() == Some(session_id) => {
                    return PaymentOutcome::AlreadyProcessed;
                }
                _ => {}
            }

            record.status = EntitlementStatus::ProPaid;
            record.trial_start = None;
            record.payment = Some(PaymentInfo {
                customer_id: customer_id.to_string(),
                subscription_id: subscription_id.map(str::to_string),
                session_id: session_id.to_string(),
                plan,
                paid_at: now,
            });
            PaymentOutcome::Upgraded { plan }
        })?;

        match outcome {
            PaymentOutcome::Upgraded { plan } => {
                self.sessions.insert(session_id, wallet.clone());
                info!("Upgraded {} to PRO_PAID ({})", wallet.short(), plan);
                self.emit(EntitlementEvent::PaymentApplied {
                    wallet,
                    session_id: session_id.to_string(),
                    plan,
                });
            }
            PaymentOutcome::AlreadyProcessed => {
                debug!("Session {} already applied to {}", session_id, wallet.short());
            }
            PaymentOutcome::Blocked => {
                warn!("Payment {} refused: wallet {} is blocked", session_id, wallet.short());
            }
        }
        Ok(outcome)
    }

    /// Whether any wallet's last applied payment carries `session_id`.
    pub fn is_session_processed(&self, session_id: &str) -> bool {
        if let Some(wallet) = self.sessions.get(session_id) {
            let confirmed = self
                .store
                .peek(&wallet)
                .is_some_and(|record| record.payment_session() == Some(session_id));
            if confirmed {
                return true;
            }
            self.sessions.invalidate(session_id);
        }

        match self.store.find_by_payment_session(session_id) {
            Some(record) => {
                self.sessions.insert(session_id, record.identity);
                true
            }
            None => false,
        }
    }

    /// Run `read` against the healed record, persisting the heal if possible.
    fn read_healed<T>(
        &self,
        wallet: &WalletAddress,
        now: DateTime<Utc>,
        read: impl Fn(&WalletRecord) -> T,
    ) -> T {
        match self.store.modify(wallet, |record| {
            let healed = self.heal(record, now);
            (read(record), healed)
        }) {
            Ok((value, healed)) => {
                self.after_heal(wallet, healed);
                value
            }
            Err(e) => {
                warn!(
                    "Could not persist healed record for {}: {}",
                    wallet.short(),
                    e
                );
                self.emit(EntitlementEvent::Error {
                    message: format!("heal of {} not persisted: {e}", wallet.short()),
                });
                let mut record = self
                    .store
                    .peek(wallet)
                    .unwrap_or_else(|| WalletRecord::new(wallet.clone(), now));
                self.heal(&mut record, now);
                read(&record)
            }
        }
    }

    /// Apply lazy trial expiry and window reset.
    fn heal(&self, record: &mut WalletRecord, now: DateTime<Utc>) -> Healed {
        let trial_expired = self.expire_trial(record, now);

        let window_reset = now - record.window_start >= self.limits.window();
        if window_reset {
            record.scans_today = 0;
            record.window_start = now;
        }

        Healed {
            trial_expired,
            window_reset,
        }
    }

    /// Revert an expired trial to FREE.
    fn expire_trial(&self, record: &mut WalletRecord, now: DateTime<Utc>) -> bool {
        if record.status != EntitlementStatus::ProTrial {
            return false;
        }
        let Some(start) = record.trial_start else {
            return false;
        };
        if now > self.limits.trial_end(start) {
            record.status = EntitlementStatus::Free;
            record.trial_start = None;
            true
        } else {
            false
        }
    }

    fn after_heal(&self, wallet: &WalletAddress, healed: Healed) {
        if healed.trial_expired {
            info!("Trial expired for {}, reverted to FREE", wallet.short());
            self.emit(EntitlementEvent::TrialExpired {
                wallet: wallet.clone(),
            });
        }
        if healed.window_reset {
            debug!("Scan window reset for {}", wallet.short());
        }
    }

    /// Decide on a healed record.
    fn evaluate(&self, record: &WalletRecord, now: DateTime<Utc>) -> ScanDecision {
        match record.status {
            EntitlementStatus::Blocked => ScanDecision::Blocked,
            EntitlementStatus::ProPaid => ScanDecision::Allowed {
                entitlement: EntitlementStatus::ProPaid,
                remaining_scans: None,
                trial_days_remaining: None,
            },
            EntitlementStatus::ProTrial => ScanDecision::Allowed {
                entitlement: EntitlementStatus::ProTrial,
                remaining_scans: None,
                trial_days_remaining: Some(
                    record
                        .trial_start
                        .map_or(0, |start| days_until(self.limits.trial_end(start), now)),
                ),
            },
            EntitlementStatus::Free => self.evaluate_free(record, now),
        }
    }

    fn evaluate_free(&self, record: &WalletRecord, now: DateTime<Utc>) -> ScanDecision {
        // Cooldown first: a capped wallet scanning again too soon is RATE_LIMITED.
        if let Some(last) = record.last_scan_at {
            let elapsed = now - last;
            let cooldown = self.limits.burst_cooldown();
            if elapsed < cooldown {
                let wait_ms = (cooldown - elapsed).num_milliseconds();
                let max = u64::from(self.limits.burst_cooldown_secs.max(1));
                let retry_after = u64::try_from((wait_ms + 999) / 1000)
                    .unwrap_or(max)
                    .clamp(1, max);
                return ScanDecision::RateLimited { retry_after };
            }
        }

        if record.scans_today >= self.limits.daily_scan_limit {
            return ScanDecision::LimitReached {
                scans_used: record.scans_today,
                daily_limit: self.limits.daily_scan_limit,
            };
        }

        ScanDecision::Allowed {
            entitlement: EntitlementStatus::Free,
            remaining_scans: Some(self.limits.daily_scan_limit - record.scans_today),
            trial_days_remaining: None,
        }
    }

    fn emit(&self, event: EntitlementEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Whole days from `now` until `end`, floored at zero.
fn days_until(end: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (end - now).num_days().max(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::event::create_event_channel;
    use crate::store::MemoryBackend;
    use chrono::{Duration, TimeZone};

    const WALLET: &str = "0xTEST0001";

    struct Fixture {
        policy: EntitlementPolicy,
        backend: MemoryBackend,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryBackend::new())
    }

    fn fixture_with(backend: MemoryBackend) -> Fixture {
        let start = Utc
            .with_ymd_and_hms(2026, 5, 1, 9, 0, 0)
            .single()
            .expect("valid date");
        let clock = ManualClock::new(start);
        let store = EntitlementStore::open(backend.clone(), Arc::new(clock.clone()));
        let policy = EntitlementPolicy::new(Arc::new(store), Limits::default());
        Fixture {
            policy,
            backend,
            clock,
        }
    }

    fn record_of(f: &Fixture, wallet: &str) -> WalletRecord {
        f.policy
            .store()
            .peek(&WalletAddress::normalize(wallet))
            .expect("record exists")
    }

    #[test]
    fn test_new_wallet_is_free_with_full_quota() {
        let f = fixture();
        let decision = f.policy.check_scan_permission(WALLET);

        assert_eq!(
            decision,
            ScanDecision::Allowed {
                entitlement: EntitlementStatus::Free,
                remaining_scans: Some(5),
                trial_days_remaining: None,
            }
        );
        let record = record_of(&f, WALLET);
        assert_eq!(record.status, EntitlementStatus::Free);
        assert_eq!(record.scans_today, 0);
        assert_eq!(record.window_start, f.clock.now());
    }

    #[test]
    fn test_free_wallet_gets_five_spaced_scans_then_limit() {
        let f = fixture();

        for i in 0..5 {
            let decision = f.policy.check_scan_permission(WALLET);
            assert!(decision.is_allowed(), "scan {} should be allowed", i + 1);
            assert_eq!(decision.remaining_scans(), Some(5 - i));
            f.policy.record_scan(WALLET).expect("record");
            f.clock.advance_secs(10);
        }

        let decision = f.policy.check_scan_permission(WALLET);
        assert_eq!(
            decision,
            ScanDecision::LimitReached {
                scans_used: 5,
                daily_limit: 5
            }
        );
    }

    #[test]
    fn test_burst_within_cooldown_is_rate_limited() {
        let f = fixture();
        assert!(f.policy.check_scan_permission(WALLET).is_allowed());
        f.policy.record_scan(WALLET).expect("record");

        let decision = f.policy.check_scan_permission(WALLET);
        assert_eq!(decision, ScanDecision::RateLimited { retry_after: 10 });

        f.clock.advance(Duration::milliseconds(3_500));
        assert_eq!(
            f.policy.check_scan_permission(WALLET),
            ScanDecision::RateLimited { retry_after: 7 }
        );

        f.clock.advance(Duration::milliseconds(6_000));
        assert_eq!(
            f.policy.check_scan_permission(WALLET),
            ScanDecision::RateLimited { retry_after: 1 }
        );

        f.clock.advance(Duration::milliseconds(500));
        assert!(f.policy.check_scan_permission(WALLET).is_allowed());
    }

    #[test]
    fn test_burst_takes_precedence_over_daily_limit() {
        let f = fixture();
        for _ in 0..5 {
            f.policy.record_scan(WALLET).expect("record");
        }

        f.clock.advance_secs(3);
        let decision = f.policy.check_scan_permission(WALLET);
        assert_eq!(decision, ScanDecision::RateLimited { retry_after: 7 });

        f.clock.advance_secs(7);
        assert!(matches!(
            f.policy.check_scan_permission(WALLET),
            ScanDecision::LimitReached { scans_used: 5, .. }
        ));
    }

    #[test]
    fn test_window_reset_without_intervening_scan() {
        let f = fixture();
        for _ in 0..5 {
            f.policy.record_scan(WALLET).expect("record");
        }

        f.clock.advance(Duration::hours(24));
        let decision = f.policy.check_scan_permission(WALLET);

        assert_eq!(decision.remaining_scans(), Some(5));
        let record = record_of(&f, WALLET);
        assert_eq!(record.scans_today, 0);
        assert_eq!(record.window_start, f.clock.now());
        assert_eq!(
            f.backend
                .saved_record(&WalletAddress::normalize(WALLET))
                .map(|r| r.scans_today),
            Some(0)
        );
    }

    #[test]
    fn test_window_not_reset_before_full_period() {
        let f = fixture();
        f.policy.record_scan(WALLET).expect("record");
        f.clock.advance(Duration::hours(24) - Duration::seconds(1));

        assert_eq!(f.policy.check_scan_permission(WALLET).remaining_scans(), Some(4));
    }

    #[test]
    fn test_pro_tiers_are_unlimited() {
        let f = fixture();
        f.policy
            .set_status(WALLET, EntitlementStatus::ProPaid)
            .expect("set");

        for _ in 0..10 {
            let decision = f.policy.check_scan_permission(WALLET);
            assert_eq!(decision.entitlement(), EntitlementStatus::ProPaid);
            assert_eq!(decision.remaining_scans(), None);
            f.policy.record_scan(WALLET).expect("record");
        }

        f.policy
            .set_status("0xTRIAL", EntitlementStatus::ProTrial)
            .expect("set");
        for _ in 0..10 {
            let decision = f.policy.check_scan_permission("0xTRIAL");
            assert_eq!(
                decision,
                ScanDecision::Allowed {
                    entitlement: EntitlementStatus::ProTrial,
                    remaining_scans: None,
                    trial_days_remaining: Some(7),
                }
            );
            f.policy.record_scan("0xTRIAL").expect("record");
        }
    }

    #[test]
    fn test_blocked_wallet_denied() {
        let f = fixture();
        f.policy
            .set_status(WALLET, EntitlementStatus::Blocked)
            .expect("set");

        let decision = f.policy.check_scan_permission(WALLET);
        assert_eq!(decision, ScanDecision::Blocked);
        assert!(decision.message().is_some_and(|m| m.contains("restricted")));
    }

    #[test]
    fn test_admin_trial_grant_does_not_consume_self_service_trial() {
        let f = fixture();
        let before = f.clock.now();
        let record = f
            .policy
            .set_status(WALLET, EntitlementStatus::ProTrial)
            .expect("set");

        assert_eq!(record.trial_start, Some(before));
        assert!(!record.trial_used);

        let record = f
            .policy
            .set_status(WALLET, EntitlementStatus::Free)
            .expect("set");
        assert!(record.trial_start.is_none());

        assert!(f.policy.start_trial(WALLET).expect("trial").is_success());
    }

    #[test]
    fn test_trial_lifecycle() {
        let f = fixture();

        let outcome = f.policy.start_trial(WALLET).expect("start");
        assert_eq!(
            outcome,
            TrialOutcome::TrialStarted {
                trial_expires_at: f.clock.now() + Duration::days(7),
                trial_days: 7,
            }
        );
        let record = record_of(&f, WALLET);
        assert_eq!(record.status, EntitlementStatus::ProTrial);
        assert!(record.trial_used);

        f.clock.advance(Duration::days(2));
        assert!(matches!(
            f.policy.start_trial(WALLET).expect("second"),
            TrialOutcome::TrialActive { .. }
        ));
        assert_eq!(
            f.policy.check_scan_permission(WALLET),
            ScanDecision::Allowed {
                entitlement: EntitlementStatus::ProTrial,
                remaining_scans: None,
                trial_days_remaining: Some(5),
            }
        );

        f.clock.advance(Duration::days(5) + Duration::seconds(1));
        let decision = f.policy.check_scan_permission(WALLET);
        assert_eq!(decision.entitlement(), EntitlementStatus::Free);
        let record = record_of(&f, WALLET);
        assert_eq!(record.status, EntitlementStatus::Free);
        assert!(record.trial_start.is_none());
        assert!(record.trial_used);

        assert_eq!(
            f.policy.start_trial(WALLET).expect("retry"),
            TrialOutcome::TrialAlreadyUsed {
                entitlement: EntitlementStatus::Free
            }
        );
    }

    #[test]
    fn test_trial_still_active_at_exact_end() {
        let f = fixture();
        f.policy.start_trial(WALLET).expect("start");
        f.clock.advance(Duration::days(7));

        let decision = f.policy.check_scan_permission(WALLET);
        assert_eq!(decision.entitlement(), EntitlementStatus::ProTrial);
        assert!(matches!(
            decision,
            ScanDecision::Allowed {
                trial_days_remaining: Some(0),
                ..
            }
        ));
    }

    #[test]
    fn test_start_trial_expires_lazily_before_checks() {
        let f = fixture();
        f.policy.start_trial(WALLET).expect("start");
        f.clock.advance(Duration::days(8));

        // No read in between: start_trial itself must see the expiry.
        assert!(matches!(
            f.policy.start_trial(WALLET).expect("retry"),
            TrialOutcome::TrialAlreadyUsed { .. }
        ));
        assert_eq!(record_of(&f, WALLET).status, EntitlementStatus::Free);
    }

    #[test]
    fn test_start_trial_rejections() {
        let f = fixture();
        f.policy
            .set_status("0xBLOCKED", EntitlementStatus::Blocked)
            .expect("set");
        f.policy
            .set_status("0xPAID", EntitlementStatus::ProPaid)
            .expect("set");

        assert_eq!(
            f.policy.start_trial("0xBLOCKED").expect("blocked"),
            TrialOutcome::Blocked
        );
        assert_eq!(
            f.policy.start_trial("0xPAID").expect("paid"),
            TrialOutcome::AlreadyPro
        );
        assert!(!record_of(&f, "0xBLOCKED").trial_used);
    }

    #[test]
    fn test_apply_payment_is_idempotent_per_session() {
        let f = fixture();
        let first = f
            .policy
            .apply_payment(WALLET, "cus_1", "cs_1", Plan::Monthly, Some("sub_1"))
            .expect("apply");
        assert_eq!(first, PaymentOutcome::Upgraded { plan: Plan::Monthly });
        let paid_at = record_of(&f, WALLET).payment.expect("payment").paid_at;

        f.clock.advance_secs(60);
        let second = f
            .policy
            .apply_payment(WALLET, "cus_1", "cs_1", Plan::Monthly, Some("sub_1"))
            .expect("apply again");
        assert_eq!(second, PaymentOutcome::AlreadyProcessed);

        let payment = record_of(&f, WALLET).payment.expect("payment");
        assert_eq!(payment.paid_at, paid_at);
        assert_eq!(payment.subscription_id.as_deref(), Some("sub_1"));
    }

    #[test]
    fn test_distinct_session_overwrites_payment() {
        let f = fixture();
        f.policy
            .apply_payment(WALLET, "cus_1", "cs_1", Plan::Monthly, None)
            .expect("apply");
        f.clock.advance_secs(60);

        let outcome = f
            .policy
            .apply_payment(WALLET, "cus_1", "cs_2", Plan::Annual, None)
            .expect("apply");
        assert_eq!(outcome, PaymentOutcome::Upgraded { plan: Plan::Annual });

        let payment = record_of(&f, WALLET).payment.expect("payment");
        assert_eq!(payment.session_id, "cs_2");
        assert_eq!(payment.plan, Plan::Annual);
        assert_eq!(payment.paid_at, f.clock.now());
    }

    #[test]
    fn test_payment_on_blocked_wallet_never_mutates() {
        let f = fixture();
        f.policy
            .set_status(WALLET, EntitlementStatus::Blocked)
            .expect("set");
        let before = record_of(&f, WALLET);
        let saves = f.backend.save_count();

        for session in ["cs_1", "cs_1", "cs_2"] {
            let outcome = f
                .policy
                .apply_payment(WALLET, "cus_1", session, Plan::Annual, None)
                .expect("apply");
            assert_eq!(outcome, PaymentOutcome::Blocked);
        }

        assert_eq!(record_of(&f, WALLET), before);
        assert_eq!(f.backend.save_count(), saves);
        assert!(!f.policy.is_session_processed("cs_1"));
    }

    #[test]
    fn test_payment_during_trial_clears_trial_start() {
        let f = fixture();
        f.policy.start_trial(WALLET).expect("trial");
        f.policy
            .apply_payment(WALLET, "cus_1", "cs_1", Plan::Monthly, None)
            .expect("apply");

        let record = record_of(&f, WALLET);
        assert_eq!(record.status, EntitlementStatus::ProPaid);
        assert!(record.trial_start.is_none());
        assert!(record.trial_used);
    }

    #[test]
    fn test_is_session_processed_tracks_store() {
        let f = fixture();
        assert!(!f.policy.is_session_processed("cs_1"));

        f.policy
            .apply_payment(WALLET, "cus_1", "cs_1", Plan::Monthly, None)
            .expect("apply");
        assert!(f.policy.is_session_processed("cs_1"));

        f.policy
            .apply_payment(WALLET, "cus_1", "cs_2", Plan::Annual, None)
            .expect("apply");
        assert!(!f.policy.is_session_processed("cs_1"));
        assert!(f.policy.is_session_processed("cs_2"));

        assert!(f.policy.reset_identity(WALLET).expect("reset"));
        assert!(!f.policy.is_session_processed("cs_2"));
    }

    #[test]
    fn test_is_session_processed_finds_sessions_loaded_from_disk() {
        let now = Utc::now();
        let mut record = WalletRecord::new(WalletAddress::normalize("0xold"), now);
        record.status = EntitlementStatus::ProPaid;
        record.payment = Some(PaymentInfo {
            customer_id: "cus_9".to_string(),
            subscription_id: None,
            session_id: "cs_9".to_string(),
            plan: Plan::Annual,
            paid_at: now,
        });
        let f = fixture_with(MemoryBackend::with_records([record]));

        assert!(f.policy.session_cache().is_empty());
        assert!(f.policy.is_session_processed("cs_9"));
        assert_eq!(f.policy.session_cache().len(), 1);
        assert!(f.policy.is_session_processed("cs_9"));
        assert_eq!(f.policy.session_cache().stats().hits, 1);
    }

    #[test]
    fn test_overwritten_session_hint_is_invalidated() {
        let f = fixture();
        f.policy
            .apply_payment(WALLET, "cus", "cs_1", Plan::Monthly, None)
            .expect("first");
        f.policy
            .apply_payment(WALLET, "cus", "cs_2", Plan::Annual, None)
            .expect("second");

        assert!(!f.policy.is_session_processed("cs_1"));
        assert!(f.policy.is_session_processed("cs_2"));
        let stats = f.policy.session_cache().stats();
        assert_eq!(stats.invalidations, 1);
        assert_eq!(f.policy.session_cache().len(), 1);
    }

    #[test]
    fn test_identities_are_case_insensitive() {
        let f = fixture();
        f.policy.record_scan("0xABCDEF").expect("record");

        let info = f.policy.get_wallet_info("0xabcdef");
        assert_eq!(info.record.scans_today, 1);
        assert_eq!(info.remaining_scans, Some(4));
        assert_eq!(f.policy.store().len(), 1);
    }

    #[test]
    fn test_reset_identity_makes_wallet_new() {
        let f = fixture();
        f.policy.start_trial(WALLET).expect("trial");
        f.policy.record_scan(WALLET).expect("record");

        assert!(f.policy.reset_identity(WALLET).expect("reset"));
        assert!(!f.policy.reset_identity(WALLET).expect("reset again"));

        let info = f.policy.get_wallet_info(WALLET);
        assert_eq!(info.record.status, EntitlementStatus::Free);
        assert_eq!(info.record.scans_today, 0);
        assert!(!info.record.trial_used);
        assert!(f.policy.start_trial(WALLET).expect("trial").is_success());
    }

    #[test]
    fn test_wallet_info_remaining_only_for_free() {
        let f = fixture();
        f.policy
            .set_status(WALLET, EntitlementStatus::ProPaid)
            .expect("set");
        assert_eq!(f.policy.get_wallet_info(WALLET).remaining_scans, None);
    }

    #[test]
    fn test_trial_status() {
        let f = fixture();
        let status = f.policy.trial_status(WALLET);
        assert!(status.can_start_trial);
        assert!(status.trial_expires_at.is_none());

        f.policy.start_trial(WALLET).expect("trial");
        f.clock.advance(Duration::days(1) + Duration::hours(1));
        let status = f.policy.trial_status(WALLET);
        assert!(!status.can_start_trial);
        assert_eq!(status.entitlement, EntitlementStatus::ProTrial);
        assert_eq!(status.trial_days_remaining, Some(5));
        assert!(status.trial_expires_at.is_some());
    }

    #[test]
    fn test_try_consume_scan_enforces_quota() {
        let f = fixture();
        for expected in (1..=5).rev() {
            let decision = f.policy.try_consume_scan(WALLET).expect("consume");
            assert_eq!(decision.remaining_scans(), Some(expected));
            f.clock.advance_secs(11);
        }
        assert!(matches!(
            f.policy.try_consume_scan(WALLET).expect("consume"),
            ScanDecision::LimitReached { .. }
        ));
        assert_eq!(record_of(&f, WALLET).scans_today, 5);
    }

    #[test]
    fn test_try_consume_scan_does_not_record_denials() {
        let f = fixture();
        f.policy.try_consume_scan(WALLET).expect("consume");
        let last = record_of(&f, WALLET).last_scan_at;

        f.clock.advance_secs(2);
        assert!(matches!(
            f.policy.try_consume_scan(WALLET).expect("consume"),
            ScanDecision::RateLimited { retry_after: 8 }
        ));
        let record = record_of(&f, WALLET);
        assert_eq!(record.scans_today, 1);
        assert_eq!(record.last_scan_at, last);
    }

    #[test]
    fn test_concurrent_consumers_cannot_exceed_quota() {
        let f = fixture();
        let policy = Arc::new(f.policy);
        let granted = std::sync::atomic::AtomicU32::new(0);

        std::thread::scope(|scope| {
            for i in 0..16 {
                let policy = Arc::clone(&policy);
                let granted = &granted;
                scope.spawn(move || {
                    // Half of the threads race on the same wallet.
                    let wallet = if i % 2 == 0 { "0xHOT" } else { "0xCOLD" };
                    if policy
                        .try_consume_scan(wallet)
                        .expect("consume")
                        .is_allowed()
                        && wallet == "0xHOT"
                    {
                        granted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });

        // Same instant: the cooldown admits exactly one scan per wallet.
        assert_eq!(granted.load(std::sync::atomic::Ordering::SeqCst), 1);
        let hot = policy
            .store()
            .peek(&WalletAddress::normalize("0xhot"))
            .expect("hot");
        assert_eq!(hot.scans_today, 1);
    }

    #[test]
    fn test_heal_failure_does_not_fail_read() {
        let f = fixture();
        f.policy.start_trial(WALLET).expect("trial");
        f.clock.advance(Duration::days(8));

        f.backend.set_fail_saves(true);
        let decision = f.policy.check_scan_permission(WALLET);
        assert_eq!(decision.entitlement(), EntitlementStatus::Free);
        assert!(decision.is_allowed());
        // Not persisted: the stored record still shows the trial.
        assert_eq!(record_of(&f, WALLET).status, EntitlementStatus::ProTrial);

        f.backend.set_fail_saves(false);
        f.policy.check_scan_permission(WALLET);
        assert_eq!(record_of(&f, WALLET).status, EntitlementStatus::Free);
    }

    #[test]
    fn test_persistence_failure_surfaces_on_mutation() {
        let f = fixture();
        f.policy.check_scan_permission(WALLET);
        f.backend.set_fail_saves(true);

        let err = f.policy.record_scan(WALLET).expect_err("save fails");
        assert!(matches!(err, Error::Persistence(_)));
        assert!(f.policy.try_consume_scan(WALLET).is_err());
        assert!(f.policy.start_trial(WALLET).is_err());
        assert!(f
            .policy
            .apply_payment(WALLET, "cus", "cs", Plan::Monthly, None)
            .is_err());
        assert_eq!(record_of(&f, WALLET).scans_today, 0);
    }

    #[test]
    fn test_unbounded_trial_length_does_not_overflow() {
        let f = fixture();
        let limits = Limits {
            trial_days: u32::MAX,
            ..Limits::default()
        };
        let policy = EntitlementPolicy::new(Arc::clone(f.policy.store()), limits);

        let outcome = policy.start_trial(WALLET).expect("trial");
        assert_eq!(
            outcome,
            TrialOutcome::TrialStarted {
                trial_expires_at: DateTime::<Utc>::MAX_UTC,
                trial_days: u32::MAX,
            }
        );
        f.clock.advance(Duration::days(10_000));
        assert!(policy.check_scan_permission(WALLET).is_allowed());
        assert_eq!(
            policy.trial_status(WALLET).entitlement,
            EntitlementStatus::ProTrial
        );
    }

    #[test]
    fn test_events_emitted() {
        let f = fixture();
        let (tx, mut rx) = create_event_channel();
        let policy = f.policy.with_events(tx);

        policy.start_trial(WALLET).expect("trial");
        policy
            .apply_payment(WALLET, "cus", "cs_1", Plan::Annual, None)
            .expect("pay");

        let wallet = WalletAddress::normalize(WALLET);
        assert_eq!(
            rx.try_recv().expect("trial event"),
            EntitlementEvent::TrialStarted {
                wallet: wallet.clone()
            }
        );
        assert_eq!(
            rx.try_recv().expect("payment event"),
            EntitlementEvent::PaymentApplied {
                wallet,
                session_id: "cs_1".to_string(),
                plan: Plan::Annual,
            }
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_retry_after_within_cooldown(elapsed_ms in 0i64..10_000, prior in 0u32..8) {
                let f = fixture();
                for _ in 0..prior {
                    f.policy.record_scan(WALLET).unwrap();
                }
                f.policy.record_scan(WALLET).unwrap();
                f.clock.advance(Duration::milliseconds(elapsed_ms));

                match f.policy.check_scan_permission(WALLET) {
                    ScanDecision::RateLimited { retry_after } => {
                        prop_assert!((1..=10).contains(&retry_after));
                    }
                    other => prop_assert!(false, "expected rate limit, got {:?}", other),
                }
            }

            #[test]
            fn prop_stale_window_always_resets(scans in 1u32..20, extra_mins in 0i64..10_000) {
                let f = fixture();
                for _ in 0..scans {
                    f.policy.record_scan(WALLET).unwrap();
                }
                f.clock.advance(Duration::hours(24) + Duration::minutes(extra_mins));

                let decision = f.policy.check_scan_permission(WALLET);
                prop_assert_eq!(decision.remaining_scans(), Some(5));
                prop_assert_eq!(record_of(&f, WALLET).scans_today, 0);
            }
        }
    }
}
