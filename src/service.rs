//! Service assembly and lifecycle.
//!
//! [`ServiceBuilder`] wires configuration into a store, a policy, a challenge
//! store and a payment processor. [`RunningService`] is the handle request
//! handlers share; it owns background housekeeping and flushes the store on
//! shutdown.

use crate::challenge::{Challenge, ChallengeStore, OwnershipVerifier, RejectAllVerifier};
use crate::clock::{Clock, SystemClock};
use crate::config::{ServiceConfig, StoreBackendKind};
use crate::entitlement::{EntitlementPolicy, TrialOutcome};
use crate::error::Result;
use crate::event::{create_event_channel, EntitlementEvent, EventsChannel, EventsSender};
use crate::payment::{PaymentConfirmation, PaymentProcessor, ProcessedPayment};
use crate::store::{EntitlementStore, FileBackend, MemoryBackend, StoreBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Builder for constructing the entitlement service.
pub struct ServiceBuilder {
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    backend: Option<Box<dyn StoreBackend>>,
    verifier: Arc<dyn OwnershipVerifier>,
}

impl ServiceBuilder {
    /// Create a new builder with the given configuration.
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            backend: None,
            verifier: Arc::new(RejectAllVerifier),
        }
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `backend` instead of the one selected by the configuration.
    #[must_use]
    pub fn with_backend(mut self, backend: impl StoreBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Use `verifier` to check ownership proofs.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn OwnershipVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Build the service.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the data directory
    /// cannot be created.
    pub fn build(self) -> Result<RunningService> {
        self.config.validate()?;
        info!("Building entitlement service with config: {:?}", self.config);

        let backend: Box<dyn StoreBackend> = match self.backend {
            Some(backend) => backend,
            None => match self.config.store.backend {
                StoreBackendKind::Memory => {
                    warn!("Using in-memory entitlement store; state is lost on restart");
                    Box::new(MemoryBackend::new())
                }
                StoreBackendKind::File => {
                    std::fs::create_dir_all(&self.config.data_dir)?;
                    let path = self.config.store_path();
                    info!("Entitlement store at {}", path.display());
                    Box::new(FileBackend::new(path, self.config.store.format))
                }
            },
        };

        let store = Arc::new(EntitlementStore::open(backend, Arc::clone(&self.clock)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();

        let policy = Arc::new(
            EntitlementPolicy::new(Arc::clone(&store), self.config.limits)
                .with_session_cache_capacity(self.config.payment.session_cache_capacity)
                .with_events(events_tx.clone()),
        );
        let challenges = Arc::new(ChallengeStore::new(
            Arc::clone(&self.clock),
            self.config.challenge.expiry_secs,
        ));
        let payments = PaymentProcessor::new(Arc::clone(&policy));

        Ok(RunningService {
            config: self.config,
            store,
            policy,
            challenges,
            payments,
            verifier: self.verifier,
            shutdown_tx,
            shutdown_rx,
            events_tx,
            events_rx: Some(events_rx),
        })
    }
}

/// A running entitlement service.
pub struct RunningService {
    config: ServiceConfig,
    store: Arc<EntitlementStore>,
    policy: Arc<EntitlementPolicy>,
    challenges: Arc<ChallengeStore>,
    payments: PaymentProcessor,
    verifier: Arc<dyn OwnershipVerifier>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: EventsSender,
    events_rx: Option<EventsChannel>,
}

impl RunningService {
    /// Get the service's data directory.
    #[must_use]
    pub fn data_dir(&self) -> &PathBuf {
        &self.config.data_dir
    }

    /// Entitlement policy shared with request handlers.
    #[must_use]
    pub fn policy(&self) -> &Arc<EntitlementPolicy> {
        &self.policy
    }

    /// Outstanding ownership challenges.
    #[must_use]
    pub fn challenges(&self) -> &Arc<ChallengeStore> {
        &self.challenges
    }

    /// Get a receiver for service events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<EventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to service events.
    #[must_use]
    pub fn subscribe_events(&self) -> EventsChannel {
        self.events_tx.subscribe()
    }

    /// Issue an ownership challenge for `wallet`.
    ///
    /// # Errors
    ///
    /// Returns an error if the wallet address is malformed.
    pub fn issue_challenge(&self, wallet: &str) -> Result<Challenge> {
        self.challenges.issue(wallet)
    }

    /// Start a trial after checking the wallet's ownership proof.
    ///
    /// # Errors
    ///
    /// Returns a challenge or proof error if ownership is not shown, or a
    /// persistence error from the policy.
    pub fn start_trial_with_proof(
        &self,
        wallet: &str,
        challenge: &str,
        proof: &str,
    ) -> Result<TrialOutcome> {
        let wallet =
            self.challenges
                .verify_and_consume(wallet, challenge, proof, self.verifier.as_ref())?;
        let outcome = self.policy.start_trial(wallet.as_str())?;
        info!("Trial request for {} -> {:?}", wallet.short(), outcome);
        Ok(outcome)
    }

    /// Apply a verified payment confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed confirmations or persistence failure.
    pub fn process_payment(&self, confirmation: &PaymentConfirmation) -> Result<ProcessedPayment> {
        self.payments.process(confirmation)
    }

    /// Payment processor.
    #[must_use]
    pub fn payments(&self) -> &PaymentProcessor {
        &self.payments
    }

    /// Run housekeeping until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be flushed on shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting entitlement service ({} wallets)", self.store.len());
        let _ = self.events_tx.send(EntitlementEvent::Started);

        let challenges = Arc::clone(&self.challenges);
        let mut purge_shutdown = self.shutdown_rx.clone();
        let interval = Duration::from_secs(self.config.challenge.purge_interval_secs);
        let purge_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = purge_shutdown.changed() => {
                        if *purge_shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let purged = challenges.purge_expired();
                        if purged > 0 {
                            debug!("Purged {} expired challenges", purged);
                        }
                    }
                }
            }
        });

        info!("Service running, waiting for shutdown signal");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    self.shutdown();
                    break;
                }
            }
        }

        let _ = self.events_tx.send(EntitlementEvent::ShuttingDown);
        if let Err(e) = purge_task.await {
            warn!("Challenge purge task ended abnormally: {}", e);
        }

        self.store.flush()?;
        info!("Entitlement store flushed, shutdown complete");
        Ok(())
    }

    /// Request the service to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle that can request shutdown from another task.
    #[must_use]
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }
}
