//! Entitlement record store.
//!
//! Holds every [`WalletRecord`] in memory behind a single lock and writes the
//! full mapping through a [`StoreBackend`] after each mutation, before the
//! mutating call returns. Read-modify-write sequences go through
//! [`EntitlementStore::modify`], which runs the closure and the save inside
//! the same critical section so concurrent updates to one wallet serialize.

mod backend;

pub use backend::{FileBackend, MemoryBackend, RecordMap, StoreBackend};

use crate::clock::Clock;
use crate::entitlement::WalletRecord;
use crate::error::Result;
use crate::identity::WalletAddress;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared, durably persisted mapping from wallet to entitlement record.
#[derive(Debug)]
pub struct EntitlementStore {
    records: Mutex<RecordMap>,
    backend: Box<dyn StoreBackend>,
    clock: Arc<dyn Clock>,
}

impl EntitlementStore {
    /// Open a store over `backend`.
    ///
    /// Unreadable or corrupt state is moved aside by the backend and
    /// replaced by an empty mapping, so the next save cannot destroy it.
    pub fn open(backend: impl StoreBackend + 'static, clock: Arc<dyn Clock>) -> Self {
        let records = match backend.load() {
            Ok(records) => {
                info!("Entitlement store loaded ({} wallets)", records.len());
                records
            }
            Err(e) => {
                let suffix = clock.now().format("%Y%m%dT%H%M%SZ").to_string();
                match backend.quarantine(&suffix) {
                    Ok(Some(moved)) => error!(
                        "Entitlement store unreadable ({}); moved to {} and starting empty",
                        e,
                        moved.display()
                    ),
                    Ok(None) => warn!("Entitlement store unreadable, starting empty: {}", e),
                    Err(move_err) => error!(
                        "Entitlement store unreadable ({}) and could not be moved aside: {}",
                        e, move_err
                    ),
                }
                RecordMap::new()
            }
        };

        Self {
            records: Mutex::new(records),
            backend: Box::new(backend),
            clock,
        }
    }

    /// Fetch the record for `identity`, creating and persisting a FREE record
    /// if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a newly created record cannot be persisted.
    pub fn get(&self, identity: &WalletAddress) -> Result<WalletRecord> {
        self.modify(identity, |record| record.clone())
    }

    /// Fetch the record for `identity` without creating it.
    #[must_use]
    pub fn peek(&self, identity: &WalletAddress) -> Option<WalletRecord> {
        self.records.lock().get(identity).cloned()
    }

    /// Store `record` under `identity`, replacing any existing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be persisted; the previous
    /// record is kept in that case.
    pub fn put(&self, identity: &WalletAddress, mut record: WalletRecord) -> Result<()> {
        record.identity = identity.clone();
        let mut records = self.records.lock();
        let previous = records.insert(identity.clone(), record);
        if let Err(e) = self.backend.save(&records) {
            restore(&mut records, identity, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Whether a record exists for `identity`.
    #[must_use]
    pub fn exists(&self, identity: &WalletAddress) -> bool {
        self.records.lock().contains_key(identity)
    }

    /// Remove the record for `identity`; returns the removed record.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion cannot be persisted; the record is
    /// kept in that case.
    pub fn delete(&self, identity: &WalletAddress) -> Result<Option<WalletRecord>> {
        let mut records = self.records.lock();
        let Some(removed) = records.remove(identity) else {
            return Ok(None);
        };
        if let Err(e) = self.backend.save(&records) {
            records.insert(identity.clone(), removed);
            return Err(e);
        }
        debug!("Deleted entitlement record for {}", identity.short());
        Ok(Some(removed))
    }

    /// Find the record whose last applied payment carries `session_id`.
    #[must_use]
    pub fn find_by_payment_session(&self, session_id: &str) -> Option<WalletRecord> {
        self.records
            .lock()
            .values()
            .find(|record| record.payment_session() == Some(session_id))
            .cloned()
    }

    /// Atomically read, modify and persist the record for `identity`.
    ///
    /// The record is created FREE if absent. The mapping is saved only when
    /// the closure changed the record (or it was just created). If the save
    /// fails, the in-memory change is rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Persistence`] if the change cannot be persisted.
    pub fn modify<T>(
        &self,
        identity: &WalletAddress,
        f: impl FnOnce(&mut WalletRecord) -> T,
    ) -> Result<T> {
        let mut records = self.records.lock();
        let previous = records.get(identity).cloned();
        let mut working = previous
            .clone()
            .unwrap_or_else(|| WalletRecord::new(identity.clone(), self.clock.now()));

        let output = f(&mut working);

        if previous.as_ref() != Some(&working) {
            if previous.is_none() {
                debug!("Creating entitlement record for {}", identity.short());
            }
            records.insert(identity.clone(), working);
            if let Err(e) = self.backend.save(&records) {
                restore(&mut records, identity, previous);
                return Err(e);
            }
        }

        Ok(output)
    }

    /// Write the current mapping to the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the save fails.
    pub fn flush(&self) -> Result<()> {
        let records = self.records.lock();
        self.backend.save(&records)
    }

    /// Copy of all records.
    #[must_use]
    pub fn snapshot(&self) -> RecordMap {
        self.records.lock().clone()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Clock used to stamp newly created records.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

fn restore(records: &mut RecordMap, identity: &WalletAddress, previous: Option<WalletRecord>) {
    match previous {
        Some(record) => {
            records.insert(identity.clone(), record);
        }
        None => {
            records.remove(identity);
        }
    }
}
