//! Durable backends for the entitlement store.
//!
//! A backend only knows how to load and save the whole record mapping. The
//! store calls [`StoreBackend::save`] after every mutation while holding its
//! lock, so a backend never sees concurrent saves.

use crate::config::StoreFormat;
use crate::entitlement::{EntitlementStatus, WalletRecord};
use crate::error::{Error, Result};
use crate::identity::WalletAddress;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mapping from normalized identity to record.
pub type RecordMap = BTreeMap<WalletAddress, WalletRecord>;

/// Persisted document: `{"wallets": {<identity>: <record>}}`.
///
/// Keys are read as raw strings so that case variants of one address are
/// seen and merged instead of silently replacing each other.
#[derive(Deserialize)]
struct StoreDocument {
    #[serde(default)]
    wallets: BTreeMap<String, WalletRecord>,
}

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    wallets: &'a RecordMap,
}

/// Load/save contract of a durable record store.
pub trait StoreBackend: Send + Sync + fmt::Debug {
    /// Load the full mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if existing state is unreadable or corrupt.
    fn load(&self) -> Result<RecordMap>;

    /// Durably replace the stored mapping. Must not return before the data
    /// is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the state could not be written.
    fn save(&self, records: &RecordMap) -> Result<()>;

    /// Move unreadable state out of the way so later saves cannot overwrite
    /// it. Returns where it was moved, if anywhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the state exists but could not be moved.
    fn quarantine(&self, _suffix: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

impl StoreBackend for Box<dyn StoreBackend> {
    fn load(&self) -> Result<RecordMap> {
        (**self).load()
    }

    fn save(&self, records: &RecordMap) -> Result<()> {
        (**self).save(records)
    }

    fn quarantine(&self, suffix: &str) -> Result<Option<PathBuf>> {
        (**self).quarantine(suffix)
    }
}

/// In-memory backend for tests and ephemeral deployments.
///
/// Clones share state, so a test can keep a handle to inspect saved data or
/// to make subsequent saves fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    saved: Arc<Mutex<RecordMap>>,
    fail_saves: Arc<AtomicBool>,
    saves: Arc<AtomicU64>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend pre-populated with `records`.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = WalletRecord>) -> Self {
        let backend = Self::new();
        {
            let mut saved = backend.saved.lock();
            for record in records {
                saved.insert(record.identity.clone(), record);
            }
        }
        backend
    }

    /// Make every following save fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Last successfully saved record for `identity`.
    #[must_use]
    pub fn saved_record(&self, identity: &WalletAddress) -> Option<WalletRecord> {
        self.saved.lock().get(identity).cloned()
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&self) -> Result<RecordMap> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, records: &RecordMap) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Persistence("memory backend save failure".to_string()));
        }
        *self.saved.lock() = records.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// File-backed store writing the whole document atomically on every save.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
    format: StoreFormat,
}

impl FileBackend {
    /// Create a backend for the document at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, format: StoreFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, records: &RecordMap) -> Result<Vec<u8>> {
        let doc = StoreDocumentRef { wallets: records };
        match self.format {
            StoreFormat::Json => Ok(serde_json::to_vec_pretty(&doc)?),
            StoreFormat::MessagePack => rmp_serde::to_vec_named(&doc)
                .map_err(|e| Error::Serialization(e.to_string())),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<RecordMap> {
        let doc: StoreDocument = match self.format {
            StoreFormat::Json => serde_json::from_slice(bytes)?,
            StoreFormat::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))?
            }
        };
        Ok(merge_case_variants(doc.wallets))
    }
}

/// Re-key records by normalized address.
///
/// Documents written by older tools may hold the same wallet under several
/// spellings. A BLOCKED variant always wins; otherwise the first variant in
/// key order is kept.
fn merge_case_variants(raw: BTreeMap<String, WalletRecord>) -> RecordMap {
    let mut records = RecordMap::new();
    for (key, mut record) in raw {
        let identity = WalletAddress::normalize(&key);
        record.identity = identity.clone();
        match records.get(&identity) {
            None => {
                records.insert(identity, record);
            }
            Some(existing) => {
                warn!("Store holds several spellings of {}, merging", identity.short());
                if existing.status != EntitlementStatus::Blocked
                    && record.status == EntitlementStatus::Blocked
                {
                    records.insert(identity, record);
                }
            }
        }
    }
    records
}

impl StoreBackend for FileBackend {
    fn load(&self) -> Result<RecordMap> {
        if !self.path.exists() {
            debug!("No entitlement store at {}, starting empty", self.path.display());
            return Ok(RecordMap::new());
        }
        let bytes = std::fs::read(&self.path)?;
        self.decode(&bytes)
    }

    fn save(&self, records: &RecordMap) -> Result<()> {
        let bytes = self.encode(records)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        // Temp file in the target directory so the rename stays on one filesystem.
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            Error::Persistence(format!("cannot create temp file in {}: {e}", dir.display()))
        })?;
        tmp.as_file_mut()
            .write_all(&bytes)
            .map_err(|e| Error::Persistence(format!("cannot write temp file: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::Persistence(format!("cannot sync temp file: {e}")))?;
        tmp.persist(&self.path).map_err(|e| {
            Error::Persistence(format!(
                "cannot persist temp file -> {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(())
    }

    fn quarantine(&self, suffix: &str) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut target = self.path.clone().into_os_string();
        target.push(format!(".corrupt-{suffix}"));
        let target = PathBuf::from(target);
        std::fs::rename(&self.path, &target).map_err(|e| {
            Error::Persistence(format!(
                "cannot move {} -> {}: {e}",
                self.path.display(),
                target.display()
            ))
        })?;
        Ok(Some(target))
    }
}
