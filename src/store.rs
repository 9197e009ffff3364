//! Persisted key-value state.
//!
//! The engine keeps a handful of small JSON documents that must survive a
//! restart: pending withdrawals, UTXO de-dup sets, the auto-claim interval,
//! last claimed balances and endpoint overrides. Values are re-read before
//! every write; nothing here caches.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::Result;
use crate::models::LedgerId;

/// Raw string storage. Implementations must be cheap to call from async
/// code; values are small JSON documents (see [`MAX_DOCUMENT_BYTES`]).
pub trait KvStore: Send + Sync {
    /// Returns the stored value, or `None` if the key was never written.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backend cannot be read.
    fn get(&self, key: &StoreKey) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backend cannot be written.
    fn put(&self, key: &StoreKey, value: &str) -> Result<()>;

    /// Removes `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backend cannot be written.
    fn remove(&self, key: &StoreKey) -> Result<()>;
}

/// A persisted key. Constructed only through the associated functions so
/// the key layout stays in one place.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn pending_withdrawals() -> Self {
        Self("pending-withdrawals".into())
    }

    pub fn seen_utxos_pending(address: &str) -> Self {
        Self(format!("seen-utxos/pending/{address}"))
    }

    pub fn seen_utxos_finalized(address: &str) -> Self {
        Self(format!("seen-utxos/finalized/{address}"))
    }

    /// Matured UTXOs the minter refused to sweep.
    pub fn seen_utxos_rejected(address: &str) -> Self {
        Self(format!("seen-utxos/rejected/{address}"))
    }

    pub fn auto_claim_interval() -> Self {
        Self("auto-claim-interval".into())
    }

    pub fn last_claimed(ledger: &LedgerId) -> Self {
        Self(format!("last-claimed/{ledger}"))
    }

    pub fn endpoint_overrides() -> Self {
        Self("endpoint-overrides".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name safe on every platform: anything outside `[A-Za-z0-9._-]`
    /// is percent-encoded.
    fn file_name(&self) -> String {
        let mut out = String::with_capacity(self.0.len() + 5);
        for b in self.0.bytes() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
                out.push(b as char);
            } else {
                out.push_str(&format!("%{b:02X}"));
            }
        }
        out.push_str(".json");
        out
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads and deserializes `key`, returning `None` when absent.
///
/// # Errors
///
/// Propagates backend errors, and returns a JSON error when the stored
/// document does not match `T`.
pub fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &StoreKey) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serializes and stores `value` under `key`.
///
/// # Errors
///
/// Propagates serialization and backend errors.
pub fn save_json<T: Serialize + ?Sized>(store: &dyn KvStore, key: &StoreKey, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.put(key, &raw)
}

/// Largest document [`JsonFileStore`] accepts. File IO runs inline on the
/// calling task, so this bounds how long a call can block.
pub const MAX_DOCUMENT_BYTES: usize = 1 << 20;

/// One JSON file per key under a state directory.
///
/// Writes go to a temporary sibling first and are renamed into place so a
/// crash never leaves a half-written document. Documents above
/// [`MAX_DOCUMENT_BYTES`] are refused.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Opens (and creates if needed) the state directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Opened state directory");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &StoreKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &StoreKey) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &StoreKey, value: &str) -> Result<()> {
        if value.len() > MAX_DOCUMENT_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{key} is {} bytes, limit is {MAX_DOCUMENT_BYTES}", value.len()),
            )
            .into());
        }
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile store for tests and for running without a state directory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &StoreKey) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &StoreKey, value: &str) -> Result<()> {
        self.entries.lock().insert(key.clone(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &StoreKey) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
