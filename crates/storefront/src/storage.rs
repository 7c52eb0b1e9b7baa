//! Durable client-side cart storage.
//!
//! [`CartStorage`] is a string key-value store, the shape of browser local
//! storage. The cart is saved under a fixed storage name inside a versioned
//! [`PersistedCart`] envelope. Reading is forgiving: a missing, corrupt, or
//! unknown-version entry yields a fresh guest cart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use basket_core::Cart;

/// Envelope version written by this build.
pub const PERSIST_VERSION: u32 = 1;

/// Errors from durable storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The cart could not be serialized.
    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The storage name is not usable as a key.
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

/// Key-value persistence for serialized state.
pub trait CartStorage: Send + Sync + 'static {
    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn save(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete the value under `key`. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// The on-disk cart envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCart {
    pub version: u32,
    pub cart: Cart,
}

/// Load the cart saved under `key`, falling back to a fresh guest cart.
pub fn read_cart<S: CartStorage + ?Sized>(storage: &S, key: &str) -> Cart {
    let raw = match storage.load(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Cart::guest(),
        Err(e) => {
            tracing::warn!(error = %e, key, "Failed to read persisted cart, starting fresh");
            return Cart::guest();
        }
    };

    match serde_json::from_str::<PersistedCart>(&raw) {
        Ok(persisted) if persisted.version == PERSIST_VERSION => persisted.cart,
        Ok(persisted) => {
            tracing::warn!(
                version = persisted.version,
                key,
                "Discarding persisted cart with unknown version"
            );
            Cart::guest()
        }
        Err(e) => {
            tracing::warn!(error = %e, key, "Discarding unreadable persisted cart");
            Cart::guest()
        }
    }
}

/// Save `cart` under `key`.
///
/// # Errors
///
/// Returns an error if the cart cannot be serialized or written.
pub fn write_cart<S: CartStorage + ?Sized>(
    storage: &S,
    key: &str,
    cart: &Cart,
) -> Result<(), StorageError> {
    let envelope = PersistedCart {
        version: PERSIST_VERSION,
        cart: cart.clone(),
    };
    let raw = serde_json::to_string(&envelope)?;
    storage.save(key, &raw)
}

// =============================================================================
// FileStorage
// =============================================================================

/// One JSON file per key inside a directory.
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Use `dir` for storage. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl CartStorage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// MemoryStorage
// =============================================================================

/// In-process storage. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value under `key`, for inspection.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl CartStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.get(key))
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}
