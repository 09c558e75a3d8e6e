//! Versioned key-value persistence
//!
//! A [`Kv`] backend stores opaque bytes by string key. [`Store`] layers a
//! hierarchical prefix and a [`VersionedObject`] envelope on top, encoded as
//! CBOR. The trait is synchronous; every caller persists before returning.

mod chaotic;
mod error;
mod memory;
mod redb;

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

pub use chaotic::ChaoticKv;
pub use error::StorageError;
pub use memory::MemoryKv;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub use self::redb::RedbKv;

/// Key-value backend.
///
/// Implementations share state internally, so one backend can be handed to
/// many [`Store`]s.
pub trait Kv: Send + Sync + 'static {
    /// Read the value at `key`. `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write `value` at `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Envelope around every persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedObject {
    /// Record format version
    pub version: u64,
    /// Unix timestamp (seconds) of the write
    pub timestamp_secs: u64,
    /// CBOR-encoded record
    pub data: Vec<u8>,
}

/// Prefixed view of a [`Kv`] backend.
///
/// Clone is cheap (Arc).
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Kv>,
    prefix: String,
}

impl Store {
    /// Root view of `backend`.
    pub fn new(backend: Arc<dyn Kv>) -> Self {
        Self { backend, prefix: String::new() }
    }

    /// Child view nested under `segment`.
    pub fn prefix(&self, segment: &str) -> Self {
        Self { backend: Arc::clone(&self.backend), prefix: format!("{}{segment}/", self.prefix) }
    }

    /// Full backend key for `key` at `version`.
    pub fn full_key(&self, key: &str, version: u64) -> String {
        format!("{}{key}_v{version}", self.prefix)
    }

    /// Read the envelope at `key`/`version`.
    pub fn get_object(&self, key: &str, version: u64) -> Result<Option<VersionedObject>, StorageError> {
        self.backend
            .get(&self.full_key(key, version))?
            .map(|bytes| decode_cbor(&bytes))
            .transpose()
    }

    /// Write `data` at `key`/`version`.
    pub fn set_object(&self, key: &str, version: u64, data: Vec<u8>) -> Result<(), StorageError> {
        let object = VersionedObject { version, timestamp_secs: now_secs(), data };
        self.backend.set(&self.full_key(key, version), &encode_cbor(&object)?)
    }

    /// Delete `key`/`version`.
    pub fn delete_object(&self, key: &str, version: u64) -> Result<(), StorageError> {
        self.backend.delete(&self.full_key(key, version))
    }

    /// Read and decode a record. `None` if absent.
    pub fn get_record<T: DeserializeOwned>(
        &self,
        key: &str,
        version: u64,
    ) -> Result<Option<T>, StorageError> {
        self.get_object(key, version)?.map(|object| decode_cbor(&object.data)).transpose()
    }

    /// Read and decode a record that must exist.
    pub fn load_record<T: DeserializeOwned>(&self, key: &str, version: u64) -> Result<T, StorageError> {
        self.get_record(key, version)?
            .ok_or_else(|| StorageError::NotFound { key: self.full_key(key, version) })
    }

    /// Encode and write a record.
    pub fn set_record<T: Serialize>(&self, key: &str, version: u64, record: &T) -> Result<(), StorageError> {
        self.set_object(key, version, encode_cbor(record)?)
    }
}

/// Encode a value as CBOR.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)?;
    Ok(bytes)
}

/// Decode a value from CBOR.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(ciborium::from_reader(bytes)?)
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}
