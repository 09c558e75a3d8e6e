//! In-memory storage backend
//!
//! Nothing survives the process. Used by unit tests and the simulator.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use super::{Kv, StorageError};

/// In-memory backend for testing and simulation
///
/// Keys are kept in a `BTreeMap` so prefix listing comes out ordered. All
/// state is wrapped in Arc<Mutex<>> so clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    /// Create a new empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl Kv for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let kv = MemoryKv::new();
        let other = kv.clone();

        kv.set("a", b"1").unwrap();
        assert_eq!(other.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn prefix_listing_is_ordered_and_bounded() {
        let kv = MemoryKv::new();
        for key in ["p/b", "p/a", "q/a", "o/z"] {
            kv.set(key, b"").unwrap();
        }

        assert_eq!(kv.keys_with_prefix("p/"), vec!["p/a".to_string(), "p/b".to_string()]);
    }

    #[test]
    fn delete_is_idempotent() {
        let kv = MemoryKv::new();
        kv.set("a", b"1").unwrap();
        kv.delete("a").unwrap();
        kv.delete("a").unwrap();
        assert!(kv.is_empty());
    }
}
