//! Shared fixtures for unit tests

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rand::rngs::OsRng;
use tandem_crypto::{DoubleX25519, KeyExchange, KeyFingerprint, X25519};

use crate::{
    ids::{PartnerId, RelationshipFingerprint, RelationshipType},
    params::SessionParams,
    relationship::RelationshipContext,
    session::{Cypher, CypherHandler, SessionKeys},
    storage::{Kv, MemoryKv, StorageError, Store},
};

pub(crate) type Suite = DoubleX25519;

/// 20 keys, 4 reserved, rekey due after 10, never resend on its own.
pub(crate) fn small_params() -> SessionParams {
    SessionParams {
        min_keys: 20,
        max_keys: 20,
        num_rekeys: 4,
        rekey_threshold: 0.5,
        unconfirmed_retry_ratio: 0.0,
    }
}

pub(crate) fn memory_store() -> (MemoryKv, Store) {
    let kv = MemoryKv::new();
    let store = Store::new(Arc::new(kv.clone()));
    (kv, store)
}

/// Memory backend that rejects writes to keys containing a fragment.
#[derive(Clone, Default)]
pub(crate) struct FailingKv {
    inner: MemoryKv,
    fragment: Arc<Mutex<Option<String>>>,
}

impl FailingKv {
    pub(crate) fn store(&self) -> Store {
        Store::new(Arc::new(self.clone()))
    }

    pub(crate) fn fail_writes_to(&self, fragment: &str) {
        *self.fragment.lock().unwrap() = Some(fragment.to_string());
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

impl Kv for FailingKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if let Some(fragment) = self.fragment.lock().unwrap().as_deref()
            && key.contains(fragment)
        {
            return Err(StorageError::Io(format!("write to {key} rejected")));
        }
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key)
    }
}

pub(crate) fn partner(byte: u8) -> PartnerId {
    PartnerId::new([byte; 32])
}

pub(crate) fn random_keys() -> SessionKeys<Suite> {
    SessionKeys {
        my_private: X25519::generate(&mut OsRng),
        partner_public: X25519::public_key(&X25519::generate(&mut OsRng)),
        my_pq_private: X25519::generate(&mut OsRng),
        partner_pq_public: X25519::public_key(&X25519::generate(&mut OsRng)),
    }
}

/// Two mirrored key sets that derive the same base key.
pub(crate) fn paired_keys() -> (SessionKeys<Suite>, SessionKeys<Suite>) {
    let a = X25519::generate(&mut OsRng);
    let b = X25519::generate(&mut OsRng);
    let a_pq = X25519::generate(&mut OsRng);
    let b_pq = X25519::generate(&mut OsRng);

    let alice = SessionKeys {
        my_private: a.clone(),
        partner_public: X25519::public_key(&b),
        my_pq_private: a_pq.clone(),
        partner_pq_public: X25519::public_key(&b_pq),
    };
    let bob = SessionKeys {
        my_private: b,
        partner_public: X25519::public_key(&a),
        my_pq_private: b_pq,
        partner_pq_public: X25519::public_key(&a_pq),
    };
    (alice, bob)
}

pub(crate) fn context(
    kind: RelationshipType,
    handler: Arc<dyn CypherHandler<Suite>>,
) -> Arc<RelationshipContext<Suite>> {
    Arc::new(RelationshipContext {
        kind,
        partner: partner(7),
        fingerprint: RelationshipFingerprint::new([9; 32]),
        cypher_handler: handler,
    })
}

/// Cypher handler that keeps every registered key.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    keys: Mutex<HashMap<KeyFingerprint, Cypher<Suite>>>,
}

impl RecordingHandler {
    pub(crate) fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub(crate) fn get(&self, fingerprint: &KeyFingerprint) -> Option<Cypher<Suite>> {
        self.keys.lock().unwrap().get(fingerprint).cloned()
    }
}

impl CypherHandler<Suite> for RecordingHandler {
    fn add_key(&self, cypher: Cypher<Suite>) {
        self.keys.lock().unwrap().insert(cypher.fingerprint(), cypher);
    }

    fn delete_key(&self, cypher: &Cypher<Suite>) {
        self.keys.lock().unwrap().remove(&cypher.fingerprint());
    }
}
