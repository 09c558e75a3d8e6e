//! Persisted bitset of used key indices
//!
//! One bit per key, packed into `u64` blocks (1 = used). `first_available`
//! always points at the lowest unused index, or at or past `num_keys` when
//! none is left. Every mutation is applied to a copy, persisted, and only
//! then made visible, so a failed write leaves memory and disk in agreement.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{
    error::RatchetError,
    lock,
    storage::{StorageError, Store},
};

/// Record format version
const KEY_STATE_VERSION: u64 = 0;

/// Thread-safe, persisted key usage tracker for one session.
pub struct KeyStateVector {
    store: Store,
    key: String,
    state: RwLock<VectorState>,
}

/// Disk form of the vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VectorState {
    vect: Vec<u64>,
    first_available: u32,
    num_keys: u32,
    num_available: u32,
}

impl VectorState {
    fn new(num_keys: u32) -> Self {
        let blocks = num_keys.div_ceil(64) as usize;
        Self { vect: vec![0; blocks], first_available: 0, num_keys, num_available: num_keys }
    }

    fn check(&self, key_num: u32) -> Result<(), RatchetError> {
        if key_num >= self.num_keys {
            return Err(RatchetError::KeyOutOfRange { key_num, num_keys: self.num_keys });
        }
        Ok(())
    }

    fn used(&self, key_num: u32) -> bool {
        let (block, pos) = block_and_pos(key_num);
        (self.vect[block] >> pos) & 1 == 1
    }

    fn mark_used(&mut self, key_num: u32) {
        if self.used(key_num) {
            return;
        }
        let (block, pos) = block_and_pos(key_num);
        self.vect[block] |= 1u64 << pos;
        self.num_available -= 1;

        if key_num == self.first_available {
            self.advance_first_available();
        }
    }

    fn mark_unused(&mut self, key_num: u32) {
        if !self.used(key_num) {
            return;
        }
        let (block, pos) = block_and_pos(key_num);
        self.vect[block] &= !(1u64 << pos);
        self.num_available += 1;

        if key_num < self.first_available {
            self.first_available = key_num;
        }
    }

    fn advance_first_available(&mut self) {
        let mut pos = self.first_available + 1;
        while pos < self.num_keys && self.used(pos) {
            pos += 1;
        }
        self.first_available = pos;
    }
}

fn block_and_pos(key_num: u32) -> (usize, u32) {
    ((key_num / 64) as usize, key_num % 64)
}

impl KeyStateVector {
    /// Create a vector with every key available and persist it.
    pub fn new(store: &Store, key: &str, num_keys: u32) -> Result<Self, RatchetError> {
        let state = VectorState::new(num_keys);
        store.set_record(key, KEY_STATE_VERSION, &state)?;
        Ok(Self { store: store.clone(), key: key.to_string(), state: RwLock::new(state) })
    }

    /// Load a previously persisted vector.
    pub fn load(store: &Store, key: &str) -> Result<Self, RatchetError> {
        let state: VectorState = store.load_record(key, KEY_STATE_VERSION)?;

        if state.vect.len() != state.num_keys.div_ceil(64) as usize
            || state.num_available > state.num_keys
        {
            return Err(RatchetError::CorruptRecord {
                key: store.full_key(key, KEY_STATE_VERSION),
                reason: format!(
                    "{} blocks and {} available for {} keys",
                    state.vect.len(),
                    state.num_available,
                    state.num_keys
                ),
            });
        }

        Ok(Self { store: store.clone(), key: key.to_string(), state: RwLock::new(state) })
    }

    /// Mark the lowest unused key as used and return it.
    pub fn next(&self) -> Result<u32, RatchetError> {
        self.next_reserving(0)
    }

    /// Like [`KeyStateVector::next`], but fails once `reserved` or fewer keys
    /// remain. The check and the claim happen under one lock.
    pub fn next_reserving(&self, reserved: u32) -> Result<u32, RatchetError> {
        let mut state = lock::write(&self.state);
        if state.first_available >= state.num_keys || state.num_available <= reserved {
            return Err(RatchetError::NoKeysAvailable);
        }

        let key_num = state.first_available;
        let mut updated = state.clone();
        updated.mark_used(key_num);
        self.persist(&updated)?;
        *state = updated;

        Ok(key_num)
    }

    /// Mark `key_num` as used. Marking a used key again is a no-op.
    pub fn use_key(&self, key_num: u32) -> Result<(), RatchetError> {
        self.update(key_num, VectorState::mark_used)
    }

    /// Mark `key_num` as available again.
    pub fn unuse(&self, key_num: u32) -> Result<(), RatchetError> {
        self.update(key_num, VectorState::mark_unused)
    }

    /// True if `key_num` is used. Out-of-range keys count as used.
    pub fn used(&self, key_num: u32) -> bool {
        let state = lock::read(&self.state);
        key_num >= state.num_keys || state.used(key_num)
    }

    /// Number of unused keys.
    pub fn num_available(&self) -> u32 {
        lock::read(&self.state).num_available
    }

    /// Number of used keys.
    pub fn num_used(&self) -> u32 {
        let state = lock::read(&self.state);
        state.num_keys - state.num_available
    }

    /// Size of the key pool.
    pub fn num_keys(&self) -> u32 {
        lock::read(&self.state).num_keys
    }

    /// Every unused key index, ascending.
    pub fn unused_keys(&self) -> Vec<u32> {
        let state = lock::read(&self.state);
        (state.first_available..state.num_keys).filter(|&k| !state.used(k)).collect()
    }

    /// Every used key index, ascending.
    pub fn used_keys(&self) -> Vec<u32> {
        let state = lock::read(&self.state);
        (0..state.num_keys).filter(|&k| state.used(k)).collect()
    }

    /// Remove the persisted record.
    pub fn delete(&self) -> Result<(), RatchetError> {
        self.store.delete_object(&self.key, KEY_STATE_VERSION)?;
        Ok(())
    }

    fn update(&self, key_num: u32, apply: fn(&mut VectorState, u32)) -> Result<(), RatchetError> {
        let mut state = lock::write(&self.state);
        state.check(key_num)?;

        let mut updated = state.clone();
        apply(&mut updated, key_num);
        if updated == *state {
            return Ok(());
        }
        self.persist(&updated)?;
        *state = updated;

        Ok(())
    }

    fn persist(&self, state: &VectorState) -> Result<(), StorageError> {
        self.store.set_record(&self.key, KEY_STATE_VERSION, state)
    }
}
