//! Chaotic backend wrapper for fault injection testing
//!
//! Randomly fails operations to check that persistence faults surface as
//! errors instead of silently diverging in-memory and on-disk state.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use super::{Kv, StorageError};

/// Backend wrapper that randomly injects failures
///
/// Delegates to an underlying backend but fails operations based on a
/// configured failure rate. Failures can also be switched on and off wholesale
/// to fail one specific step of a test.
#[derive(Clone)]
pub struct ChaoticKv<K: Kv + Clone> {
    inner: K,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Fail every write while set
    fail_writes: Arc<AtomicBool>,
    /// Operation counter
    operation_count: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator so chaos runs are reproducible with the same
/// seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<K: Kv + Clone> ChaoticKv<K> {
    /// Wrap `inner` with the given failure rate, clamped to [0.0, 1.0].
    pub fn new(inner: K, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    pub fn with_seed(inner: K, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            fail_writes: Arc::new(AtomicBool::new(false)),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying backend (for checking invariants after chaos).
    pub fn inner(&self) -> &K {
        &self.inner
    }

    /// Fail every `set` and `delete` until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Total number of operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    fn check(&self, write: bool) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
        if write && self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io("chaotic write failure".to_string()));
        }
        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<K: Kv + Clone> Kv for ChaoticKv<K> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check(false)?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.check(true)?;
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check(true)?;
        self.inner.delete(key)
    }
}
