//! Session parameters
//!
//! Persisted inside every session record, so a loaded session keeps the
//! parameters it was created with.

use serde::{Deserialize, Serialize};

use crate::error::RatchetError;

/// Default lower bound of the key pool size
pub const DEFAULT_MIN_KEYS: u32 = 1000;

/// Default upper bound (exclusive) of the key pool size
pub const DEFAULT_MAX_KEYS: u32 = 2000;

/// Default number of keys reserved for rekey messages
pub const DEFAULT_NUM_REKEYS: u32 = 16;

/// Default fraction of keys used before a rekey is due
pub const DEFAULT_REKEY_THRESHOLD: f64 = 0.05;

/// Default probability of resending an unconfirmed rekey per check
pub const DEFAULT_UNCONFIRMED_RETRY_RATIO: f64 = 0.1;

/// Smallest accepted `min_keys`
pub const MIN_KEYS_FLOOR: u32 = 10;

/// Key pool and rekey policy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Lower bound of the key pool size
    pub min_keys: u32,
    /// Upper bound (exclusive) of the key pool size
    pub max_keys: u32,
    /// Extra keys reserved for rekey messages
    pub num_rekeys: u32,
    /// Fraction of keys used before a rekey is due
    pub rekey_threshold: f64,
    /// Probability that an unconfirmed session resends its rekey on a check
    pub unconfirmed_retry_ratio: f64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            min_keys: DEFAULT_MIN_KEYS,
            max_keys: DEFAULT_MAX_KEYS,
            num_rekeys: DEFAULT_NUM_REKEYS,
            rekey_threshold: DEFAULT_REKEY_THRESHOLD,
            unconfirmed_retry_ratio: DEFAULT_UNCONFIRMED_RETRY_RATIO,
        }
    }
}

impl SessionParams {
    /// Check the bounds every session relies on.
    pub fn validate(&self) -> Result<(), RatchetError> {
        if self.min_keys < MIN_KEYS_FLOOR {
            return Err(invalid(format!(
                "min_keys {} is below the floor of {MIN_KEYS_FLOOR}",
                self.min_keys
            )));
        }
        if self.max_keys < self.min_keys {
            return Err(invalid(format!(
                "max_keys {} is below min_keys {}",
                self.max_keys, self.min_keys
            )));
        }
        if !(0.0..=1.0).contains(&self.rekey_threshold) {
            return Err(invalid(format!("rekey_threshold {} is outside [0, 1]", self.rekey_threshold)));
        }
        if !(0.0..=1.0).contains(&self.unconfirmed_retry_ratio) {
            return Err(invalid(format!(
                "unconfirmed_retry_ratio {} is outside [0, 1]",
                self.unconfirmed_retry_ratio
            )));
        }
        Ok(())
    }
}

fn invalid(reason: String) -> RatchetError {
    RatchetError::InvalidParams { reason }
}
