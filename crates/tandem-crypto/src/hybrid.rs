//! Hybrid base key and values derived from it
//!
//! Both partners feed the same two shared secrets in, so every value here is
//! computed identically on each side without further communication.

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Size of a session base key in bytes
pub const BASE_KEY_SIZE: usize = 32;

/// Size of a session id in bytes
pub const SESSION_ID_SIZE: usize = 32;

/// Label for combining the classical and post-quantum secrets
const BASE_KEY_LABEL: &[u8] = b"tandemBaseKeyV1";

/// Label for the session id digest
const SESSION_ID_LABEL: &[u8] = b"tandemSessionIdV1";

/// Label for the key count digest
const KEY_COUNT_LABEL: &[u8] = b"tandemKeyCountV1";

/// Symmetric root of a session. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct BaseKey([u8; BASE_KEY_SIZE]);

impl BaseKey {
    /// Wrap raw key bytes, e.g. when loading a persisted session.
    pub fn from_bytes(bytes: [u8; BASE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; BASE_KEY_SIZE] {
        &self.0
    }
}

impl Drop for BaseKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for BaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BaseKey([REDACTED])")
    }
}

/// Combine the classical and post-quantum shared secrets into a base key.
pub fn derive_base_key(dh_secret: &[u8], pq_secret: &[u8]) -> BaseKey {
    let mut hasher = Sha256::new();
    hasher.update(BASE_KEY_LABEL);
    hasher.update(dh_secret);
    hasher.update(pq_secret);
    BaseKey(hasher.finalize().into())
}

/// Digest identifying the session that owns `base_key`.
pub fn session_id(base_key: &BaseKey) -> [u8; SESSION_ID_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(SESSION_ID_LABEL);
    hasher.update(base_key.as_bytes());
    hasher.finalize().into()
}

/// Number of message keys in a session, in `[min, max)`.
///
/// Deterministic in the base key so both partners size their key pools the
/// same way. Returns `min` when the range is empty.
pub fn derive_key_count(base_key: &BaseKey, min: u32, max: u32) -> u32 {
    if max <= min {
        return min;
    }

    let mut hasher = Sha256::new();
    hasher.update(KEY_COUNT_LABEL);
    hasher.update(base_key.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let span = u64::from(max - min);

    min + (u64::from_be_bytes(head) % span) as u32
}
