//! Tandem Cryptographic Primitives
//!
//! Building blocks for the Tandem partner ratchet. Everything here is a pure
//! function of its inputs except key generation, which takes a caller-provided
//! RNG.
//!
//! # Key Lifecycle
//!
//! Each session between two partners starts from a hybrid key exchange. Both
//! sides compute the same base key without further interaction, and every
//! message key of the session is derived from it by index.
//!
//! ```text
//! Classical DH secret ─┐
//!                      ├─ SHA-256 → Base Key ─ SHA-256 → Session ID
//! Post-quantum secret ─┘       │
//!                              ▼
//!          HKDF(index, relationship fingerprint) → Message Key
//!                              │
//!              ┌───────────────┼────────────────┐
//!              ▼               ▼                ▼
//!     XChaCha20-Poly1305   HMAC-SHA256     Key Residue
//! ```
//!
//! # Security
//!
//! Hybrid agreement:
//! - The base key hashes both shared secrets together, so an attacker must
//!   break both primitives to recover it
//! - Non-contributory X25519 results are rejected
//!
//! Single use:
//! - A message key is bound to one (base key, index, relationship) triple
//! - The nonce is derived from the message key, which is never reused
//!
//! Authenticity:
//! - The detached MAC is checked in constant time before any decryption
//! - The AEAD tag is checked again during decryption

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cypher;
pub mod error;
pub mod fingerprint;
pub mod hybrid;
pub mod kex;

pub use cypher::{
    KeyFingerprint, KeyResidue, MAC_SIZE, MessageKey, SealedMessage, derive_message_key,
    key_fingerprint, key_residue, open, seal,
};
pub use error::CryptoError;
pub use fingerprint::{connection_fingerprint, relationship_fingerprint};
pub use hybrid::{BASE_KEY_SIZE, BaseKey, SESSION_ID_SIZE, derive_base_key, derive_key_count, session_id};
pub use kex::{
    DhPrivate, DhPublic, DoubleX25519, KeyExchange, PqPrivate, PqPublic, SharedSecret, Suite,
    X25519,
};
