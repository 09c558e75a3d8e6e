//! Per-message keys and message protection
//!
//! All functions are pure. A message key is a function of the session base
//! key, the key index and the relationship fingerprint, so either partner can
//! re-derive it on demand instead of storing it.

use std::fmt;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{error::CryptoError, hybrid::BaseKey};

type HmacSha256 = Hmac<Sha256>;

/// Size of the detached MAC (HMAC-SHA256)
pub const MAC_SIZE: usize = 32;

/// Label for per-message key derivation
const MESSAGE_KEY_LABEL: &[u8] = b"tandemMessageKeyV1";

/// Label for key fingerprints
const FINGERPRINT_LABEL: &[u8] = b"tandemKeyFingerprintV1";

/// Label for key residues
const RESIDUE_LABEL: &[u8] = b"tandemKeyResidueV1";

/// Sub-key labels expanded from a message key
const ENCRYPTION_LABEL: &[u8] = b"encrypt";
const NONCE_LABEL: &[u8] = b"nonce";
const MAC_LABEL: &[u8] = b"mac";

/// A single-use message key.
///
/// Derived on demand for one encryption or decryption and dropped right
/// after.
pub struct MessageKey {
    key: [u8; 32],
    index: u32,
}

impl MessageKey {
    /// Raw key bytes.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Key index within the session.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Public identifier of one message key.
///
/// Travels with the ciphertext so the receiver can find the matching key
/// without trial decryption.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFingerprint(pub [u8; 32]);

impl fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyFingerprint({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Proof of which key was used, safe to reveal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct KeyResidue(pub [u8; 32]);

/// Ciphertext with its detached MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// XChaCha20-Poly1305 output, tag included
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over `ciphertext`
    pub mac: [u8; MAC_SIZE],
}

/// Derive the message key at `index`.
pub fn derive_message_key(
    base_key: &BaseKey,
    index: u32,
    relationship_fingerprint: &[u8; 32],
) -> MessageKey {
    let hkdf = Hkdf::<Sha256>::new(Some(relationship_fingerprint.as_slice()), base_key.as_bytes());

    // Capacity: 18 (label) + 4 (index) = 22
    let mut info = Vec::with_capacity(22);
    info.extend_from_slice(MESSAGE_KEY_LABEL);
    info.extend_from_slice(&index.to_be_bytes());

    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    MessageKey { key, index }
}

/// Fingerprint of the message key at `index`.
pub fn key_fingerprint(
    base_key: &BaseKey,
    index: u32,
    relationship_fingerprint: &[u8; 32],
) -> KeyFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_LABEL);
    hasher.update(base_key.as_bytes());
    hasher.update(index.to_be_bytes());
    hasher.update(relationship_fingerprint);
    KeyFingerprint(hasher.finalize().into())
}

/// Residue of a message key.
pub fn key_residue(key: &MessageKey) -> KeyResidue {
    let mut hasher = Sha256::new();
    hasher.update(RESIDUE_LABEL);
    hasher.update(key.key());
    KeyResidue(hasher.finalize().into())
}

/// Encrypt `plaintext` and MAC the ciphertext.
pub fn seal(key: &MessageKey, plaintext: &[u8]) -> SealedMessage {
    let mut enc_key = expand(key, ENCRYPTION_LABEL);
    let nonce = expand_nonce(key);
    let cipher = XChaCha20Poly1305::new((&enc_key).into());
    enc_key.zeroize();

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mac = compute_mac(key, &ciphertext);
    SealedMessage { ciphertext, mac }
}

/// Verify the MAC, then decrypt.
///
/// # Errors
///
/// - `MacMismatch`: the MAC does not match the ciphertext under this key
/// - `DecryptionFailed`: the AEAD tag did not verify
pub fn open(key: &MessageKey, ciphertext: &[u8], mac: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac_key = expand(key, MAC_LABEL);
    let verifier = <HmacSha256 as Mac>::new_from_slice(&mac_key);
    mac_key.zeroize();
    let Ok(mut verifier) = verifier else {
        unreachable!("HMAC accepts keys of any length");
    };
    verifier.update(ciphertext);
    verifier.verify_slice(mac).map_err(|_| CryptoError::MacMismatch)?;

    let mut enc_key = expand(key, ENCRYPTION_LABEL);
    let nonce = expand_nonce(key);
    let cipher = XChaCha20Poly1305::new((&enc_key).into());
    enc_key.zeroize();

    cipher.decrypt(XNonce::from_slice(&nonce), ciphertext).map_err(|_| CryptoError::DecryptionFailed)
}

fn compute_mac(key: &MessageKey, ciphertext: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac_key = expand(key, MAC_LABEL);
    let mac = <HmacSha256 as Mac>::new_from_slice(&mac_key);
    mac_key.zeroize();
    let Ok(mut mac) = mac else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}

fn expand(key: &MessageKey, label: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    expand_into(key, label, &mut out);
    out
}

fn expand_nonce(key: &MessageKey) -> [u8; 24] {
    let mut out = [0u8; 24];
    expand_into(key, NONCE_LABEL, &mut out);
    out
}

fn expand_into(key: &MessageKey, label: &[u8], out: &mut [u8]) {
    let Ok(hkdf) = Hkdf::<Sha256>::from_prk(key.key()) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 PRK length");
    };
    let Ok(()) = hkdf.expand(label, out) else {
        unreachable!("sub-key lengths are valid HKDF-SHA256 output lengths");
    };
}
