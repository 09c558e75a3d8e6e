//! Non-interactive key exchange and cipher suites
//!
//! A session is established by two static key exchanges run side by side: a
//! classical Diffie-Hellman and a post-quantum one. Both are modelled by the
//! same [`KeyExchange`] trait, and a [`Suite`] picks one of each. Higher layers
//! are generic over the suite only.

use std::fmt;

use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Raw output of a key exchange. Zeroized on drop.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// A static, non-interactive key exchange.
///
/// Each side combines its own private key with the partner's public key and
/// both arrive at the same shared secret.
pub trait KeyExchange: Send + Sync + 'static {
    /// Tag written in front of tagged public keys and next to persisted keys.
    const VARIANT: u8;

    /// Human readable name, used in error messages.
    const NAME: &'static str;

    /// Private key type.
    type PrivateKey: Clone + Send + Sync + 'static;

    /// Public key type.
    type PublicKey: Clone + PartialEq + Eq + fmt::Debug + Send + Sync + 'static;

    /// Generate a fresh private key.
    fn generate(rng: &mut impl CryptoRngCore) -> Self::PrivateKey;

    /// Public key matching `private`.
    fn public_key(private: &Self::PrivateKey) -> Self::PublicKey;

    /// Compute the shared secret with a partner's public key.
    fn shared_secret(
        private: &Self::PrivateKey,
        public: &Self::PublicKey,
    ) -> Result<SharedSecret, CryptoError>;

    /// Serialize a private key.
    fn encode_private(private: &Self::PrivateKey) -> Zeroizing<Vec<u8>>;

    /// Deserialize a private key.
    fn decode_private(bytes: &[u8]) -> Result<Self::PrivateKey, CryptoError>;

    /// Serialize a public key.
    fn encode_public(public: &Self::PublicKey) -> Vec<u8>;

    /// Deserialize a public key.
    fn decode_public(bytes: &[u8]) -> Result<Self::PublicKey, CryptoError>;

    /// Serialize a public key with the variant tag as first byte.
    fn encode_public_tagged(public: &Self::PublicKey) -> Vec<u8> {
        let encoded = Self::encode_public(public);
        let mut out = Vec::with_capacity(encoded.len() + 1);
        out.push(Self::VARIANT);
        out.extend_from_slice(&encoded);
        out
    }

    /// Deserialize a tagged public key, rejecting other variants.
    fn decode_public_tagged(bytes: &[u8]) -> Result<Self::PublicKey, CryptoError> {
        let Some((&variant, rest)) = bytes.split_first() else {
            return Err(CryptoError::InvalidKeyLength {
                kind: "tagged public key",
                expected: 1,
                actual: 0,
            });
        };
        if variant != Self::VARIANT {
            return Err(CryptoError::VariantMismatch { expected: Self::VARIANT, actual: variant });
        }
        Self::decode_public(rest)
    }
}

/// Pairs a classical and a post-quantum key exchange.
pub trait Suite: Send + Sync + 'static {
    /// Classical Diffie-Hellman exchange.
    type Dh: KeyExchange;
    /// Post-quantum exchange.
    type Pq: KeyExchange;
}

/// Classical private key of a suite.
pub type DhPrivate<S> = <<S as Suite>::Dh as KeyExchange>::PrivateKey;
/// Classical public key of a suite.
pub type DhPublic<S> = <<S as Suite>::Dh as KeyExchange>::PublicKey;
/// Post-quantum private key of a suite.
pub type PqPrivate<S> = <<S as Suite>::Pq as KeyExchange>::PrivateKey;
/// Post-quantum public key of a suite.
pub type PqPublic<S> = <<S as Suite>::Pq as KeyExchange>::PublicKey;

/// X25519 length for keys and shared secrets.
const X25519_LEN: usize = 32;

/// X25519 Diffie-Hellman (RFC 7748).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X25519;

impl KeyExchange for X25519 {
    const VARIANT: u8 = 0x01;
    const NAME: &'static str = "x25519";

    type PrivateKey = StaticSecret;
    type PublicKey = PublicKey;

    fn generate(rng: &mut impl CryptoRngCore) -> StaticSecret {
        StaticSecret::random_from_rng(rng)
    }

    fn public_key(private: &StaticSecret) -> PublicKey {
        PublicKey::from(private)
    }

    fn shared_secret(
        private: &StaticSecret,
        public: &PublicKey,
    ) -> Result<SharedSecret, CryptoError> {
        let shared = private.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }

    fn encode_private(private: &StaticSecret) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(private.to_bytes().to_vec())
    }

    fn decode_private(bytes: &[u8]) -> Result<StaticSecret, CryptoError> {
        let raw = fixed::<X25519_LEN>(bytes, "x25519 private key")?;
        Ok(StaticSecret::from(*raw))
    }

    fn encode_public(public: &PublicKey) -> Vec<u8> {
        public.as_bytes().to_vec()
    }

    fn decode_public(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
        let raw = fixed::<X25519_LEN>(bytes, "x25519 public key")?;
        Ok(PublicKey::from(*raw))
    }
}

/// Suite with X25519 in both slots.
///
/// Provides classical security only. It keeps the hybrid plumbing exercised
/// until a post-quantum NIKE is plugged into the `Pq` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleX25519;

impl Suite for DoubleX25519 {
    type Dh = X25519;
    type Pq = X25519;
}

fn fixed<const N: usize>(
    bytes: &[u8],
    kind: &'static str,
) -> Result<Zeroizing<[u8; N]>, CryptoError> {
    let raw: [u8; N] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        kind,
        expected: N,
        actual: bytes.len(),
    })?;
    Ok(Zeroizing::new(raw))
}
