//! Disk forms of session and origin key material

use serde::{Deserialize, Serialize};
use tandem_crypto::{BaseKey, CryptoError, KeyExchange, Suite};
use zeroize::Zeroize;

use super::{Negotiation, SessionKeys};
use crate::{
    ids::{PartnerId, RelationshipFingerprint, RelationshipType, SessionId},
    params::SessionParams,
};

/// Record format version for sessions
pub(crate) const SESSION_VERSION: u64 = 0;

/// Encoded key material of one session (or of a relationship's origin).
///
/// Variant tags are stored next to the keys and checked on decode. Zeroized
/// on drop.
#[derive(Serialize, Deserialize)]
pub(crate) struct EncodedKeys {
    pub(crate) dh_variant: u8,
    pub(crate) pq_variant: u8,
    pub(crate) my_private: Vec<u8>,
    pub(crate) partner_public: Vec<u8>,
    pub(crate) my_pq_private: Vec<u8>,
    pub(crate) partner_pq_public: Vec<u8>,
}

impl Drop for EncodedKeys {
    fn drop(&mut self) {
        self.my_private.zeroize();
        self.my_pq_private.zeroize();
    }
}

impl<S: Suite> SessionKeys<S> {
    pub(crate) fn encode(&self) -> EncodedKeys {
        EncodedKeys {
            dh_variant: S::Dh::VARIANT,
            pq_variant: S::Pq::VARIANT,
            my_private: S::Dh::encode_private(&self.my_private).to_vec(),
            partner_public: S::Dh::encode_public(&self.partner_public),
            my_pq_private: S::Pq::encode_private(&self.my_pq_private).to_vec(),
            partner_pq_public: S::Pq::encode_public(&self.partner_pq_public),
        }
    }

    pub(crate) fn decode(encoded: &EncodedKeys) -> Result<Self, CryptoError> {
        if encoded.dh_variant != S::Dh::VARIANT {
            return Err(CryptoError::VariantMismatch {
                expected: S::Dh::VARIANT,
                actual: encoded.dh_variant,
            });
        }
        if encoded.pq_variant != S::Pq::VARIANT {
            return Err(CryptoError::VariantMismatch {
                expected: S::Pq::VARIANT,
                actual: encoded.pq_variant,
            });
        }

        Ok(Self {
            my_private: S::Dh::decode_private(&encoded.my_private)?,
            partner_public: S::Dh::decode_public(&encoded.partner_public)?,
            my_pq_private: S::Pq::decode_private(&encoded.my_pq_private)?,
            partner_pq_public: S::Pq::decode_public(&encoded.partner_pq_public)?,
        })
    }
}

/// Disk form of a session.
#[derive(Serialize, Deserialize)]
pub(crate) struct SessionRecord {
    pub(crate) params: SessionParams,
    pub(crate) kind: RelationshipType,
    pub(crate) partner: PartnerId,
    pub(crate) base_key: [u8; 32],
    pub(crate) keys: EncodedKeys,
    pub(crate) partner_source: SessionId,
    pub(crate) relationship_fingerprint: RelationshipFingerprint,
    pub(crate) negotiation: Negotiation,
    pub(crate) rekey_threshold: u32,
}

impl SessionRecord {
    pub(crate) fn base_key(&self) -> BaseKey {
        BaseKey::from_bytes(self.base_key)
    }
}

impl Drop for SessionRecord {
    fn drop(&mut self) {
        self.base_key.zeroize();
    }
}
