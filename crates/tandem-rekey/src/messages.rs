//! Rekey wire messages
//!
//! Both messages travel end-to-end encrypted and are encoded as CBOR.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tandem_core::{PartnerId, Session, SessionId};
use tandem_crypto::{DhPublic, KeyExchange, PqPublic, Suite};

use crate::error::RekeyError;

/// Message type as seen by the messaging layer's dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(pub u32);

impl MessageType {
    /// Ordinary end-to-end text
    pub const TEXT: Self = Self(2);
    /// Announces a new session
    pub const KEY_EXCHANGE_TRIGGER: Self = Self(30);
    /// Acknowledges a new session
    pub const KEY_EXCHANGE_CONFIRM: Self = Self(31);
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TEXT => write!(f, "Text"),
            Self::KEY_EXCHANGE_TRIGGER => write!(f, "KeyExchangeTrigger"),
            Self::KEY_EXCHANGE_CONFIRM => write!(f, "KeyExchangeConfirm"),
            Self(other) => write!(f, "MessageType({other})"),
        }
    }
}

/// A decrypted inbound message handed to a rekey handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Dispatcher type
    pub message_type: MessageType,
    /// Partner it came from
    pub sender: PartnerId,
    /// Decrypted payload
    pub payload: Vec<u8>,
    /// Arrived end-to-end encrypted
    pub encrypted: bool,
}

/// "I started a new session from `session_id`, here are my new keys."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyTrigger {
    /// Session being superseded
    pub session_id: SessionId,
    /// Sender's new classical public key
    pub public_key: Vec<u8>,
    /// Sender's new post-quantum public key, variant byte first
    pub pq_public_key: Vec<u8>,
}

impl RekeyTrigger {
    /// Trigger announcing `session`, naming its source.
    pub fn for_session<S: Suite>(session: &Session<S>) -> Self {
        Self {
            session_id: session.partner_source(),
            public_key: S::Dh::encode_public(&session.keys().my_public()),
            pq_public_key: S::Pq::encode_public_tagged(&session.keys().my_pq_public()),
        }
    }

    /// Decode the announced public keys.
    pub fn public_keys<S: Suite>(&self) -> Result<(DhPublic<S>, PqPublic<S>), RekeyError> {
        let public = S::Dh::decode_public(&self.public_key).map_err(malformed)?;
        let pq_public = S::Pq::decode_public_tagged(&self.pq_public_key).map_err(malformed)?;
        Ok((public, pq_public))
    }

    /// CBOR encoding.
    pub fn encode(&self) -> Result<Vec<u8>, RekeyError> {
        encode(self)
    }

    /// Decode from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self, RekeyError> {
        decode(bytes)
    }
}

/// "I hold session `session_id` now."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyConfirm {
    /// The new session
    pub session_id: SessionId,
}

impl RekeyConfirm {
    /// CBOR encoding.
    pub fn encode(&self) -> Result<Vec<u8>, RekeyError> {
        encode(self)
    }

    /// Decode from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self, RekeyError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, RekeyError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes).map_err(malformed)?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RekeyError> {
    ciborium::from_reader(bytes).map_err(malformed)
}

fn malformed(e: impl fmt::Display) -> RekeyError {
    RekeyError::Malformed { reason: e.to_string() }
}
