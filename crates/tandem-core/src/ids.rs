//! Identifiers and fingerprints

use std::fmt;

use serde::{Deserialize, Serialize};
use tandem_crypto::BaseKey;

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Wrap raw bytes.
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Full lowercase hex encoding.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

byte_id!(
    /// Identity of a conversation partner (or of this client).
    PartnerId
);

byte_id!(
    /// Digest of a session's base key.
    SessionId
);

byte_id!(
    /// Digest identifying one direction of a partner relationship.
    RelationshipFingerprint
);

byte_id!(
    /// Digest identifying a partner connection, equal on both sides.
    ConnectionFingerprint
);

impl fmt::Display for PartnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl SessionId {
    /// Source id of a relationship's first session.
    pub const EMPTY: Self = Self([0; 32]);

    /// Session id owning `base_key`.
    pub fn from_base_key(base_key: &BaseKey) -> Self {
        Self(tandem_crypto::session_id(base_key))
    }

    /// True for [`SessionId::EMPTY`].
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for RelationshipFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for ConnectionFingerprint {
    /// First 15 hex characters, the form shown to users for comparison.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = hex::encode(self.0);
        f.write_str(&full[..15])
    }
}

/// Direction of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipType {
    /// Sessions used to encrypt outgoing messages
    Send,
    /// Sessions used to decrypt incoming messages
    Receive,
}

impl RelationshipType {
    /// Storage prefix segment for this direction.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "Send",
            Self::Receive => "Receive",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_short_hex() {
        let id = PartnerId::new([0xAB; 32]);
        assert_eq!(id.to_string(), "abababababababab");
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(format!("{id:?}"), "PartnerId(abababababababab)");
    }

    #[test]
    fn connection_fingerprint_shows_fifteen_chars() {
        let fp = ConnectionFingerprint::new([0x12; 32]);
        assert_eq!(fp.to_string(), "121212121212121");
    }

    #[test]
    fn session_id_tracks_base_key() {
        let key = BaseKey::from_bytes([3; 32]);
        let id = SessionId::from_base_key(&key);

        assert_eq!(id, SessionId::from_base_key(&BaseKey::from_bytes([3; 32])));
        assert_ne!(id, SessionId::from_base_key(&BaseKey::from_bytes([4; 32])));
        assert!(!id.is_empty());
        assert!(SessionId::EMPTY.is_empty());
    }

    #[test]
    fn relationship_prefixes() {
        assert_eq!(RelationshipType::Send.prefix(), "send");
        assert_eq!(RelationshipType::Receive.prefix(), "receive");
    }
}
