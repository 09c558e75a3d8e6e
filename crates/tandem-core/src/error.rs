//! Error types for ratchet operations

use tandem_crypto::CryptoError;
use thiserror::Error;

use crate::{
    ids::{PartnerId, SessionId},
    session::Negotiation,
    storage::StorageError,
};

/// Errors from sessions, relationships, managers and the ratchet store
#[derive(Debug, Error)]
pub enum RatchetError {
    /// Every ordinary (or, for rekeys, every) key of the session is used
    #[error("no keys available")]
    NoKeysAvailable,

    /// Key index outside the session's key pool
    #[error("key {key_num} out of range for {num_keys} keys")]
    KeyOutOfRange {
        /// Requested key index
        key_num: u32,
        /// Size of the key pool
        num_keys: u32,
    },

    /// No manager exists for this partner
    #[error("unknown partner: {partner}")]
    UnknownPartner {
        /// Partner that was looked up
        partner: PartnerId,
    },

    /// No session with this id in the relationship
    #[error("unknown session: {session}")]
    UnknownSession {
        /// Session that was looked up
        session: SessionId,
    },

    /// A manager for this partner already exists
    #[error("partner already exists: {partner}")]
    PartnerExists {
        /// Partner that was being added
        partner: PartnerId,
    },

    /// A processor for this service tag is already registered
    #[error("service already exists: {tag}")]
    ServiceExists {
        /// Tag that was being added
        tag: String,
    },

    /// No processor registered for this service tag
    #[error("unknown service: {tag}")]
    UnknownService {
        /// Tag that was looked up
        tag: String,
    },

    /// Negotiation status change not in the transition table
    #[error("negotiation status change from {from} to {to} is not valid")]
    IllegalNegotiationTransition {
        /// Status before the attempted change
        from: Negotiation,
        /// Requested status
        to: Negotiation,
    },

    /// Session parameters violate a bound
    #[error("invalid session parameters: {reason}")]
    InvalidParams {
        /// Which bound was violated
        reason: String,
    },

    /// A persisted record contradicts itself or its location
    #[error("corrupt record {key}: {reason}")]
    CorruptRecord {
        /// Storage key of the record
        key: String,
        /// What did not match
        reason: String,
    },

    /// Key exchange or message protection failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RatchetError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors mean the local state store can no longer be trusted.
    /// Everything else is either resource exhaustion or a protocol condition
    /// the caller logs and survives.
    pub fn is_fatal(&self) -> bool {
        match self {
            // Local state is damaged or unusable
            Self::Storage(_) => true,
            Self::CorruptRecord { .. } => true,
            Self::InvalidParams { .. } => true,

            // Authentication failures and hostile peer keys come from the network
            Self::Crypto(CryptoError::NonContributory) => false,
            Self::Crypto(e) => !e.is_authentication_failure(),

            // Exhaustion and protocol conditions
            Self::NoKeysAvailable => false,
            Self::KeyOutOfRange { .. } => false,
            Self::UnknownPartner { .. } => false,
            Self::UnknownSession { .. } => false,
            Self::PartnerExists { .. } => false,
            Self::ServiceExists { .. } => false,
            Self::UnknownService { .. } => false,
            Self::IllegalNegotiationTransition { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(RatchetError::Storage(StorageError::Io("disk".to_string())).is_fatal());
        assert!(
            RatchetError::CorruptRecord { key: "k".to_string(), reason: "r".to_string() }
                .is_fatal()
        );
        assert!(
            RatchetError::Crypto(CryptoError::VariantMismatch { expected: 1, actual: 2 })
                .is_fatal()
        );

        assert!(!RatchetError::NoKeysAvailable.is_fatal());
        assert!(!RatchetError::Crypto(CryptoError::MacMismatch).is_fatal());
        assert!(!RatchetError::Crypto(CryptoError::NonContributory).is_fatal());
        assert!(!RatchetError::UnknownSession { session: SessionId::EMPTY }.is_fatal());
        assert!(
            !RatchetError::IllegalNegotiationTransition {
                from: Negotiation::Unconfirmed,
                to: Negotiation::Confirmed,
            }
            .is_fatal()
        );
    }

    #[test]
    fn display_names_statuses() {
        let err = RatchetError::IllegalNegotiationTransition {
            from: Negotiation::Sent,
            to: Negotiation::Sending,
        };
        assert_eq!(err.to_string(), "negotiation status change from Sent to Sending is not valid");
    }
}
