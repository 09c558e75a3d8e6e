//! Error types for the rekey drivers

use tandem_core::{Negotiation, PartnerId, RatchetError, SessionId};
use thiserror::Error;

use crate::transport::SendError;

/// Errors from triggering, negotiating and handling rekeys
#[derive(Debug, Error)]
pub enum RekeyError {
    /// A rekey message arrived without end-to-end encryption
    #[error("rekey message was not end-to-end encrypted")]
    NotEndToEnd,

    /// The sender is not a known partner
    #[error("unknown partner: {partner}")]
    UnknownPartner {
        /// Claimed sender
        partner: PartnerId,
    },

    /// The referenced session does not exist
    #[error("unknown session: {session}")]
    UnknownSession {
        /// Referenced session
        session: SessionId,
    },

    /// Payload could not be decoded
    #[error("malformed rekey message: {reason}")]
    Malformed {
        /// What failed to decode
        reason: String,
    },

    /// Session is not in a state a rekey can start from
    #[error("cannot negotiate session {session} in status {status}")]
    InvalidNegotiationStatus {
        /// Session passed in
        session: SessionId,
        /// Its status at the time
        status: Negotiation,
    },

    /// Rounds carrying a rekey message failed or timed out
    #[error("rekey for session {session} not delivered: {reason}")]
    Transmission {
        /// Session being negotiated
        session: SessionId,
        /// Round outcome
        reason: String,
    },

    /// The new session was triggered again before it was sent
    #[error("session {session} ran out of keys before its rekey was sent; no rekey is possible")]
    Exhausted {
        /// Session being negotiated
        session: SessionId,
    },

    /// Handing the message to the transport failed
    #[error(transparent)]
    Send(#[from] SendError),

    /// Shutdown was signalled while waiting
    #[error("stopped")]
    Stopped,

    /// Session store failure
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
}

impl RekeyError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Only local storage faults are fatal; everything caused by the network
    /// or the partner is logged and survived.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Ratchet(e) => e.is_fatal(),
            Self::NotEndToEnd
            | Self::UnknownPartner { .. }
            | Self::UnknownSession { .. }
            | Self::Malformed { .. }
            | Self::InvalidNegotiationStatus { .. }
            | Self::Transmission { .. }
            | Self::Exhausted { .. }
            | Self::Send(_)
            | Self::Stopped => false,
        }
    }
}
