//! Error types for the simulator

use tandem_core::{PartnerId, RatchetError};
use tandem_rekey::{RekeyError, SendError};
use thiserror::Error;

/// Simulation failures
#[derive(Debug, Error)]
pub enum SimError {
    /// No node with this id is attached to the network
    #[error("no node {node} on the network")]
    UnknownNode {
        /// Recipient that was addressed
        node: PartnerId,
    },

    /// Messages were still missing when the wait ran out
    #[error("{missing} messages undelivered")]
    Undelivered {
        /// Messages never processed by their recipient
        missing: usize,
    },

    /// Session store failure
    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    /// Rekey driver failure
    #[error(transparent)]
    Rekey(#[from] RekeyError),

    /// Transport failure
    #[error(transparent)]
    Send(#[from] SendError),

    /// Storage backend failure
    #[error(transparent)]
    Storage(#[from] tandem_core::StorageError),
}
