//! Tandem Core
//!
//! Stateful side of the partner ratchet. For each conversation partner a
//! [`Manager`] pairs a send and a receive [`Relationship`], each an ordered
//! list of [`Session`]s. A session owns a fixed pool of one-time keys tracked
//! by a [`KeyStateVector`]; a [`Cypher`] binds one key index to
//! encrypt/decrypt. The [`Ratchet`] owns every manager plus this identity's
//! long-term key pair.
//!
//! # Concurrency
//!
//! All types are `Send + Sync` and synchronous. Session lists are replaced
//! wholesale under a write lock, so readers take a cheap snapshot and never
//! observe a half-updated list. Selecting a send session and popping its key
//! happens under a separate per-relationship send lock.
//!
//! # Persistence
//!
//! Every mutation is written through a [`Store`] before it returns. The
//! negotiation states `Sending` and `NewSessionTriggered` are never written;
//! they are downgraded to `Unconfirmed` and `Confirmed` so an interrupted
//! rekey is simply retried after a restart.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub mod ids;
mod lock;
pub mod manager;
pub mod params;
pub mod ratchet;
pub mod relationship;
pub mod services;
pub mod session;
pub mod state_vector;
pub mod storage;

#[cfg(test)]
mod test_util;

pub use error::RatchetError;
pub use ids::{ConnectionFingerprint, PartnerId, RelationshipFingerprint, RelationshipType, SessionId};
pub use manager::Manager;
pub use params::SessionParams;
pub use ratchet::Ratchet;
pub use relationship::{MAX_CONFIRMED, Relationship};
pub use services::{E2E_TAG, NoopServiceHandler, Processor, SILENT_TAG, Service, ServiceHandler};
pub use session::{
    Cypher, CypherHandler, EncryptedPayload, Negotiation, NoopCypherHandler, Session, SessionKeys,
    Status,
};
pub use state_vector::KeyStateVector;
pub use storage::{ChaoticKv, Kv, MemoryKv, RedbKv, Store, StorageError, VersionedObject};
