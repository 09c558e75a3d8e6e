//! Tandem Sim
//!
//! Two ratchets talking over an in-process network. Each [`Node`] wires a
//! [`tandem_core::Ratchet`] to a [`tandem_rekey::Rekey`] driver: outgoing
//! texts pop send keys, inbound envelopes are matched to receive keys by
//! fingerprint, and rekey triggers and confirms flow through the same path
//! as any other message. The [`Network`] can drop messages to exercise the
//! retry path.

#![forbid(unsafe_code)]

pub mod error;
pub mod network;
pub mod node;
pub mod run;

pub use error::SimError;
pub use network::{Envelope, Network};
pub use node::{KeyMap, Node, Services, SimSuite, TextInbox};
pub use run::{SimConfig, Storage, Summary, run};
