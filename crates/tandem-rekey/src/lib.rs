//! Tandem Rekey
//!
//! Async drivers for the rekey protocol between two partners.
//!
//! ```text
//!   initiator                                   responder
//!   ---------                                   ---------
//!   check_key_exchanges
//!     trigger (new send session, Sending)
//!     negotiate ---- RekeyTrigger{source, keys} ---->  handle_trigger
//!       Sent                                        new receive session
//!                                                   check garbled messages
//!   handle_confirm <------ RekeyConfirm{new id} ---- (always, even for replays)
//!     Confirmed, prune old sessions
//! ```
//!
//! Transport, round tracking and event reporting are collaborators behind
//! traits in [`transport`]. Every handler failure caused by network input is
//! returned as a [`RekeyError`] for the caller to log; nothing panics.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub mod messages;
pub mod params;
pub mod rekey;
pub mod transport;
pub mod wait;

pub use error::RekeyError;
pub use messages::{MessageType, ReceivedMessage, RekeyConfirm, RekeyTrigger};
pub use params::RekeyParams;
pub use rekey::Rekey;
pub use transport::{
    E2eSender, EventReporter, GarbledMessages, MessageId, RoundId, RoundResults, RoundTracker,
    SendError, SendParams, SendReport,
};
pub use wait::wait_for_key;
