//! Collaborators the rekey drivers talk to
//!
//! The drivers never touch the network themselves. An [`E2eSender`]
//! encrypts and sends, a [`RoundTracker`] reports whether the rounds carrying
//! a message completed.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tandem_core::PartnerId;
use thiserror::Error;

use crate::messages::MessageType;

/// Identifies one transmission round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundId(pub u64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 32]);

/// How a message is sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendParams {
    /// Encrypt under a reserved rekey key
    pub rekey: bool,
    /// Label for logs
    pub debug_tag: String,
}

impl SendParams {
    /// Parameters for a rekey protocol message.
    pub fn rekey(debug_tag: &str) -> Self {
        Self { rekey: true, debug_tag: debug_tag.to_string() }
    }
}

/// What the transport did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Rounds the message's parts went out in
    pub rounds: Vec<RoundId>,
    /// Id of the message
    pub message_id: MessageId,
}

/// The transport refused or failed to send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("send failed: {reason}")]
pub struct SendError {
    /// Transport's explanation
    pub reason: String,
}

impl SendError {
    /// Error with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Outcome of tracking a set of rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoundResults {
    /// Rounds that completed
    pub succeeded: usize,
    /// Rounds that failed
    pub failed: usize,
    /// Tracking gave up before every round resolved
    pub timed_out: bool,
}

impl RoundResults {
    /// Every round completed in time.
    pub fn all_succeeded(&self) -> bool {
        !self.timed_out && self.failed == 0
    }
}

impl fmt::Display for RoundResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} succeeded, {} failed", self.succeeded, self.failed)?;
        if self.timed_out {
            write!(f, ", timed out")?;
        }
        Ok(())
    }
}

/// Sends end-to-end encrypted messages.
#[async_trait]
pub trait E2eSender: Send + Sync {
    /// Encrypt `payload` for `recipient` and send it.
    async fn send_e2e(
        &self,
        message_type: MessageType,
        recipient: PartnerId,
        payload: Vec<u8>,
        params: SendParams,
    ) -> Result<SendReport, SendError>;
}

/// Learns whether rounds completed.
#[async_trait]
pub trait RoundTracker: Send + Sync {
    /// Wait until every round in `rounds` resolved or `timeout` passed.
    async fn track(&self, rounds: &[RoundId], timeout: Duration) -> RoundResults;
}

/// Retries inbound messages that could not be decrypted yet.
pub trait GarbledMessages: Send + Sync {
    /// Try every held message again.
    fn check_garbled_messages(&self);
}

/// Surfaces notable events to the application.
pub trait EventReporter: Send + Sync {
    /// Report an event.
    fn report(&self, priority: u8, category: &str, event_type: &str, details: &str);
}
