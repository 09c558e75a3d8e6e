//! Rekey driver parameters

use std::time::Duration;

use crate::messages::MessageType;

/// Default time to wait for the rounds carrying a rekey message
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeouts and message types of the rekey protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyParams {
    /// How long to wait for rounds to complete
    pub round_timeout: Duration,
    /// Message type of triggers
    pub trigger: MessageType,
    /// Message type of confirms
    pub confirm: MessageType,
}

impl Default for RekeyParams {
    fn default() -> Self {
        Self {
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            trigger: MessageType::KEY_EXCHANGE_TRIGGER,
            confirm: MessageType::KEY_EXCHANGE_CONFIRM,
        }
    }
}
