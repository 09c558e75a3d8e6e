//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from key exchange and message protection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Encoded key material has the wrong length
    #[error("invalid {kind} length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// What was being decoded
        kind: &'static str,
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// The exchange produced an all-zero secret (low-order public key)
    #[error("non-contributory key exchange")]
    NonContributory,

    /// Tagged key material belongs to a different key exchange variant
    #[error("key exchange variant mismatch: expected {expected}, got {actual}")]
    VariantMismatch {
        /// Variant tag of the local suite
        expected: u8,
        /// Variant tag found in the encoding
        actual: u8,
    },

    /// Detached MAC did not verify
    #[error("MAC mismatch")]
    MacMismatch,

    /// AEAD decryption failed after the MAC verified
    #[error("decryption failed")]
    DecryptionFailed,
}

impl CryptoError {
    /// Returns true if the error indicates tampering rather than bad local
    /// input.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::MacMismatch | Self::DecryptionFailed)
    }
}
