//! Message-level handle on one session key

use std::{fmt, sync::Arc};

use tandem_crypto::{
    KeyFingerprint, KeyResidue, MAC_SIZE, MessageKey, Suite, derive_message_key, key_fingerprint,
    key_residue, open, seal,
};

use super::Session;
use crate::error::RatchetError;

/// Encrypt/decrypt handle for one key index of a session.
///
/// Holds no key material; the message key is re-derived on each call.
pub struct Cypher<S: Suite> {
    session: Arc<Session<S>>,
    key_num: u32,
}

/// Output of [`Cypher::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Identifies the key to the receiver
    pub fingerprint: KeyFingerprint,
    /// Encrypted message, AEAD tag included
    pub ciphertext: Vec<u8>,
    /// Detached MAC over the ciphertext
    pub mac: [u8; MAC_SIZE],
    /// Residue of the key used
    pub key_residue: KeyResidue,
}

impl<S: Suite> Cypher<S> {
    pub(crate) fn new(session: Arc<Session<S>>, key_num: u32) -> Self {
        Self { session, key_num }
    }

    /// Session the key belongs to.
    pub fn session(&self) -> &Arc<Session<S>> {
        &self.session
    }

    /// Key index within the session.
    pub fn key_num(&self) -> u32 {
        self.key_num
    }

    /// Fingerprint of the key.
    pub fn fingerprint(&self) -> KeyFingerprint {
        key_fingerprint(
            self.session.base_key(),
            self.key_num,
            self.session.relationship_fingerprint().as_bytes(),
        )
    }

    /// Encrypt `plaintext` under this key.
    pub fn encrypt(&self, plaintext: &[u8]) -> EncryptedPayload {
        let key = self.message_key();
        let sealed = seal(&key, plaintext);

        EncryptedPayload {
            fingerprint: self.fingerprint(),
            ciphertext: sealed.ciphertext,
            mac: sealed.mac,
            key_residue: key_residue(&key),
        }
    }

    /// Verify and decrypt a message sealed under this key.
    ///
    /// The caller still has to [`use_key`](Self::use_key) afterwards.
    pub fn decrypt(&self, ciphertext: &[u8], mac: &[u8]) -> Result<(Vec<u8>, KeyResidue), RatchetError> {
        let key = self.message_key();
        let plaintext = open(&key, ciphertext, mac)?;
        Ok((plaintext, key_residue(&key)))
    }

    /// Mark the key as used in the session's key state.
    pub fn use_key(&self) -> Result<(), RatchetError> {
        self.session.key_state().use_key(self.key_num)
    }

    fn message_key(&self) -> MessageKey {
        derive_message_key(
            self.session.base_key(),
            self.key_num,
            self.session.relationship_fingerprint().as_bytes(),
        )
    }
}

impl<S: Suite> Clone for Cypher<S> {
    fn clone(&self) -> Self {
        Self { session: Arc::clone(&self.session), key_num: self.key_num }
    }
}

impl<S: Suite> fmt::Debug for Cypher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cypher")
            .field("session", &self.session.id())
            .field("key_num", &self.key_num)
            .finish()
    }
}

/// Receives the keys of receive sessions as they appear and disappear.
///
/// The inbound message path uses it to map a key fingerprint back to a
/// [`Cypher`].
pub trait CypherHandler<S: Suite>: Send + Sync {
    /// A key became available for decryption.
    fn add_key(&self, cypher: Cypher<S>);

    /// A key was retired without being used.
    fn delete_key(&self, cypher: &Cypher<S>);
}

/// Handler that ignores every key.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCypherHandler;

impl<S: Suite> CypherHandler<S> for NoopCypherHandler {
    fn add_key(&self, _cypher: Cypher<S>) {}

    fn delete_key(&self, _cypher: &Cypher<S>) {}
}
