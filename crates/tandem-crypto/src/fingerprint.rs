//! Relationship and connection fingerprints

use sha2::{Digest, Sha256};

/// Label for relationship fingerprints
const RELATIONSHIP_LABEL: &[u8] = b"tandemRelationshipV1";

/// Label for connection fingerprints
const CONNECTION_LABEL: &[u8] = b"tandemConnectionV1";

/// Fingerprint of one direction of a partner relationship.
///
/// The public keys are ordered before hashing while the identities keep their
/// sender/receiver roles. A's send relationship with B therefore has the same
/// fingerprint as B's receive relationship with A, and the opposite direction
/// differs.
pub fn relationship_fingerprint(
    sender_public: &[u8],
    receiver_public: &[u8],
    sender_id: &[u8],
    receiver_id: &[u8],
) -> [u8; 32] {
    let (low, high) = if sender_public <= receiver_public {
        (sender_public, receiver_public)
    } else {
        (receiver_public, sender_public)
    };

    let mut hasher = Sha256::new();
    hasher.update(RELATIONSHIP_LABEL);
    hasher.update(low);
    hasher.update(high);
    hasher.update(sender_id);
    hasher.update(receiver_id);
    hasher.finalize().into()
}

/// Fingerprint of the whole connection, the same for both partners.
pub fn connection_fingerprint(send: &[u8; 32], receive: &[u8; 32]) -> [u8; 32] {
    let (low, high) = if send <= receive { (send, receive) } else { (receive, send) };

    let mut hasher = Sha256::new();
    hasher.update(CONNECTION_LABEL);
    hasher.update(low);
    hasher.update(high);
    hasher.finalize().into()
}
