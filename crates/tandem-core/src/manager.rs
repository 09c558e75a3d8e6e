//! Per-partner pairing of a send and a receive relationship

use std::sync::Arc;

use rand::rngs::OsRng;
use tandem_crypto::{
    DhPrivate, DhPublic, KeyExchange, PqPrivate, PqPublic, Suite, connection_fingerprint,
    relationship_fingerprint,
};

use crate::{
    error::RatchetError,
    ids::{ConnectionFingerprint, PartnerId, RelationshipFingerprint, RelationshipType, SessionId},
    params::SessionParams,
    relationship::{Relationship, RelationshipContext},
    services::Service,
    session::{Cypher, CypherHandler, EncodedKeys, Negotiation, Session, SessionKeys},
    storage::Store,
};

/// Record format version for manager records
const MANAGER_VERSION: u64 = 0;

/// Storage key of the origin key material
const ORIGIN_KEY: &str = "originKeys";

/// Store segment all partner sub-trees live under
const PARTNER_PREFIX: &str = "partner";

/// Everything this identity holds about one partner.
///
/// The origin keys are the ones the relationship was established with. They
/// are kept apart from any session so the fingerprints stay stable after the
/// first sessions are pruned.
pub struct Manager<S: Suite> {
    store: Store,
    my_id: PartnerId,
    partner: PartnerId,
    origin: SessionKeys<S>,
    send: Relationship<S>,
    receive: Relationship<S>,
}

impl<S: Suite> Manager<S> {
    /// Create and persist a manager whose first send and receive sessions are
    /// built from `keys`.
    pub fn new(
        root: &Store,
        my_id: PartnerId,
        partner: PartnerId,
        keys: SessionKeys<S>,
        send_params: SessionParams,
        receive_params: SessionParams,
        cypher_handler: Arc<dyn CypherHandler<S>>,
    ) -> Result<Self, RatchetError> {
        let store = partner_store(root, partner);
        store.set_record(ORIGIN_KEY, MANAGER_VERSION, &keys.encode())?;

        let (send_fp, receive_fp) = fingerprints(&keys, my_id, partner);
        let send = Relationship::new(
            store.prefix(RelationshipType::Send.prefix()),
            RelationshipContext {
                kind: RelationshipType::Send,
                partner,
                fingerprint: send_fp,
                cypher_handler: Arc::clone(&cypher_handler),
            },
            keys.clone(),
            send_params,
        )?;
        let receive = Relationship::new(
            store.prefix(RelationshipType::Receive.prefix()),
            RelationshipContext {
                kind: RelationshipType::Receive,
                partner,
                fingerprint: receive_fp,
                cypher_handler,
            },
            keys.clone(),
            receive_params,
        )?;

        tracing::info!(%partner, connection = %connection(send_fp, receive_fp), "partner added");

        Ok(Self { store, my_id, partner, origin: keys, send, receive })
    }

    /// Load a persisted manager.
    pub fn load(
        root: &Store,
        my_id: PartnerId,
        partner: PartnerId,
        cypher_handler: Arc<dyn CypherHandler<S>>,
    ) -> Result<Self, RatchetError> {
        let store = partner_store(root, partner);
        let encoded: EncodedKeys = store.load_record(ORIGIN_KEY, MANAGER_VERSION)?;
        let origin = SessionKeys::decode(&encoded)?;

        let send = Relationship::load(
            store.prefix(RelationshipType::Send.prefix()),
            RelationshipType::Send,
            partner,
            Arc::clone(&cypher_handler),
        )?;
        let receive = Relationship::load(
            store.prefix(RelationshipType::Receive.prefix()),
            RelationshipType::Receive,
            partner,
            cypher_handler,
        )?;

        Ok(Self { store, my_id, partner, origin, send, receive })
    }

    /// Partner this manager talks to.
    pub fn partner_id(&self) -> PartnerId {
        self.partner
    }

    /// Own identity.
    pub fn my_id(&self) -> PartnerId {
        self.my_id
    }

    /// Own public key the relationship was established with.
    pub fn origin_my_public(&self) -> DhPublic<S> {
        self.origin.my_public()
    }

    /// Partner public key the relationship was established with.
    pub fn origin_partner_public(&self) -> &DhPublic<S> {
        &self.origin.partner_public
    }

    /// Own post-quantum public key the relationship was established with.
    pub fn origin_my_pq_public(&self) -> PqPublic<S> {
        self.origin.my_pq_public()
    }

    /// Partner post-quantum public key the relationship was established with.
    pub fn origin_partner_pq_public(&self) -> &PqPublic<S> {
        &self.origin.partner_pq_public
    }

    /// Outbound sessions.
    pub fn send_relationship(&self) -> &Relationship<S> {
        &self.send
    }

    /// Inbound sessions.
    pub fn receive_relationship(&self) -> &Relationship<S> {
        &self.receive
    }

    /// Create a send session for a rekey of `source`.
    ///
    /// Missing private keys are generated. The partner keys are those of
    /// `source`. The session starts out `Sending`.
    pub fn new_send_session(
        &self,
        my_private: Option<DhPrivate<S>>,
        my_pq_private: Option<PqPrivate<S>>,
        params: SessionParams,
        source: &Session<S>,
    ) -> Result<Arc<Session<S>>, RatchetError> {
        let keys = SessionKeys {
            my_private: my_private.unwrap_or_else(|| S::Dh::generate(&mut OsRng)),
            partner_public: source.partner_public().clone(),
            my_pq_private: my_pq_private.unwrap_or_else(|| S::Pq::generate(&mut OsRng)),
            partner_pq_public: source.partner_pq_public().clone(),
        };

        let (session, _) = self.send.add_session(keys, source.id(), Negotiation::Sending, params)?;
        tracing::info!(session = %session, source = %source.id(), "new send session");
        Ok(session)
    }

    /// Create the receive session mirroring a partner's rekey of `source`.
    ///
    /// Own keys are those of `source`. Returns the existing session and
    /// `true` when these keys were already seen, which makes a replayed
    /// trigger harmless.
    pub fn new_receive_session(
        &self,
        partner_public: DhPublic<S>,
        partner_pq_public: PqPublic<S>,
        params: SessionParams,
        source: &Session<S>,
    ) -> Result<(Arc<Session<S>>, bool), RatchetError> {
        let keys = SessionKeys {
            my_private: source.my_private().clone(),
            partner_public,
            my_pq_private: source.my_pq_private().clone(),
            partner_pq_public,
        };

        let (session, duplicate) =
            self.receive.add_session(keys, source.id(), Negotiation::Confirmed, params)?;
        if !duplicate {
            tracing::info!(session = %session, source = %source.id(), "new receive session");
        }
        Ok((session, duplicate))
    }

    /// Key for the next ordinary message to the partner.
    pub fn pop_send_cypher(&self) -> Result<Cypher<S>, RatchetError> {
        self.send.pop_send_cypher()
    }

    /// Key for the next rekey message to the partner.
    pub fn pop_rekey_cypher(&self) -> Result<Cypher<S>, RatchetError> {
        self.send.pop_rekey_cypher()
    }

    /// Send sessions that need a negotiation started.
    pub fn trigger_negotiations(&self) -> Vec<Arc<Session<S>>> {
        self.send.trigger_negotiation()
    }

    /// Confirm a send session and prune old ones.
    pub fn confirm(&self, id: SessionId) -> Result<(), RatchetError> {
        self.send.confirm(id)
    }

    /// Send session by id.
    pub fn get_send_session(&self, id: SessionId) -> Option<Arc<Session<S>>> {
        self.send.get_by_id(id)
    }

    /// Receive session by id.
    pub fn get_receive_session(&self, id: SessionId) -> Option<Arc<Session<S>>> {
        self.receive.get_by_id(id)
    }

    /// Fingerprint of the send relationship.
    pub fn send_relationship_fingerprint(&self) -> RelationshipFingerprint {
        self.send.fingerprint()
    }

    /// Fingerprint of the receive relationship.
    pub fn receive_relationship_fingerprint(&self) -> RelationshipFingerprint {
        self.receive.fingerprint()
    }

    /// Fingerprint of the whole connection. Both partners compute the same
    /// value.
    pub fn connection_fingerprint(&self) -> ConnectionFingerprint {
        connection(self.send.fingerprint(), self.receive.fingerprint())
    }

    /// Service for `tag` bound to this partner's connection.
    pub fn make_service(&self, tag: &str) -> Service {
        Service {
            identifier: self.connection_fingerprint().as_bytes().to_vec(),
            tag: tag.to_string(),
            metadata: self.partner.as_bytes().to_vec(),
        }
    }

    /// Delete every session and record of this partner.
    pub fn delete(&self) -> Result<(), RatchetError> {
        self.send.delete()?;
        self.receive.delete()?;
        self.store.delete_object(ORIGIN_KEY, MANAGER_VERSION)?;

        tracing::info!(partner = %self.partner, "partner deleted");
        Ok(())
    }
}

fn partner_store(root: &Store, partner: PartnerId) -> Store {
    root.prefix(PARTNER_PREFIX).prefix(&partner.to_hex())
}

fn fingerprints<S: Suite>(
    keys: &SessionKeys<S>,
    my_id: PartnerId,
    partner: PartnerId,
) -> (RelationshipFingerprint, RelationshipFingerprint) {
    let my_public = S::Dh::encode_public(&keys.my_public());
    let partner_public = S::Dh::encode_public(&keys.partner_public);

    let send = relationship_fingerprint(
        &my_public,
        &partner_public,
        my_id.as_bytes(),
        partner.as_bytes(),
    );
    let receive = relationship_fingerprint(
        &partner_public,
        &my_public,
        partner.as_bytes(),
        my_id.as_bytes(),
    );
    (send.into(), receive.into())
}

fn connection(send: RelationshipFingerprint, receive: RelationshipFingerprint) -> ConnectionFingerprint {
    connection_fingerprint(send.as_bytes(), receive.as_bytes()).into()
}
