//! One directional generation of the partner ratchet
//!
//! A session is created from a hybrid key exchange and holds a fixed pool of
//! one-time keys. `num_rekeys` keys at the end of the pool are held back for
//! rekey messages, so a session can always announce its successor even when
//! ordinary traffic has drained it.

mod cypher;
mod negotiation;
mod record;

use std::{fmt, sync::Arc, sync::RwLock};

use rand::Rng;
use tandem_crypto::{
    BaseKey, CryptoError, DhPrivate, DhPublic, KeyExchange, PqPrivate, PqPublic, Suite,
    derive_base_key, derive_key_count,
};

pub use self::{
    cypher::{Cypher, CypherHandler, EncryptedPayload, NoopCypherHandler},
    negotiation::{Negotiation, Status},
};
pub(crate) use self::record::EncodedKeys;
use self::record::{SESSION_VERSION, SessionRecord};
use crate::{
    error::RatchetError,
    ids::{PartnerId, RelationshipFingerprint, RelationshipType, SessionId},
    lock,
    params::SessionParams,
    relationship::RelationshipContext,
    state_vector::KeyStateVector,
    storage::Store,
};

/// Storage key of the session record
const SESSION_KEY: &str = "session";

/// Storage key of the session's key state vector
const KEY_STATE_KEY: &str = "keyStates";

/// Key material a session is built from.
pub struct SessionKeys<S: Suite> {
    /// Own classical private key
    pub my_private: DhPrivate<S>,
    /// Partner's classical public key
    pub partner_public: DhPublic<S>,
    /// Own post-quantum private key
    pub my_pq_private: PqPrivate<S>,
    /// Partner's post-quantum public key
    pub partner_pq_public: PqPublic<S>,
}

impl<S: Suite> Clone for SessionKeys<S> {
    fn clone(&self) -> Self {
        Self {
            my_private: self.my_private.clone(),
            partner_public: self.partner_public.clone(),
            my_pq_private: self.my_pq_private.clone(),
            partner_pq_public: self.partner_pq_public.clone(),
        }
    }
}

impl<S: Suite> SessionKeys<S> {
    /// Hybrid base key of these keys.
    pub fn base_key(&self) -> Result<BaseKey, CryptoError> {
        let dh = S::Dh::shared_secret(&self.my_private, &self.partner_public)?;
        let pq = S::Pq::shared_secret(&self.my_pq_private, &self.partner_pq_public)?;
        Ok(derive_base_key(&dh, &pq))
    }

    /// Own classical public key.
    pub fn my_public(&self) -> DhPublic<S> {
        S::Dh::public_key(&self.my_private)
    }

    /// Own post-quantum public key.
    pub fn my_pq_public(&self) -> PqPublic<S> {
        S::Pq::public_key(&self.my_pq_private)
    }
}

/// A send or receive session with one partner.
pub struct Session<S: Suite> {
    store: Store,
    ctx: Arc<RelationshipContext<S>>,
    params: SessionParams,
    id: SessionId,
    base_key: BaseKey,
    keys: SessionKeys<S>,
    partner_source: SessionId,
    rekey_threshold: u32,
    key_state: KeyStateVector,
    negotiation: RwLock<Negotiation>,
}

impl<S: Suite> Session<S> {
    /// Build a new session and persist it.
    ///
    /// `base_key` must be `keys.base_key()`; callers compute it first to
    /// check for duplicates.
    pub(crate) fn create(
        parent: &Store,
        ctx: &Arc<RelationshipContext<S>>,
        keys: SessionKeys<S>,
        base_key: BaseKey,
        partner_source: SessionId,
        negotiation: Negotiation,
        params: SessionParams,
    ) -> Result<Arc<Self>, RatchetError> {
        params.validate()?;

        let id = SessionId::from_base_key(&base_key);
        let num_keys = derive_key_count(&base_key, params.min_keys, params.max_keys);
        let rekey_threshold = (f64::from(num_keys) * params.rekey_threshold).ceil() as u32;
        let store = parent.prefix(&id.to_hex());
        let key_state = KeyStateVector::new(&store, KEY_STATE_KEY, num_keys + params.num_rekeys)?;

        let session = Arc::new(Self {
            store,
            ctx: Arc::clone(ctx),
            params,
            id,
            base_key,
            keys,
            partner_source,
            rekey_threshold,
            key_state,
            negotiation: RwLock::new(negotiation),
        });
        session.save_with(negotiation)?;
        session.register_unused_keys();

        tracing::debug!(
            partner = %ctx.partner,
            session = %id,
            kind = %ctx.kind,
            num_keys,
            rekey_threshold,
            status = %negotiation,
            "session created"
        );

        Ok(session)
    }

    /// Load a persisted session.
    pub(crate) fn load(
        parent: &Store,
        ctx: &Arc<RelationshipContext<S>>,
        id: SessionId,
    ) -> Result<Arc<Self>, RatchetError> {
        let store = parent.prefix(&id.to_hex());
        let record: SessionRecord = store.load_record(SESSION_KEY, SESSION_VERSION)?;
        let corrupt = |reason: String| RatchetError::CorruptRecord {
            key: store.full_key(SESSION_KEY, SESSION_VERSION),
            reason,
        };

        let base_key = record.base_key();
        if SessionId::from_base_key(&base_key) != id {
            return Err(corrupt(format!("base key does not hash to session id {id}")));
        }
        if record.kind != ctx.kind || record.partner != ctx.partner {
            return Err(corrupt(format!(
                "stored as {} session with {}, loaded into {} relationship with {}",
                record.kind, record.partner, ctx.kind, ctx.partner
            )));
        }
        record.params.validate()?;

        let keys = SessionKeys::decode(&record.keys)?;
        let key_state = KeyStateVector::load(&store, KEY_STATE_KEY)?;

        let session = Arc::new(Self {
            ctx: Arc::clone(ctx),
            params: record.params,
            id,
            base_key,
            keys,
            partner_source: record.partner_source,
            rekey_threshold: record.rekey_threshold,
            key_state,
            negotiation: RwLock::new(record.negotiation),
            store,
        });
        session.register_unused_keys();

        Ok(session)
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Partner this session talks to.
    pub fn partner(&self) -> PartnerId {
        self.ctx.partner
    }

    /// Direction of the owning relationship.
    pub fn kind(&self) -> RelationshipType {
        self.ctx.kind
    }

    /// Fingerprint of the owning relationship.
    pub fn relationship_fingerprint(&self) -> RelationshipFingerprint {
        self.ctx.fingerprint
    }

    /// Session whose rekey created this one. Empty for a first session.
    pub fn partner_source(&self) -> SessionId {
        self.partner_source
    }

    /// Parameters the session was created with.
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Key material the session was built from.
    pub fn keys(&self) -> &SessionKeys<S> {
        &self.keys
    }

    /// Own classical private key.
    pub fn my_private(&self) -> &DhPrivate<S> {
        &self.keys.my_private
    }

    /// Partner's classical public key.
    pub fn partner_public(&self) -> &DhPublic<S> {
        &self.keys.partner_public
    }

    /// Own post-quantum private key.
    pub fn my_pq_private(&self) -> &PqPrivate<S> {
        &self.keys.my_pq_private
    }

    /// Partner's post-quantum public key.
    pub fn partner_pq_public(&self) -> &PqPublic<S> {
        &self.keys.partner_pq_public
    }

    /// Used keys after which a rekey is due.
    pub fn rekey_threshold(&self) -> u32 {
        self.rekey_threshold
    }

    /// Size of the key pool, reserved rekey keys included.
    pub fn num_keys(&self) -> u32 {
        self.key_state.num_keys()
    }

    /// Unused keys, reserved rekey keys included.
    pub fn num_available(&self) -> u32 {
        self.key_state.num_available()
    }

    /// Used keys.
    pub fn num_used(&self) -> u32 {
        self.key_state.num_used()
    }

    /// Key usage tracker.
    pub fn key_state(&self) -> &KeyStateVector {
        &self.key_state
    }

    pub(crate) fn base_key(&self) -> &BaseKey {
        &self.base_key
    }

    /// Next unused ordinary key.
    ///
    /// Fails with `NoKeysAvailable` once only the reserved rekey keys remain.
    pub fn pop_key(self: &Arc<Self>) -> Result<Cypher<S>, RatchetError> {
        let key_num = self.key_state.next_reserving(self.params.num_rekeys)?;
        Ok(Cypher::new(Arc::clone(self), key_num))
    }

    /// Next unused key, reserved rekey keys included.
    pub fn pop_rekey(self: &Arc<Self>) -> Result<Cypher<S>, RatchetError> {
        let key_num = self.key_state.next()?;
        Ok(Cypher::new(Arc::clone(self), key_num))
    }

    /// Key pool status.
    pub fn status(&self) -> Status {
        let num_available = self.key_state.num_available();
        let num_used = self.key_state.num_used();

        if num_available == 0 {
            Status::RekeyEmpty
        } else if num_available <= self.params.num_rekeys {
            Status::Empty
        } else if num_used >= self.rekey_threshold {
            Status::RekeyNeeded
        } else {
            Status::Active
        }
    }

    /// Current negotiation status.
    pub fn negotiation_status(&self) -> Negotiation {
        *lock::read(&self.negotiation)
    }

    /// True once the partner holds the session.
    pub fn is_confirmed(&self) -> bool {
        self.negotiation_status().is_confirmed()
    }

    /// Move to `to` if the transition table allows it.
    ///
    /// Persists the new status, except when reverting `Sending` to
    /// `Unconfirmed` or `NewSessionTriggered` to `Confirmed`, which already is
    /// what the disk holds.
    pub fn try_set_negotiation_status(&self, to: Negotiation) -> Result<(), RatchetError> {
        let mut status = lock::write(&self.negotiation);
        let from = *status;
        if !from.can_transition_to(to) {
            return Err(RatchetError::IllegalNegotiationTransition { from, to });
        }

        let reverting = matches!(
            (from, to),
            (Negotiation::Sending, Negotiation::Unconfirmed)
                | (Negotiation::NewSessionTriggered, Negotiation::Confirmed)
        );
        if !reverting {
            self.save_with(to)?;
        }
        *status = to;

        tracing::debug!(session = %self, %from, %to, "negotiation status changed");
        Ok(())
    }

    /// Like [`Session::try_set_negotiation_status`] for transitions the
    /// caller guarantees are legal; a violation is logged as an error.
    pub fn set_negotiation_status(&self, to: Negotiation) -> Result<(), RatchetError> {
        self.try_set_negotiation_status(to).inspect_err(|e| {
            tracing::error!(session = %self, error = %e, "failed to set negotiation status");
        })
    }

    /// Check whether this session should start a negotiation, and claim it.
    ///
    /// Returns true and moves to `NewSessionTriggered` when usage crossed the
    /// rekey threshold and no successor was triggered yet. Otherwise, an
    /// `Unconfirmed` session moves to `Sending` with probability
    /// `unconfirmed_retry_ratio`, covering a lost confirm. Neither change is
    /// persisted: after a crash the check simply fires again.
    pub fn trigger_negotiation(&self) -> bool {
        let mut status = lock::write(&self.negotiation);

        if self.key_state.num_used() >= self.rekey_threshold
            && *status < Negotiation::NewSessionTriggered
        {
            *status = Negotiation::NewSessionTriggered;
            return true;
        }

        if *status == Negotiation::Unconfirmed && decide_resend(self.params.unconfirmed_retry_ratio)
        {
            *status = Negotiation::Sending;
            return true;
        }

        false
    }

    /// Delete the session's key material and records.
    pub(crate) fn delete(self: &Arc<Self>) -> Result<(), RatchetError> {
        if self.ctx.kind == RelationshipType::Receive {
            for key_num in self.key_state.unused_keys() {
                self.ctx.cypher_handler.delete_key(&Cypher::new(Arc::clone(self), key_num));
            }
        }
        self.key_state.delete()?;
        self.store.delete_object(SESSION_KEY, SESSION_VERSION)?;

        tracing::debug!(session = %self, "session deleted");
        Ok(())
    }

    fn register_unused_keys(self: &Arc<Self>) {
        if self.ctx.kind != RelationshipType::Receive {
            return;
        }
        for key_num in self.key_state.unused_keys() {
            self.ctx.cypher_handler.add_key(Cypher::new(Arc::clone(self), key_num));
        }
    }

    fn save_with(&self, negotiation: Negotiation) -> Result<(), RatchetError> {
        let record = SessionRecord {
            params: self.params,
            kind: self.ctx.kind,
            partner: self.ctx.partner,
            base_key: *self.base_key.as_bytes(),
            keys: self.keys.encode(),
            partner_source: self.partner_source,
            relationship_fingerprint: self.ctx.fingerprint,
            negotiation: negotiation.persisted(),
            rekey_threshold: self.rekey_threshold,
        };
        self.store.set_record(SESSION_KEY, SESSION_VERSION, &record)?;
        Ok(())
    }
}

impl<S: Suite> fmt::Display for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Partner: {}, ID: {}}}", self.ctx.partner, self.id)
    }
}

impl<S: Suite> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("partner", &self.ctx.partner)
            .field("kind", &self.ctx.kind)
            .field("negotiation", &self.negotiation_status())
            .field("available", &self.key_state.num_available())
            .finish_non_exhaustive()
    }
}

fn decide_resend(ratio: f64) -> bool {
    rand::thread_rng().gen_range(0.0..1.0) < ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::MemoryKv,
        test_util::{RecordingHandler, Suite, context, memory_store, random_keys, small_params},
    };

    fn new_session(
        kind: RelationshipType,
        negotiation: Negotiation,
        params: SessionParams,
    ) -> (MemoryKv, Store, Arc<RelationshipContext<Suite>>, Arc<Session<Suite>>) {
        let (kv, store) = memory_store();
        let ctx = context(kind, Arc::new(NoopCypherHandler));
        let keys = random_keys();
        let base_key = keys.base_key().unwrap();
        let session = Session::create(&store, &ctx, keys, base_key, SessionId::EMPTY, negotiation, params)
            .unwrap();
        (kv, store, ctx, session)
    }

    fn send_session(negotiation: Negotiation) -> Arc<Session<Suite>> {
        new_session(RelationshipType::Send, negotiation, small_params()).3
    }

    #[test]
    fn create_derives_sizes_from_params() {
        let session = send_session(Negotiation::Confirmed);

        assert_eq!(session.num_keys(), 24);
        assert_eq!(session.rekey_threshold(), 10);
        assert_eq!(session.num_available(), 24);
        assert_eq!(session.status(), Status::Active);
        assert_eq!(session.id(), SessionId::from_base_key(session.base_key()));
    }

    #[test]
    fn pop_key_stops_at_reserved_keys() {
        let session = send_session(Negotiation::Confirmed);

        for expected in 0..20 {
            assert_eq!(session.pop_key().unwrap().key_num(), expected);
        }

        assert!(matches!(session.pop_key(), Err(RatchetError::NoKeysAvailable)));
        assert_eq!(session.status(), Status::Empty);
    }

    #[test]
    fn pop_rekey_drains_reserved_keys() {
        let session = send_session(Negotiation::Confirmed);

        for _ in 0..24 {
            session.pop_rekey().unwrap();
        }

        assert_eq!(session.status(), Status::RekeyEmpty);
        assert!(matches!(session.pop_rekey(), Err(RatchetError::NoKeysAvailable)));
    }

    #[test]
    fn popped_key_is_claimed() {
        let session = send_session(Negotiation::Confirmed);

        let first = session.pop_key().unwrap();
        let second = session.pop_key().unwrap();

        assert_ne!(first.key_num(), second.key_num());
        assert!(session.key_state().used(first.key_num()));
        assert_eq!(session.num_used(), 2);
    }

    #[test]
    fn status_follows_usage() {
        let session = send_session(Negotiation::Confirmed);

        for _ in 0..9 {
            session.pop_key().unwrap();
        }
        assert_eq!(session.status(), Status::Active);

        session.pop_key().unwrap();
        assert_eq!(session.status(), Status::RekeyNeeded);
    }

    #[test]
    fn trigger_claims_rekey_once_threshold_is_crossed() {
        let session = send_session(Negotiation::Confirmed);
        assert!(!session.trigger_negotiation());

        for _ in 0..10 {
            session.pop_key().unwrap();
        }

        assert!(session.trigger_negotiation());
        assert_eq!(session.negotiation_status(), Negotiation::NewSessionTriggered);
        assert!(!session.trigger_negotiation());
    }

    #[test]
    fn trigger_does_not_retrigger_after_successor_created() {
        let session = send_session(Negotiation::Confirmed);
        for _ in 0..10 {
            session.pop_key().unwrap();
        }
        assert!(session.trigger_negotiation());
        session.try_set_negotiation_status(Negotiation::NewSessionCreated).unwrap();

        assert!(!session.trigger_negotiation());
    }

    #[test]
    fn unconfirmed_resend_follows_ratio() {
        let never = send_session(Negotiation::Unconfirmed);
        assert!(!never.trigger_negotiation());
        assert_eq!(never.negotiation_status(), Negotiation::Unconfirmed);

        let params = SessionParams { unconfirmed_retry_ratio: 1.0, ..small_params() };
        let always = new_session(RelationshipType::Send, Negotiation::Unconfirmed, params).3;
        assert!(always.trigger_negotiation());
        assert_eq!(always.negotiation_status(), Negotiation::Sending);
        assert!(!always.trigger_negotiation());
    }

    #[test]
    fn illegal_transition_leaves_status_unchanged() {
        let session = send_session(Negotiation::Unconfirmed);

        let result = session.try_set_negotiation_status(Negotiation::Confirmed);

        assert!(matches!(
            result,
            Err(RatchetError::IllegalNegotiationTransition {
                from: Negotiation::Unconfirmed,
                to: Negotiation::Confirmed
            })
        ));
        assert_eq!(session.negotiation_status(), Negotiation::Unconfirmed);
    }

    #[test]
    fn every_transition_follows_the_table() {
        for from in Negotiation::ALL {
            for to in Negotiation::ALL {
                let (_kv, store, ctx, session) =
                    new_session(RelationshipType::Send, from, small_params());

                let result = session.try_set_negotiation_status(to);

                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{from} -> {to} rejected");
                    assert_eq!(session.negotiation_status(), to);
                } else {
                    assert!(
                        matches!(result, Err(RatchetError::IllegalNegotiationTransition { .. })),
                        "{from} -> {to} accepted"
                    );
                    assert_eq!(session.negotiation_status(), from);
                    assert_eq!(
                        Session::load(&store, &ctx, session.id()).unwrap().negotiation_status(),
                        from.persisted()
                    );
                }
            }
        }
    }

    #[test]
    fn status_survives_reload_with_transient_states_downgraded() {
        let (_kv, store, ctx, session) =
            new_session(RelationshipType::Send, Negotiation::Unconfirmed, small_params());
        let id = session.id();

        session.try_set_negotiation_status(Negotiation::Sending).unwrap();
        assert_eq!(
            Session::load(&store, &ctx, id).unwrap().negotiation_status(),
            Negotiation::Unconfirmed
        );

        session.try_set_negotiation_status(Negotiation::Sent).unwrap();
        assert_eq!(Session::load(&store, &ctx, id).unwrap().negotiation_status(), Negotiation::Sent);

        session.try_set_negotiation_status(Negotiation::Confirmed).unwrap();
        session.try_set_negotiation_status(Negotiation::NewSessionTriggered).unwrap();
        assert_eq!(
            Session::load(&store, &ctx, id).unwrap().negotiation_status(),
            Negotiation::Confirmed
        );
    }

    #[test]
    fn failed_save_keeps_old_status() {
        let kv = crate::storage::ChaoticKv::new(MemoryKv::new(), 0.0);
        let store = Store::new(Arc::new(kv.clone()));
        let ctx = context(RelationshipType::Send, Arc::new(NoopCypherHandler));
        let keys = random_keys();
        let base_key = keys.base_key().unwrap();
        let session = Session::create(
            &store,
            &ctx,
            keys,
            base_key,
            SessionId::EMPTY,
            Negotiation::Sending,
            small_params(),
        )
        .unwrap();

        kv.set_fail_writes(true);
        assert!(session.try_set_negotiation_status(Negotiation::Sent).is_err());
        assert_eq!(session.negotiation_status(), Negotiation::Sending);

        // reverting never touches storage
        session.try_set_negotiation_status(Negotiation::Unconfirmed).unwrap();
        assert_eq!(session.negotiation_status(), Negotiation::Unconfirmed);
    }

    #[test]
    fn load_restores_keys_and_usage() {
        let (_kv, store, ctx, session) =
            new_session(RelationshipType::Send, Negotiation::Confirmed, small_params());
        session.pop_key().unwrap();
        session.pop_key().unwrap();

        let loaded = Session::load(&store, &ctx, session.id()).unwrap();

        assert_eq!(loaded.id(), session.id());
        assert_eq!(loaded.num_used(), 2);
        assert_eq!(loaded.rekey_threshold(), session.rekey_threshold());
        assert_eq!(loaded.partner_public(), session.partner_public());
        assert_eq!(loaded.params(), session.params());
    }

    #[test]
    fn load_rejects_wrong_relationship() {
        let (_kv, store, _ctx, session) =
            new_session(RelationshipType::Send, Negotiation::Confirmed, small_params());
        let receive_ctx = context(RelationshipType::Receive, Arc::new(NoopCypherHandler));

        let result = Session::load(&store, &receive_ctx, session.id());

        assert!(matches!(result, Err(RatchetError::CorruptRecord { .. })));
    }

    #[test]
    fn load_rejects_foreign_id() {
        let (_kv, store, ctx, session) =
            new_session(RelationshipType::Send, Negotiation::Confirmed, small_params());
        let other = send_session(Negotiation::Confirmed);

        // session stored under a directory named after another id
        let record: SessionRecord = store
            .prefix(&session.id().to_hex())
            .load_record(SESSION_KEY, SESSION_VERSION)
            .unwrap();
        store.prefix(&other.id().to_hex()).set_record(SESSION_KEY, SESSION_VERSION, &record).unwrap();

        let result = Session::load(&store, &ctx, other.id());
        assert!(matches!(result, Err(RatchetError::CorruptRecord { .. })));
    }

    #[test]
    fn receive_session_registers_unused_keys() {
        let (_kv, store) = memory_store();
        let handler = Arc::new(RecordingHandler::default());
        let ctx = context(RelationshipType::Receive, handler.clone());
        let keys = random_keys();
        let base_key = keys.base_key().unwrap();

        let session = Session::create(
            &store,
            &ctx,
            keys,
            base_key,
            SessionId::EMPTY,
            Negotiation::Confirmed,
            small_params(),
        )
        .unwrap();
        assert_eq!(handler.len(), 24);

        session.pop_rekey().unwrap();
        let reloaded = Session::load(&store, &ctx, session.id()).unwrap();
        drop(reloaded);

        session.delete().unwrap();
        assert_eq!(handler.len(), 1);
    }

    #[test]
    fn send_session_registers_nothing() {
        let (_kv, store) = memory_store();
        let handler = Arc::new(RecordingHandler::default());
        let ctx = context(RelationshipType::Send, handler.clone());
        let keys = random_keys();
        let base_key = keys.base_key().unwrap();

        Session::create(&store, &ctx, keys, base_key, SessionId::EMPTY, Negotiation::Sending, small_params())
            .unwrap();

        assert_eq!(handler.len(), 0);
    }

    #[test]
    fn delete_removes_records() {
        let (kv, _store, _ctx, session) =
            new_session(RelationshipType::Send, Negotiation::Confirmed, small_params());
        assert!(!kv.is_empty());

        session.delete().unwrap();

        assert!(kv.is_empty());
    }

    #[test]
    fn invalid_params_are_rejected() {
        let (_kv, store) = memory_store();
        let ctx = context(RelationshipType::Send, Arc::new(NoopCypherHandler));
        let keys = random_keys();
        let base_key = keys.base_key().unwrap();
        let params = SessionParams { min_keys: 2, ..small_params() };

        let result =
            Session::create(&store, &ctx, keys, base_key, SessionId::EMPTY, Negotiation::Confirmed, params);

        assert!(matches!(result, Err(RatchetError::InvalidParams { .. })));
    }
}
