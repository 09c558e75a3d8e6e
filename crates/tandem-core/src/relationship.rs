//! All sessions for one direction with one partner
//!
//! Sessions are kept newest first. The list lives behind an `Arc` and is only
//! ever replaced wholesale under the write lock, so a reader clones the `Arc`
//! under the read lock and then works on a consistent snapshot without
//! holding any lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use tandem_crypto::Suite;

use crate::{
    error::RatchetError,
    ids::{PartnerId, RelationshipFingerprint, RelationshipType, SessionId},
    lock,
    params::SessionParams,
    session::{Cypher, CypherHandler, Negotiation, Session, SessionKeys, Status},
    storage::Store,
};

/// Confirmed sessions kept per relationship; older confirmed sessions are
/// pruned.
pub const MAX_CONFIRMED: usize = 3;

/// Record format version for relationship records
const RELATIONSHIP_VERSION: u64 = 0;

/// Storage key of the session id list
const RELATIONSHIP_KEY: &str = "relationship";

/// Storage key of the relationship fingerprint
const FINGERPRINT_KEY: &str = "relationshipFingerprint";

/// What every session of a relationship shares.
pub(crate) struct RelationshipContext<S: Suite> {
    pub(crate) kind: RelationshipType,
    pub(crate) partner: PartnerId,
    pub(crate) fingerprint: RelationshipFingerprint,
    pub(crate) cypher_handler: Arc<dyn CypherHandler<S>>,
}

struct SessionBuffer<S: Suite> {
    /// Newest first
    sessions: Arc<Vec<Arc<Session<S>>>>,
    by_id: HashMap<SessionId, Arc<Session<S>>>,
}

/// Ordered session list for one direction.
pub struct Relationship<S: Suite> {
    store: Store,
    ctx: Arc<RelationshipContext<S>>,
    buffer: RwLock<SessionBuffer<S>>,
    /// Makes "select a session, then pop its key" atomic across senders
    send_lock: Mutex<()>,
}

impl<S: Suite> Relationship<S> {
    /// Create a relationship whose first session is built from `keys` and
    /// starts out confirmed.
    pub(crate) fn new(
        store: Store,
        ctx: RelationshipContext<S>,
        keys: SessionKeys<S>,
        params: SessionParams,
    ) -> Result<Self, RatchetError> {
        store.set_record(FINGERPRINT_KEY, RELATIONSHIP_VERSION, &ctx.fingerprint)?;

        let relationship = Self {
            store,
            ctx: Arc::new(ctx),
            buffer: RwLock::new(SessionBuffer { sessions: Arc::new(Vec::new()), by_id: HashMap::new() }),
            send_lock: Mutex::new(()),
        };
        relationship.add_session(keys, SessionId::EMPTY, Negotiation::Confirmed, params)?;

        Ok(relationship)
    }

    /// Load a persisted relationship and all its sessions.
    pub(crate) fn load(
        store: Store,
        kind: RelationshipType,
        partner: PartnerId,
        cypher_handler: Arc<dyn CypherHandler<S>>,
    ) -> Result<Self, RatchetError> {
        let fingerprint = store.load_record(FINGERPRINT_KEY, RELATIONSHIP_VERSION)?;
        let ids: Vec<SessionId> = store.load_record(RELATIONSHIP_KEY, RELATIONSHIP_VERSION)?;
        let ctx = Arc::new(RelationshipContext { kind, partner, fingerprint, cypher_handler });

        let sessions = ids
            .iter()
            .map(|&id| Session::load(&store, &ctx, id))
            .collect::<Result<Vec<_>, _>>()?;
        let by_id = sessions.iter().map(|s| (s.id(), Arc::clone(s))).collect();

        tracing::debug!(%partner, %kind, sessions = sessions.len(), "relationship loaded");

        Ok(Self {
            store,
            ctx,
            buffer: RwLock::new(SessionBuffer { sessions: Arc::new(sessions), by_id }),
            send_lock: Mutex::new(()),
        })
    }

    /// Direction of this relationship.
    pub fn kind(&self) -> RelationshipType {
        self.ctx.kind
    }

    /// Partner of this relationship.
    pub fn partner(&self) -> PartnerId {
        self.ctx.partner
    }

    /// Fingerprint shared by all sessions.
    pub fn fingerprint(&self) -> RelationshipFingerprint {
        self.ctx.fingerprint
    }

    /// Add a session built from `keys` as the newest one.
    ///
    /// If a session with the same id already exists it is returned instead,
    /// with `true` as second value.
    pub fn add_session(
        &self,
        keys: SessionKeys<S>,
        partner_source: SessionId,
        negotiation: Negotiation,
        params: SessionParams,
    ) -> Result<(Arc<Session<S>>, bool), RatchetError> {
        let base_key = keys.base_key()?;
        let id = SessionId::from_base_key(&base_key);

        let mut buffer = lock::write(&self.buffer);
        if let Some(existing) = buffer.by_id.get(&id) {
            return Ok((Arc::clone(existing), true));
        }

        let session = Session::create(
            &self.store,
            &self.ctx,
            keys,
            base_key,
            partner_source,
            negotiation,
            params,
        )?;

        let mut sessions = Vec::with_capacity(buffer.sessions.len() + 1);
        sessions.push(Arc::clone(&session));
        sessions.extend(buffer.sessions.iter().cloned());
        if let Err(e) = self.save_ids(&sessions) {
            if let Err(cleanup) = session.delete() {
                tracing::error!(session = %session, error = %cleanup, "failed to remove unlisted session");
            }
            return Err(e);
        }

        buffer.sessions = Arc::new(sessions);
        buffer.by_id.insert(id, Arc::clone(&session));

        Ok((session, false))
    }

    /// Snapshot of the sessions, newest first.
    pub fn sessions(&self) -> Arc<Vec<Arc<Session<S>>>> {
        Arc::clone(&lock::read(&self.buffer).sessions)
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        lock::read(&self.buffer).sessions.len()
    }

    /// True if the relationship holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest session.
    pub fn get_newest(&self) -> Option<Arc<Session<S>>> {
        lock::read(&self.buffer).sessions.first().cloned()
    }

    /// Session with the given id.
    pub fn get_by_id(&self, id: SessionId) -> Option<Arc<Session<S>>> {
        lock::read(&self.buffer).by_id.get(&id).cloned()
    }

    /// Pop a key for an ordinary message.
    pub fn pop_send_cypher(&self) -> Result<Cypher<S>, RatchetError> {
        let _send = lock::lock(&self.send_lock);
        let session = self.get_session_for_sending().ok_or(RatchetError::NoKeysAvailable)?;
        session.pop_key()
    }

    /// Pop a key for a rekey message, reserved keys included.
    pub fn pop_rekey_cypher(&self) -> Result<Cypher<S>, RatchetError> {
        let _send = lock::lock(&self.send_lock);
        let session = self.get_newest_rekeyable_session().ok_or(RatchetError::NoKeysAvailable)?;
        session.pop_rekey()
    }

    /// Session to send the next ordinary message with.
    ///
    /// Priority: confirmed and active, confirmed needing a rekey, unconfirmed
    /// and active, unconfirmed needing a rekey. Newest wins within each class.
    pub fn get_session_for_sending(&self) -> Option<Arc<Session<S>>> {
        let sessions = self.sessions();

        let mut confirmed_rekey = None;
        let mut unconfirmed_active = None;
        let mut unconfirmed_rekey = None;

        for session in sessions.iter() {
            match (session.is_confirmed(), session.status()) {
                (true, Status::Active) => return Some(Arc::clone(session)),
                (true, Status::RekeyNeeded) if confirmed_rekey.is_none() => {
                    confirmed_rekey = Some(session);
                },
                (false, Status::Active) if unconfirmed_active.is_none() => {
                    unconfirmed_active = Some(session);
                },
                (false, Status::RekeyNeeded) if unconfirmed_rekey.is_none() => {
                    unconfirmed_rekey = Some(session);
                },
                _ => {},
            }
        }

        confirmed_rekey.or(unconfirmed_active).or(unconfirmed_rekey).cloned()
    }

    /// Session to send a rekey message with.
    ///
    /// The newest confirmed session with any key left, else the newest
    /// unconfirmed one.
    pub fn get_newest_rekeyable_session(&self) -> Option<Arc<Session<S>>> {
        let sessions = self.sessions();
        let mut unconfirmed = None;

        for session in sessions.iter().filter(|s| s.status() != Status::RekeyEmpty) {
            if session.is_confirmed() {
                return Some(Arc::clone(session));
            }
            if unconfirmed.is_none() {
                unconfirmed = Some(session);
            }
        }

        unconfirmed.cloned()
    }

    /// Sessions that claimed a negotiation on this check.
    pub fn trigger_negotiation(&self) -> Vec<Arc<Session<S>>> {
        self.sessions().iter().filter(|s| s.trigger_negotiation()).cloned().collect()
    }

    /// Mark a session confirmed, then prune old confirmed sessions.
    pub fn confirm(&self, id: SessionId) -> Result<(), RatchetError> {
        let mut buffer = lock::write(&self.buffer);
        let session =
            buffer.by_id.get(&id).cloned().ok_or(RatchetError::UnknownSession { session: id })?;

        session.try_set_negotiation_status(Negotiation::Confirmed)?;
        self.clean_locked(&mut buffer)
    }

    /// Delete confirmed sessions beyond the newest [`MAX_CONFIRMED`].
    ///
    /// Unconfirmed sessions are never pruned here.
    pub fn clean(&self) -> Result<(), RatchetError> {
        let mut buffer = lock::write(&self.buffer);
        self.clean_locked(&mut buffer)
    }

    /// Delete every session and both relationship records.
    pub fn delete(&self) -> Result<(), RatchetError> {
        let mut buffer = lock::write(&self.buffer);
        for session in buffer.sessions.iter() {
            session.delete()?;
        }
        self.store.delete_object(RELATIONSHIP_KEY, RELATIONSHIP_VERSION)?;
        self.store.delete_object(FINGERPRINT_KEY, RELATIONSHIP_VERSION)?;

        buffer.sessions = Arc::new(Vec::new());
        buffer.by_id.clear();
        Ok(())
    }

    fn clean_locked(&self, buffer: &mut SessionBuffer<S>) -> Result<(), RatchetError> {
        let mut confirmed = 0;
        let mut kept = Vec::with_capacity(buffer.sessions.len());
        let mut retired = Vec::new();

        for session in buffer.sessions.iter() {
            if session.is_confirmed() {
                confirmed += 1;
                if confirmed > MAX_CONFIRMED {
                    retired.push(Arc::clone(session));
                    continue;
                }
            }
            kept.push(Arc::clone(session));
        }

        if retired.is_empty() {
            return Ok(());
        }

        self.save_ids(&kept)?;
        for session in &retired {
            buffer.by_id.remove(&session.id());
        }
        buffer.sessions = Arc::new(kept);

        for session in &retired {
            session.delete()?;
        }

        tracing::info!(
            partner = %self.ctx.partner,
            kind = %self.ctx.kind,
            retired = retired.len(),
            "pruned confirmed sessions"
        );
        Ok(())
    }

    fn save_ids(&self, sessions: &[Arc<Session<S>>]) -> Result<(), RatchetError> {
        let ids: Vec<SessionId> = sessions.iter().map(|s| s.id()).collect();
        self.store.set_record(RELATIONSHIP_KEY, RELATIONSHIP_VERSION, &ids)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::NoopCypherHandler,
        storage::MemoryKv,
        test_util::{
            FailingKv, RecordingHandler, Suite, memory_store, partner, random_keys, small_params,
        },
    };

    fn ctx(kind: RelationshipType, handler: Arc<dyn CypherHandler<Suite>>) -> RelationshipContext<Suite> {
        RelationshipContext {
            kind,
            partner: partner(3),
            fingerprint: RelationshipFingerprint::new([5; 32]),
            cypher_handler: handler,
        }
    }

    fn send_relationship() -> (MemoryKv, Store, Relationship<Suite>) {
        let (kv, store) = memory_store();
        let relationship = Relationship::new(
            store.clone(),
            ctx(RelationshipType::Send, Arc::new(NoopCypherHandler)),
            random_keys(),
            small_params(),
        )
        .unwrap();
        (kv, store, relationship)
    }

    fn add(relationship: &Relationship<Suite>, negotiation: Negotiation) -> Arc<Session<Suite>> {
        let (session, duplicate) = relationship
            .add_session(random_keys(), SessionId::EMPTY, negotiation, small_params())
            .unwrap();
        assert!(!duplicate);
        session
    }

    fn drain(session: &Arc<Session<Suite>>, count: u32) {
        for _ in 0..count {
            session.pop_rekey().unwrap();
        }
    }

    #[test]
    fn first_session_is_confirmed() {
        let (_kv, _store, relationship) = send_relationship();

        let first = relationship.get_newest().unwrap();

        assert_eq!(relationship.len(), 1);
        assert_eq!(first.negotiation_status(), Negotiation::Confirmed);
        assert!(first.partner_source().is_empty());
    }

    #[test]
    fn add_session_is_newest_first() {
        let (_kv, _store, relationship) = send_relationship();
        let second = add(&relationship, Negotiation::Sending);

        assert_eq!(relationship.get_newest().unwrap().id(), second.id());
        assert_eq!(relationship.sessions()[0].id(), second.id());
        assert!(relationship.get_by_id(second.id()).is_some());
    }

    #[test]
    fn duplicate_keys_return_existing_session() {
        let (_kv, _store, relationship) = send_relationship();
        let keys = random_keys();

        let (first, dup_first) = relationship
            .add_session(keys.clone(), SessionId::EMPTY, Negotiation::Confirmed, small_params())
            .unwrap();
        let (second, dup_second) = relationship
            .add_session(keys, SessionId::EMPTY, Negotiation::Confirmed, small_params())
            .unwrap();

        assert!(!dup_first);
        assert!(dup_second);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(relationship.len(), 2);
    }

    #[test]
    fn sending_prefers_confirmed_active() {
        let (_kv, _store, relationship) = send_relationship();
        let first = relationship.get_newest().unwrap();
        add(&relationship, Negotiation::Unconfirmed);

        let chosen = relationship.get_session_for_sending().unwrap();

        assert_eq!(chosen.id(), first.id());
    }

    #[test]
    fn sending_priority_order() {
        let (_kv, _store, relationship) = send_relationship();
        let confirmed = relationship.get_newest().unwrap();
        let unconfirmed = add(&relationship, Negotiation::Unconfirmed);

        // confirmed session needs a rekey, unconfirmed one is active
        drain(&confirmed, 10);
        assert_eq!(confirmed.status(), Status::RekeyNeeded);
        assert_eq!(relationship.get_session_for_sending().unwrap().id(), confirmed.id());

        // confirmed session is down to reserved keys
        drain(&confirmed, 10);
        assert_eq!(confirmed.status(), Status::Empty);
        assert_eq!(relationship.get_session_for_sending().unwrap().id(), unconfirmed.id());

        drain(&unconfirmed, 10);
        assert_eq!(relationship.get_session_for_sending().unwrap().id(), unconfirmed.id());

        drain(&unconfirmed, 10);
        assert!(relationship.get_session_for_sending().is_none());
        assert!(matches!(relationship.pop_send_cypher(), Err(RatchetError::NoKeysAvailable)));
    }

    #[test]
    fn rekey_cypher_uses_reserved_keys() {
        let (_kv, _store, relationship) = send_relationship();
        let first = relationship.get_newest().unwrap();
        drain(&first, 20);

        assert!(relationship.pop_send_cypher().is_err());
        let cypher = relationship.pop_rekey_cypher().unwrap();
        assert_eq!(cypher.session().id(), first.id());

        drain(&first, 3);
        assert!(matches!(relationship.pop_rekey_cypher(), Err(RatchetError::NoKeysAvailable)));
    }

    #[test]
    fn rekeyable_prefers_newest_confirmed() {
        let (_kv, _store, relationship) = send_relationship();
        let first = relationship.get_newest().unwrap();
        let unconfirmed = add(&relationship, Negotiation::Unconfirmed);

        assert_eq!(relationship.get_newest_rekeyable_session().unwrap().id(), first.id());

        drain(&first, 24);
        assert_eq!(relationship.get_newest_rekeyable_session().unwrap().id(), unconfirmed.id());
    }

    #[test]
    fn confirm_unknown_session_fails() {
        let (_kv, _store, relationship) = send_relationship();

        let result = relationship.confirm(SessionId::new([1; 32]));

        assert!(matches!(result, Err(RatchetError::UnknownSession { .. })));
    }

    #[test]
    fn confirm_prunes_old_confirmed_sessions() {
        let (kv, _store, relationship) = send_relationship();
        let first = relationship.get_newest().unwrap();
        let mut sent = Vec::new();
        for _ in 0..MAX_CONFIRMED {
            let session = add(&relationship, Negotiation::Sending);
            session.try_set_negotiation_status(Negotiation::Sent).unwrap();
            sent.push(session);
        }
        let keys_before = kv.len();

        for session in &sent {
            relationship.confirm(session.id()).unwrap();
        }

        assert_eq!(relationship.len(), MAX_CONFIRMED);
        assert!(relationship.get_by_id(first.id()).is_none());
        assert!(kv.len() < keys_before);
        assert!(relationship.sessions().iter().all(|s| s.is_confirmed()));
    }

    #[test]
    fn clean_never_prunes_unconfirmed() {
        let (_kv, _store, relationship) = send_relationship();
        for _ in 0..MAX_CONFIRMED + 2 {
            add(&relationship, Negotiation::Unconfirmed);
        }
        for _ in 0..MAX_CONFIRMED {
            add(&relationship, Negotiation::Confirmed);
        }

        relationship.clean().unwrap();

        let sessions = relationship.sessions();
        assert_eq!(sessions.iter().filter(|s| s.is_confirmed()).count(), MAX_CONFIRMED);
        assert_eq!(sessions.iter().filter(|s| !s.is_confirmed()).count(), MAX_CONFIRMED + 2);
    }

    #[test]
    fn trigger_returns_claimed_sessions() {
        let (_kv, _store, relationship) = send_relationship();
        let first = relationship.get_newest().unwrap();
        add(&relationship, Negotiation::Sent);
        drain(&first, 10);

        let triggered = relationship.trigger_negotiation();

        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].id(), first.id());
        assert!(relationship.trigger_negotiation().is_empty());
    }

    #[test]
    fn load_restores_order_and_fingerprint() {
        let (_kv, store, relationship) = send_relationship();
        let second = add(&relationship, Negotiation::Unconfirmed);
        let third = add(&relationship, Negotiation::Sent);

        let loaded =
            Relationship::<Suite>::load(store, RelationshipType::Send, partner(3), Arc::new(NoopCypherHandler))
                .unwrap();

        let ids: Vec<_> = loaded.sessions().iter().map(|s| s.id()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], third.id());
        assert_eq!(ids[1], second.id());
        assert_eq!(loaded.fingerprint(), relationship.fingerprint());
        assert_eq!(loaded.get_by_id(third.id()).unwrap().negotiation_status(), Negotiation::Sent);
    }

    #[test]
    fn unlisted_session_is_removed() {
        let kv = FailingKv::default();
        let handler = Arc::new(RecordingHandler::default());
        let relationship = Relationship::new(
            kv.store(),
            ctx(RelationshipType::Receive, handler.clone()),
            random_keys(),
            small_params(),
        )
        .unwrap();
        let stored = kv.len();
        kv.fail_writes_to("relationship_v");

        let result =
            relationship.add_session(random_keys(), SessionId::EMPTY, Negotiation::Confirmed, small_params());

        assert!(matches!(result, Err(RatchetError::Storage(_))));
        assert_eq!(relationship.len(), 1);
        assert_eq!(kv.len(), stored);
        assert_eq!(handler.len(), 24);
    }

    #[test]
    fn delete_clears_storage_and_handler() {
        let (kv, store) = memory_store();
        let handler = Arc::new(RecordingHandler::default());
        let relationship = Relationship::new(
            store,
            ctx(RelationshipType::Receive, handler.clone()),
            random_keys(),
            small_params(),
        )
        .unwrap();
        add(&relationship, Negotiation::Confirmed);
        assert_eq!(handler.len(), 48);

        relationship.delete().unwrap();

        assert!(kv.is_empty());
        assert!(relationship.is_empty());
        assert_eq!(handler.len(), 0);
    }
}
