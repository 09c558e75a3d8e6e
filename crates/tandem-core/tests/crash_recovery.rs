//! Crash recovery tests for a redb-backed ratchet.
//!
//! Each test writes through one `RedbKv`, drops it, reopens the same file and
//! checks what a restarted client would see.

use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use tandem_core::{
    Cypher, CypherHandler, Negotiation, NoopCypherHandler, NoopServiceHandler, PartnerId, Ratchet,
    RedbKv, SessionKeys, SessionParams, Store,
};
use tandem_crypto::{DoubleX25519, KeyExchange, X25519};
use tempfile::tempdir;

fn params() -> SessionParams {
    SessionParams {
        min_keys: 20,
        max_keys: 40,
        num_rekeys: 4,
        rekey_threshold: 0.25,
        unconfirmed_retry_ratio: 0.0,
    }
}

fn keys() -> SessionKeys<DoubleX25519> {
    SessionKeys {
        my_private: X25519::generate(&mut OsRng),
        partner_public: X25519::public_key(&X25519::generate(&mut OsRng)),
        my_pq_private: X25519::generate(&mut OsRng),
        partner_pq_public: X25519::public_key(&X25519::generate(&mut OsRng)),
    }
}

fn open(path: &std::path::Path) -> Store {
    Store::new(Arc::new(RedbKv::open(path).unwrap()))
}

fn load(store: Store) -> Ratchet<DoubleX25519> {
    Ratchet::load(store, Arc::new(NoopServiceHandler), Arc::new(NoopCypherHandler)).unwrap()
}

const ME: PartnerId = PartnerId::new([1; 32]);
const BOB: PartnerId = PartnerId::new([2; 32]);

#[derive(Default)]
struct CountingHandler {
    keys: Mutex<usize>,
}

impl CypherHandler<DoubleX25519> for CountingHandler {
    fn add_key(&self, _cypher: Cypher<DoubleX25519>) {
        *self.keys.lock().unwrap() += 1;
    }

    fn delete_key(&self, _cypher: &Cypher<DoubleX25519>) {
        *self.keys.lock().unwrap() -= 1;
    }
}

#[test]
fn test_partners_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ratchet.redb");
    let connection;

    {
        let ratchet = Ratchet::<DoubleX25519>::new(
            open(&path),
            ME,
            X25519::generate(&mut OsRng),
            Arc::new(NoopServiceHandler),
            Arc::new(NoopCypherHandler),
        )
        .unwrap();
        let manager = ratchet.add_partner(BOB, keys(), params(), params()).unwrap();
        connection = manager.connection_fingerprint();
    }

    let ratchet = load(open(&path));
    assert_eq!(ratchet.my_id(), ME);
    assert_eq!(ratchet.all_partner_ids(), vec![BOB]);
    assert_eq!(ratchet.get_partner(BOB).unwrap().connection_fingerprint(), connection);
}

#[test]
fn test_used_keys_are_never_reissued_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ratchet.redb");
    let mut issued = Vec::new();

    {
        let ratchet = Ratchet::<DoubleX25519>::new(
            open(&path),
            ME,
            X25519::generate(&mut OsRng),
            Arc::new(NoopServiceHandler),
            Arc::new(NoopCypherHandler),
        )
        .unwrap();
        let manager = ratchet.add_partner(BOB, keys(), params(), params()).unwrap();
        for _ in 0..5 {
            issued.push(manager.pop_send_cypher().unwrap().key_num());
        }
    }

    let ratchet = load(open(&path));
    let manager = ratchet.get_partner(BOB).unwrap();
    let session = manager.send_relationship().get_newest().unwrap();
    assert_eq!(session.num_used(), 5);

    let next = manager.pop_send_cypher().unwrap().key_num();
    assert!(!issued.contains(&next));
}

#[test]
fn test_in_flight_negotiation_is_retried_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ratchet.redb");
    let (first_id, rekey_id);

    {
        let ratchet = Ratchet::<DoubleX25519>::new(
            open(&path),
            ME,
            X25519::generate(&mut OsRng),
            Arc::new(NoopServiceHandler),
            Arc::new(NoopCypherHandler),
        )
        .unwrap();
        let manager = ratchet.add_partner(BOB, keys(), params(), params()).unwrap();
        let first = manager.send_relationship().get_newest().unwrap();
        first_id = first.id();

        while first.num_used() < first.rekey_threshold() {
            manager.pop_send_cypher().unwrap();
        }
        let triggered = manager.trigger_negotiations();
        assert_eq!(triggered.len(), 1);
        assert_eq!(first.negotiation_status(), Negotiation::NewSessionTriggered);

        let rekey = manager.new_send_session(None, None, params(), &first).unwrap();
        assert_eq!(rekey.negotiation_status(), Negotiation::Sending);
        rekey_id = rekey.id();

        // crash before NewSessionCreated and before the trigger went out
    }

    let ratchet = load(open(&path));
    let manager = ratchet.get_partner(BOB).unwrap();
    let first = manager.get_send_session(first_id).unwrap();
    let rekey = manager.get_send_session(rekey_id).unwrap();

    assert_eq!(first.negotiation_status(), Negotiation::Confirmed);
    assert_eq!(rekey.negotiation_status(), Negotiation::Unconfirmed);
    assert_eq!(rekey.partner_source(), first_id);

    // the old session triggers again and the rekey can be resent
    assert!(first.trigger_negotiation());
    rekey.try_set_negotiation_status(Negotiation::Sending).unwrap();
}

#[test]
fn test_receive_keys_are_registered_on_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ratchet.redb");
    let available;

    {
        let ratchet = Ratchet::<DoubleX25519>::new(
            open(&path),
            ME,
            X25519::generate(&mut OsRng),
            Arc::new(NoopServiceHandler),
            Arc::new(NoopCypherHandler),
        )
        .unwrap();
        let manager = ratchet.add_partner(BOB, keys(), params(), params()).unwrap();
        let session = manager.receive_relationship().get_newest().unwrap();
        session.pop_rekey().unwrap();
        session.pop_rekey().unwrap();
        available = session.num_available() as usize;
    }

    let handler = Arc::new(CountingHandler::default());
    let ratchet =
        Ratchet::<DoubleX25519>::load(open(&path), Arc::new(NoopServiceHandler), handler.clone()).unwrap();
    assert_eq!(*handler.keys.lock().unwrap(), available);

    ratchet.delete_partner(BOB).unwrap();
    assert_eq!(*handler.keys.lock().unwrap(), 0);
}
