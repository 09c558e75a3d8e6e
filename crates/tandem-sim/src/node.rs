//! A simulated client: one ratchet plus its messaging glue

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use rand::rngs::OsRng;
use tandem_core::{
    Cypher, CypherHandler, E2E_TAG, PartnerId, Processor, Ratchet, Service, ServiceHandler,
    SessionId, SessionKeys, SessionParams, Store,
};
use tandem_crypto::{DoubleX25519, KeyExchange, KeyFingerprint, X25519};
use tandem_rekey::{
    E2eSender, EventReporter, GarbledMessages, MessageId, MessageType, ReceivedMessage, Rekey,
    RekeyParams, SendError, SendParams, SendReport, wait_for_key,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    error::SimError,
    network::{Envelope, Network},
};

/// Suite every simulated node runs
pub type SimSuite = DoubleX25519;

/// Capacity of the channels feeding the rekey listener
const REKEY_CHANNEL_CAPACITY: usize = 64;

/// How often a sender retries when no send key is available
const KEY_ATTEMPTS: u32 = 200;

/// Delay between send key retries
const KEY_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Receive keys by fingerprint.
#[derive(Default)]
pub struct KeyMap {
    keys: Mutex<HashMap<KeyFingerprint, Cypher<SimSuite>>>,
}

impl KeyMap {
    /// Number of keys waiting for a message.
    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no key is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, fingerprint: &KeyFingerprint) -> Option<Cypher<SimSuite>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).remove(fingerprint)
    }
}

impl CypherHandler<SimSuite> for KeyMap {
    fn add_key(&self, cypher: Cypher<SimSuite>) {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).insert(cypher.fingerprint(), cypher);
    }

    fn delete_key(&self, cypher: &Cypher<SimSuite>) {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).remove(&cypher.fingerprint());
    }
}

/// Service table of one node.
#[derive(Default)]
pub struct Services {
    table: RwLock<HashMap<(Vec<u8>, String), Arc<dyn Processor>>>,
}

impl Services {
    fn get(&self, service: &Service) -> Option<Arc<dyn Processor>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(service.identifier.clone(), service.tag.clone()))
            .cloned()
    }
}

impl ServiceHandler for Services {
    fn add_service(&self, service: Service, processor: Arc<dyn Processor>) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((service.identifier, service.tag), processor);
    }

    fn delete_service(&self, service: &Service, _processor: &Arc<dyn Processor>) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(service.identifier.clone(), service.tag.clone()));
    }
}

/// Collects delivered text messages.
#[derive(Default)]
pub struct TextInbox {
    received: Mutex<Vec<(PartnerId, Vec<u8>)>>,
}

impl TextInbox {
    /// Number of texts received.
    pub fn len(&self) -> usize {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing was received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every text received so far, in arrival order.
    pub fn messages(&self) -> Vec<(PartnerId, Vec<u8>)> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Processor for TextInbox {
    fn process(&self, sender: PartnerId, payload: &[u8]) {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).push((sender, payload.to_vec()));
    }
}

/// Messages that arrived before their key did.
struct Garbled {
    held: Mutex<Vec<Envelope>>,
    inbox: mpsc::UnboundedSender<Envelope>,
}

impl Garbled {
    fn hold(&self, envelope: Envelope) {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).push(envelope);
    }

    fn len(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl GarbledMessages for Garbled {
    fn check_garbled_messages(&self) {
        let held = std::mem::take(&mut *self.held.lock().unwrap_or_else(PoisonError::into_inner));
        if !held.is_empty() {
            tracing::debug!(count = held.len(), "retrying held messages");
        }
        for envelope in held {
            // the receive loop is gone on shutdown; nothing left to retry for
            let _ = self.inbox.send(envelope);
        }
    }
}

struct LogReporter;

impl EventReporter for LogReporter {
    fn report(&self, priority: u8, category: &str, event_type: &str, details: &str) {
        tracing::warn!(priority, category, event_type, details, "event");
    }
}

/// Encrypts with the ratchet and hands envelopes to the network.
struct NodeSender {
    ratchet: Arc<Ratchet<SimSuite>>,
    network: Arc<Network>,
    shutdown: watch::Receiver<bool>,
    sessions_used: Mutex<HashSet<SessionId>>,
}

#[async_trait]
impl E2eSender for NodeSender {
    async fn send_e2e(
        &self,
        message_type: MessageType,
        recipient: PartnerId,
        payload: Vec<u8>,
        params: SendParams,
    ) -> Result<SendReport, SendError> {
        let manager =
            self.ratchet.get_partner(recipient).map_err(|e| SendError::new(e.to_string()))?;

        let cypher = if params.rekey {
            manager.pop_rekey_cypher().map_err(|e| SendError::new(e.to_string()))?
        } else {
            let mut shutdown = self.shutdown.clone();
            let cypher = wait_for_key(
                || manager.pop_send_cypher(),
                KEY_ATTEMPTS,
                KEY_RETRY_DELAY,
                &mut shutdown,
            )
            .await
            .map_err(|e| SendError::new(e.to_string()))?;
            self.sessions_used
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(cypher.session().id());
            cypher
        };

        let sealed = cypher.encrypt(&payload);
        let envelope = Envelope {
            message_type,
            fingerprint: sealed.fingerprint,
            ciphertext: sealed.ciphertext,
            mac: sealed.mac,
        };
        let round =
            self.network.deliver(recipient, envelope).map_err(|e| SendError::new(e.to_string()))?;

        tracing::trace!(
            %message_type,
            session = %cypher.session().id(),
            key = cypher.key_num(),
            tag = %params.debug_tag,
            "sent"
        );
        Ok(SendReport { rounds: vec![round], message_id: MessageId(sealed.key_residue.0) })
    }
}

/// Decrypts inbound envelopes and dispatches them.
struct Receiver {
    ratchet: Arc<Ratchet<SimSuite>>,
    keys: Arc<KeyMap>,
    services: Arc<Services>,
    garbled: Arc<Garbled>,
    params: RekeyParams,
    triggers: mpsc::Sender<ReceivedMessage>,
    confirms: mpsc::Sender<ReceivedMessage>,
}

impl Receiver {
    async fn handle(&self, envelope: Envelope) {
        let Some(cypher) = self.keys.take(&envelope.fingerprint) else {
            tracing::trace!(message_type = %envelope.message_type, "no key yet, holding message");
            self.garbled.hold(envelope);
            return;
        };

        let plaintext = match cypher.decrypt(&envelope.ciphertext, &envelope.mac) {
            Ok((plaintext, _)) => plaintext,
            Err(e) => {
                // a forged envelope must not burn the key of the genuine one
                tracing::warn!(error = %e, "dropping undecryptable message");
                self.keys.add_key(cypher);
                return;
            },
        };
        if let Err(e) = cypher.use_key() {
            tracing::error!(error = %e, "failed to mark key used");
            return;
        }

        let message = ReceivedMessage {
            message_type: envelope.message_type,
            sender: cypher.session().partner(),
            payload: plaintext,
            encrypted: true,
        };

        let queue = if message.message_type == self.params.trigger {
            &self.triggers
        } else if message.message_type == self.params.confirm {
            &self.confirms
        } else {
            self.deliver_to_service(&message);
            return;
        };
        if queue.send(message).await.is_err() {
            tracing::debug!("rekey listener stopped");
        }
    }

    fn deliver_to_service(&self, message: &ReceivedMessage) {
        let Ok(manager) = self.ratchet.get_partner(message.sender) else {
            tracing::warn!(sender = %message.sender, "message from removed partner");
            return;
        };
        match self.services.get(&manager.make_service(E2E_TAG)) {
            Some(processor) => processor.process(message.sender, &message.payload),
            None => tracing::warn!(sender = %message.sender, "no service for message"),
        }
    }
}

/// A simulated client attached to a [`Network`].
pub struct Node {
    id: PartnerId,
    ratchet: Arc<Ratchet<SimSuite>>,
    rekey: Rekey<SimSuite>,
    sender: Arc<NodeSender>,
    keys: Arc<KeyMap>,
    services: Arc<Services>,
    garbled: Arc<Garbled>,
    texts: Arc<TextInbox>,
    network: Arc<Network>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    shutdown: watch::Receiver<bool>,
}

impl Node {
    /// Create a node with a fresh ratchet in `store` and attach it.
    pub fn new(
        id: PartnerId,
        store: Store,
        network: Arc<Network>,
        params: RekeyParams,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SimError> {
        let keys = Arc::new(KeyMap::default());
        let services = Arc::new(Services::default());
        let ratchet = Arc::new(Ratchet::new(
            store,
            id,
            X25519::generate(&mut OsRng),
            services.clone(),
            keys.clone(),
        )?);
        Self::assemble(id, ratchet, keys, services, network, params, shutdown)
    }

    /// Reload a node's ratchet from `store` and attach it.
    pub fn load(
        store: Store,
        network: Arc<Network>,
        params: RekeyParams,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SimError> {
        let keys = Arc::new(KeyMap::default());
        let services = Arc::new(Services::default());
        let ratchet = Arc::new(Ratchet::load(store, services.clone(), keys.clone())?);
        Self::assemble(ratchet.my_id(), ratchet, keys, services, network, params, shutdown)
    }

    fn assemble(
        id: PartnerId,
        ratchet: Arc<Ratchet<SimSuite>>,
        keys: Arc<KeyMap>,
        services: Arc<Services>,
        network: Arc<Network>,
        params: RekeyParams,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SimError> {
        let texts = Arc::new(TextInbox::default());
        ratchet.add_service(E2E_TAG, texts.clone())?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        network.attach(id, inbox_tx.clone());
        let garbled = Arc::new(Garbled { held: Mutex::new(Vec::new()), inbox: inbox_tx });

        let sender = Arc::new(NodeSender {
            ratchet: Arc::clone(&ratchet),
            network: Arc::clone(&network),
            shutdown: shutdown.clone(),
            sessions_used: Mutex::new(HashSet::new()),
        });
        let rekey = Rekey::new(
            Arc::clone(&ratchet),
            sender.clone(),
            network.clone(),
            garbled.clone(),
            Arc::new(LogReporter),
            params,
        );

        Ok(Self {
            id,
            ratchet,
            rekey,
            sender,
            keys,
            services,
            garbled,
            texts,
            network,
            inbox: Mutex::new(Some(inbox_rx)),
            shutdown,
        })
    }

    /// Make `self` and `other` partners with freshly generated paired keys.
    pub fn connect(&self, other: &Node, params: SessionParams) -> Result<(), SimError> {
        let mine = X25519::generate(&mut OsRng);
        let theirs = X25519::generate(&mut OsRng);
        let mine_pq = X25519::generate(&mut OsRng);
        let theirs_pq = X25519::generate(&mut OsRng);

        let my_keys = SessionKeys {
            my_private: mine.clone(),
            partner_public: X25519::public_key(&theirs),
            my_pq_private: mine_pq.clone(),
            partner_pq_public: X25519::public_key(&theirs_pq),
        };
        let their_keys = SessionKeys {
            my_private: theirs,
            partner_public: X25519::public_key(&mine),
            my_pq_private: theirs_pq,
            partner_pq_public: X25519::public_key(&mine_pq),
        };

        self.ratchet.add_partner(other.id, my_keys, params, params)?;
        other.ratchet.add_partner(self.id, their_keys, params, params)?;

        tracing::info!(a = %self.id, b = %other.id, "nodes connected");
        Ok(())
    }

    /// Start the receive loop and the rekey listener.
    ///
    /// Both stop when the shutdown watch turns true. Calling this twice
    /// starts nothing the second time.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let Some(mut inbox) = self.inbox.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Vec::new();
        };

        let (triggers_tx, triggers_rx) = mpsc::channel(REKEY_CHANNEL_CAPACITY);
        let (confirms_tx, confirms_rx) = mpsc::channel(REKEY_CHANNEL_CAPACITY);
        let listener = self.rekey.spawn_listener(triggers_rx, confirms_rx, self.shutdown.clone());

        let receiver = Receiver {
            ratchet: Arc::clone(&self.ratchet),
            keys: Arc::clone(&self.keys),
            services: Arc::clone(&self.services),
            garbled: Arc::clone(&self.garbled),
            params: *self.rekey.params(),
            triggers: triggers_tx,
            confirms: confirms_tx,
        };
        let mut shutdown = self.shutdown.clone();
        let id = self.id;
        let receive_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => break,
                    envelope = inbox.recv() => match envelope {
                        Some(envelope) => receiver.handle(envelope).await,
                        None => break,
                    },
                }
            }
            tracing::debug!(node = %id, "receive loop stopped");
        });

        vec![listener, receive_loop]
    }

    /// Send a text to `to`, then start any rekey that became due.
    pub async fn send_text(&self, to: PartnerId, text: &[u8]) -> Result<(), SimError> {
        let params = SendParams { rekey: false, debug_tag: "text".to_string() };
        self.sender.send_e2e(MessageType::TEXT, to, text.to_vec(), params).await?;

        let manager = self.ratchet.get_partner(to)?;
        // negotiations run detached
        drop(self.rekey.check_key_exchanges(&manager));
        Ok(())
    }

    /// Node id.
    pub fn id(&self) -> PartnerId {
        self.id
    }

    /// The node's ratchet.
    pub fn ratchet(&self) -> &Arc<Ratchet<SimSuite>> {
        &self.ratchet
    }

    /// Texts delivered to this node.
    pub fn texts(&self) -> &TextInbox {
        &self.texts
    }

    /// Receive keys currently registered.
    pub fn keys(&self) -> &KeyMap {
        &self.keys
    }

    /// Messages held because their key is not known yet.
    pub fn held(&self) -> usize {
        self.garbled.len()
    }

    /// Distinct send sessions ordinary messages went out under.
    pub fn send_sessions_used(&self) -> usize {
        self.sender.sessions_used.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.network.detach(self.id);
    }
}
