//! In-memory message network
//!
//! Every send is its own round. A round is either delivered to the
//! recipient's inbox or lost, and the network itself answers round tracking
//! queries.

use std::{
    collections::HashMap,
    sync::{
        Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use tandem_core::PartnerId;
use tandem_crypto::{KeyFingerprint, MAC_SIZE};
use tandem_rekey::{MessageType, RoundId, RoundResults, RoundTracker};
use tokio::sync::mpsc;

use crate::error::SimError;

/// One encrypted message on the wire.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Dispatcher type, visible to the network
    pub message_type: MessageType,
    /// Identifies the key to the recipient
    pub fingerprint: KeyFingerprint,
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
    /// Detached MAC
    pub mac: [u8; MAC_SIZE],
}

/// Loopback network connecting simulated nodes.
pub struct Network {
    inboxes: RwLock<HashMap<PartnerId, mpsc::UnboundedSender<Envelope>>>,
    next_round: AtomicU64,
    loss: f64,
    lost: Mutex<HashMap<RoundId, MessageType>>,
}

impl Network {
    /// Network dropping each round with probability `loss`.
    pub fn new(loss: f64) -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
            next_round: AtomicU64::new(1),
            loss: loss.clamp(0.0, 1.0),
            lost: Mutex::new(HashMap::new()),
        }
    }

    /// Route messages for `node` into `inbox`.
    pub fn attach(&self, node: PartnerId, inbox: mpsc::UnboundedSender<Envelope>) {
        self.inboxes.write().unwrap_or_else(PoisonError::into_inner).insert(node, inbox);
    }

    /// Stop routing messages to `node`.
    pub fn detach(&self, node: PartnerId) {
        self.inboxes.write().unwrap_or_else(PoisonError::into_inner).remove(&node);
    }

    /// Send `envelope` to `to` in a new round.
    pub fn deliver(&self, to: PartnerId, envelope: Envelope) -> Result<RoundId, SimError> {
        let inbox = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&to)
            .cloned()
            .ok_or(SimError::UnknownNode { node: to })?;
        let round = RoundId(self.next_round.fetch_add(1, Ordering::Relaxed));

        if self.loss > 0.0 && rand::thread_rng().gen_bool(self.loss) {
            tracing::debug!(%round, message_type = %envelope.message_type, "round lost");
            self.lost.lock().unwrap_or_else(PoisonError::into_inner).insert(round, envelope.message_type);
            return Ok(round);
        }

        if inbox.send(envelope).is_err() {
            tracing::debug!(%round, node = %to, "recipient stopped");
        }
        Ok(round)
    }

    /// Lost rounds that carried `message_type`.
    pub fn lost_of_type(&self, message_type: MessageType) -> usize {
        self.lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|&&t| t == message_type)
            .count()
    }
}

#[async_trait]
impl RoundTracker for Network {
    async fn track(&self, rounds: &[RoundId], _timeout: Duration) -> RoundResults {
        let lost = self.lost.lock().unwrap_or_else(PoisonError::into_inner);
        let failed = rounds.iter().filter(|round| lost.contains_key(round)).count();
        RoundResults { succeeded: rounds.len() - failed, failed, timed_out: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            message_type: MessageType::TEXT,
            fingerprint: KeyFingerprint([1; 32]),
            ciphertext: vec![1, 2, 3],
            mac: [0; MAC_SIZE],
        }
    }

    #[tokio::test]
    async fn delivers_to_attached_node() {
        let network = Network::new(0.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.attach(PartnerId::new([1; 32]), tx);

        let round = network.deliver(PartnerId::new([1; 32]), envelope()).unwrap();

        assert_eq!(rx.recv().await.unwrap().ciphertext, vec![1, 2, 3]);
        assert!(network.track(&[round], Duration::from_secs(1)).await.all_succeeded());
    }

    #[tokio::test]
    async fn lost_rounds_fail_tracking() {
        let network = Network::new(1.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.attach(PartnerId::new([1; 32]), tx);

        let round = network.deliver(PartnerId::new([1; 32]), envelope()).unwrap();

        assert!(rx.try_recv().is_err());
        let results = network.track(&[round], Duration::from_secs(1)).await;
        assert_eq!(results.failed, 1);
        assert_eq!(network.lost_of_type(MessageType::TEXT), 1);
    }

    #[test]
    fn unknown_node() {
        let network = Network::new(0.0);

        let result = network.deliver(PartnerId::new([2; 32]), envelope());

        assert!(matches!(result, Err(SimError::UnknownNode { .. })));
    }
}
