//! A two-party conversation driven to completion

use std::{path::PathBuf, sync::Arc, time::Duration};

use tandem_core::{MemoryKv, PartnerId, RedbKv, SessionParams, Store};
use tandem_rekey::{MessageType, RekeyParams};
use tokio::{sync::watch, time::Instant};

use crate::{error::SimError, network::Network, node::Node};

/// Where the nodes keep their state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// In process memory, gone when the run ends
    Memory,
    /// A redb file shared by both nodes
    Redb(PathBuf),
}

/// Settings of one simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Texts each node sends
    pub messages: u32,
    /// Session parameters of both directions
    pub session: SessionParams,
    /// Rekey protocol settings
    pub rekey: RekeyParams,
    /// Probability that the network drops a message
    pub loss: f64,
    /// Pause between two sends
    pub pace: Duration,
    /// How long to wait for stragglers after the last send
    pub drain_timeout: Duration,
    /// Backing storage
    pub storage: Storage,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            messages: 200,
            session: SessionParams {
                min_keys: 40,
                max_keys: 60,
                num_rekeys: 8,
                rekey_threshold: 0.3,
                unconfirmed_retry_ratio: 0.1,
            },
            rekey: RekeyParams { round_timeout: Duration::from_secs(2), ..RekeyParams::default() },
            loss: 0.0,
            pace: Duration::from_millis(1),
            drain_timeout: Duration::from_secs(5),
            storage: Storage::Memory,
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Texts sent by both nodes
    pub sent: u32,
    /// Texts that reached their recipient
    pub delivered: usize,
    /// Texts the network dropped
    pub lost: usize,
    /// Messages still waiting for a key
    pub held: usize,
    /// Send sessions alice went through
    pub alice_sessions: usize,
    /// Send sessions bob went through
    pub bob_sessions: usize,
}

impl Summary {
    /// True when every text the network carried was delivered.
    pub fn complete(&self) -> bool {
        self.delivered + self.lost >= self.sent as usize
    }
}

const ALICE: PartnerId = PartnerId::new([0xA1; 32]);
const BOB: PartnerId = PartnerId::new([0xB0; 32]);

/// Run a conversation between two fresh nodes.
///
/// Alice and bob take turns sending `config.messages` texts each. Every
/// send may start a rekey; the run ends once the texts are delivered or
/// the drain timeout passes.
pub async fn run(config: &SimConfig) -> Result<Summary, SimError> {
    let root = match &config.storage {
        Storage::Memory => Store::new(Arc::new(MemoryKv::new())),
        Storage::Redb(path) => Store::new(Arc::new(RedbKv::open(path)?)),
    };
    let network = Arc::new(Network::new(config.loss));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let alice = Node::new(
        ALICE,
        root.prefix("alice"),
        Arc::clone(&network),
        config.rekey,
        shutdown_rx.clone(),
    )?;
    let bob =
        Node::new(BOB, root.prefix("bob"), Arc::clone(&network), config.rekey, shutdown_rx)?;
    alice.connect(&bob, config.session)?;

    let mut tasks = alice.start();
    tasks.extend(bob.start());

    tracing::info!(messages = config.messages, loss = config.loss, "conversation started");

    for n in 0..config.messages {
        alice.send_text(BOB, format!("alice {n}").as_bytes()).await?;
        bob.send_text(ALICE, format!("bob {n}").as_bytes()).await?;
        tokio::time::sleep(config.pace).await;
    }

    let sent = config.messages * 2;
    let deadline = Instant::now() + config.drain_timeout;
    let summary = loop {
        let summary = Summary {
            sent,
            delivered: alice.texts().len() + bob.texts().len(),
            lost: network.lost_of_type(MessageType::TEXT),
            held: alice.held() + bob.held(),
            alice_sessions: alice.send_sessions_used(),
            bob_sessions: bob.send_sessions_used(),
        };
        if summary.complete() || Instant::now() >= deadline {
            break summary;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // receivers may already be gone
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "task ended abnormally");
        }
    }

    tracing::info!(?summary, "conversation finished");
    Ok(summary)
}
