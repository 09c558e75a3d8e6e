//! Tandem simulation binary.
//!
//! # Usage
//!
//! ```bash
//! # Lossless conversation in memory
//! tandem-sim --messages 500
//!
//! # Drop one message in ten, keep state in a redb file
//! tandem-sim --loss 0.1 --db /tmp/tandem.redb
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tandem_core::SessionParams;
use tandem_rekey::RekeyParams;
use tandem_sim::{SimConfig, Storage};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Two partners exchanging messages and rekeying
#[derive(Parser, Debug)]
#[command(name = "tandem-sim")]
#[command(about = "Simulate a Tandem partner conversation")]
#[command(version)]
struct Args {
    /// Texts each partner sends
    #[arg(short, long, default_value = "200")]
    messages: u32,

    /// Smallest number of keys in a session
    #[arg(long, default_value = "40")]
    min_keys: u32,

    /// Largest number of keys in a session
    #[arg(long, default_value = "60")]
    max_keys: u32,

    /// Keys held back for rekey messages
    #[arg(long, default_value = "8")]
    num_rekeys: u32,

    /// Fraction of keys used before a rekey starts
    #[arg(long, default_value = "0.3")]
    threshold: f64,

    /// Fraction of sends that go out on an unconfirmed session
    #[arg(long, default_value = "0.1")]
    retry_ratio: f64,

    /// Probability that a message is dropped
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// Milliseconds between sends
    #[arg(long, default_value = "1")]
    pace_ms: u64,

    /// Seconds a rekey round may take
    #[arg(long, default_value = "2")]
    round_timeout: u64,

    /// redb file to keep state in (memory if absent)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let session = SessionParams {
        min_keys: args.min_keys,
        max_keys: args.max_keys,
        num_rekeys: args.num_rekeys,
        rekey_threshold: args.threshold,
        unconfirmed_retry_ratio: args.retry_ratio,
    };
    session.validate()?;

    let config = SimConfig {
        messages: args.messages,
        session,
        rekey: RekeyParams {
            round_timeout: Duration::from_secs(args.round_timeout),
            ..RekeyParams::default()
        },
        loss: args.loss,
        pace: Duration::from_millis(args.pace_ms),
        storage: args.db.map_or(Storage::Memory, Storage::Redb),
        ..SimConfig::default()
    };

    let summary = tandem_sim::run(&config).await?;

    tracing::info!(
        sent = summary.sent,
        delivered = summary.delivered,
        lost = summary.lost,
        held = summary.held,
        alice_sessions = summary.alice_sessions,
        bob_sessions = summary.bob_sessions,
        "done"
    );
    if !summary.complete() {
        tracing::warn!("some messages never arrived");
    }
    Ok(())
}
