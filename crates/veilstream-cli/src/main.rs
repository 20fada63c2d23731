//! Veilstream CLI
//!
//! Drives the veilstream-core library end-to-end over the in-process
//! ledger.
//!
//! ## Usage
//!
//! ```bash
//! # Writer and reader in one process: public, group-encrypted and
//! # per-recipient messages per iteration
//! veilstream demo --message "hello" --iterations 3
//!
//! # One-shot channel: publish signed messages and print their tails
//! veilstream publish --message "update" --count 2
//!
//! # Publish through an announced endpoint, dumping the last bundle
//! veilstream publish --endpoint --json bundle.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use veilstream_core::{
    LedgerClient, MemoryLedger, Message, NativeEngine, Psk, PskId, ReadStream, ReadStreamConfig,
    RecipientSecretKey, Seed, WriteStream, WriteStreamConfig,
};

/// Veilstream - masked authenticated message streams
#[derive(Parser)]
#[command(name = "veilstream")]
#[command(version = "0.1.0")]
#[command(about = "Veilstream - masked authenticated message streams")]
#[command(
    long_about = "Publish/subscribe over an address-indexed ledger: a writer owns a channel \
                  backed by a one-time-key tree, readers poll the channel address and decode \
                  what their key material entitles them to."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a writer and a reader over one shared in-memory ledger
    Demo {
        /// Message text to publish
        #[arg(short, long, default_value = "hello veilstream")]
        message: String,

        /// How many rounds of messages to publish
        #[arg(short, long, default_value_t = 1)]
        iterations: u32,
    },

    /// Open a channel, publish signed messages and print their tails
    Publish {
        /// Message text to publish
        #[arg(short, long, default_value = "veilstream packet")]
        message: String,

        /// How many messages to publish; the final one carries the last flag
        #[arg(short, long, default_value_t = 1)]
        count: u32,

        /// Announce an endpoint and publish through it
        #[arg(short, long)]
        endpoint: bool,

        /// Write the last published bundle as JSON to this path
        #[arg(long, value_name = "PATH")]
        json: Option<PathBuf>,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn open_writer(ledger: &Arc<MemoryLedger>) -> WriteStream<NativeEngine, MemoryLedger> {
    WriteStream::new(
        NativeEngine::new(&Seed::random()),
        ledger.clone(),
        WriteStreamConfig::default(),
    )
}

async fn run_demo(message: &str, iterations: u32) -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let writer = open_writer(&ledger);
    let channel = writer.open().await?;
    tracing::info!(%channel, iterations, "demo channel opened");

    println!("channel: {}", channel);
    println!("address: {}", channel.to_address());
    println!();

    let psk = Psk::generate(PskId::random());
    let recipient = RecipientSecretKey::generate();

    let mut reader = ReadStream::new(
        NativeEngine::new(&Seed::random()),
        ledger.clone(),
        ReadStreamConfig {
            poll_interval: Duration::from_millis(200),
            error_buffer: 16,
        },
    );
    let mut subscription = reader.open(
        &channel,
        std::slice::from_ref(&psk),
        std::slice::from_ref(&recipient),
    )?;

    let mut expected = 0usize;
    for i in 1..=iterations {
        let text = if iterations > 1 {
            format!("{} ({}/{})", message, i, iterations)
        } else {
            message.to_string()
        };

        writer
            .write(&Message::builder().signed().create(text.clone().into_bytes())?)
            .await?;
        writer
            .write(
                &Message::builder()
                    .encrypted()
                    .groups(std::slice::from_ref(&psk))?
                    .with_integrity()
                    .create(format!("{} [group]", text).into_bytes())?,
            )
            .await?;
        writer
            .write(
                &Message::builder()
                    .encrypted()
                    .recipients(&[recipient.public_key()])?
                    .signed()
                    .create(format!("{} [direct]", text).into_bytes())?,
            )
            .await?;
        expected += 3;
    }

    for _ in 0..expected {
        match subscription.recv().await {
            Some(payload) => println!("received: {}", String::from_utf8_lossy(&payload)),
            None => break,
        }
    }

    subscription.close().await;
    writer.close().await?;
    println!();
    println!("demo complete: {} messages delivered", expected);
    Ok(())
}

async fn run_publish(
    message: &str,
    count: u32,
    endpoint: bool,
    json: Option<PathBuf>,
) -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let writer = open_writer(&ledger);
    let channel = writer.open().await?;

    println!("channel: {}", channel);
    println!("address: {}", channel.to_address());

    if endpoint {
        let (endpoint_id, tail) = writer.announce_endpoint().await?;
        println!("endpoint: {}", endpoint_id);
        println!("  announcement tail: {}", tail);
    }

    let mut last_tail = None;
    for i in 1..=count {
        let builder = Message::builder().signed();
        let builder = if i == count { builder.last() } else { builder };
        let text = if count > 1 {
            format!("{} ({}/{})", message, i, count)
        } else {
            message.to_string()
        };

        let tail = writer.write(&builder.create(text.into_bytes())?).await?;
        tracing::debug!(%tail, index = i, "message attached");
        println!("  tail: {}", tail);
        last_tail = Some(tail);
    }

    if let Some(path) = json {
        let tail = last_tail
            .as_ref()
            .context("nothing was published, no bundle to dump")?;
        let bundle = ledger
            .get_bundle(tail)
            .await?
            .context("published bundle not found on the ledger")?;
        std::fs::write(&path, serde_json::to_string_pretty(&bundle)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("bundle written to {}", path.display());
    }

    writer.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Demo {
            message,
            iterations,
        } => run_demo(&message, iterations).await,
        Commands::Publish {
            message,
            count,
            endpoint,
            json,
        } => run_publish(&message, count, endpoint, json).await,
    }
}
