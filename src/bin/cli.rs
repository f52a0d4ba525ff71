//! Command-line client for pg-pubsub
//!
//! Listens on channels and prints messages, publishes JSON payloads, prints the
//! advisory lock key a channel maps to, and validates configuration files.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pg_pubsub::{codec, init_logging, LockKey, PgPubSub, PubSubConfig, PubSubEvent};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pg-pubsub-cli")]
#[command(about = "Publish and subscribe over PostgreSQL LISTEN/NOTIFY")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen on channels and print every message until interrupted
    Listen(ListenArgs),
    /// Publish a JSON payload on a channel
    Notify(NotifyArgs),
    /// Print the advisory lock key used for a channel
    LockKey(LockKeyArgs),
    /// Validate configuration file
    ValidateConfig(ValidateConfigArgs),
}

#[derive(Args)]
struct ConnectionArgs {
    /// Configuration file path (optional; PG_PUBSUB_* variables apply on top)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connection URL, overriding the configuration
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

impl ConnectionArgs {
    fn load(&self) -> Result<PubSubConfig> {
        let mut config = PubSubConfig::load(self.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(url) = &self.database_url {
            config = config.with_database_url(url.clone());
        }
        Ok(config)
    }
}

#[derive(Args)]
struct ListenArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Only one listener across all processes receives each channel
    #[arg(long)]
    single_listener: bool,

    /// Pretty-print payloads
    #[arg(long)]
    pretty: bool,

    /// Channels to listen on
    #[arg(required = true)]
    channels: Vec<String>,
}

#[derive(Args)]
struct NotifyArgs {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Channel to publish on
    channel: String,

    /// JSON payload; invalid JSON is sent as a string
    payload: String,
}

#[derive(Args)]
struct LockKeyArgs {
    /// Channel name
    channel: String,
}

#[derive(Args)]
struct ValidateConfigArgs {
    /// Configuration file path
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Listen(args) => listen(args).await?,
        Commands::Notify(args) => notify(args).await?,
        Commands::LockKey(args) => lock_key(args),
        Commands::ValidateConfig(args) => validate_config(args)?,
    }

    Ok(())
}

async fn listen(args: ListenArgs) -> Result<()> {
    init_logging();

    let mut config = args.connection.load()?;
    if args.single_listener {
        config = config.with_single_listener(true);
    }

    let pubsub = PgPubSub::new(config)?;
    let mut events = pubsub.subscribe();

    pubsub.connect().await.context("failed to connect")?;
    for channel in &args.channels {
        pubsub
            .listen(channel)
            .await
            .with_context(|| format!("failed to listen on {channel}"))?;
    }
    info!(channels = ?args.channels, "Waiting for messages, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(PubSubEvent::Message { channel, payload }) => {
                    let rendered = if args.pretty {
                        codec::pack_pretty(payload.as_ref())
                    } else {
                        codec::pack(payload.as_ref())
                    };
                    println!("{channel}: {rendered}");
                }
                Ok(PubSubEvent::Listen(channel)) => info!(%channel, "Now active listener"),
                Ok(PubSubEvent::Reconnect(retries)) => info!(retries, "Reconnected"),
                Ok(PubSubEvent::Error(error)) => warn!(%error, "Engine error"),
                Ok(PubSubEvent::Close) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped events, output is behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    pubsub.close().await?;
    Ok(())
}

async fn notify(args: NotifyArgs) -> Result<()> {
    let config = args.connection.load()?;
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .unwrap_or_else(|_| serde_json::Value::String(args.payload.clone()));

    let pubsub = PgPubSub::new(config)?;
    pubsub.connect().await.context("failed to connect")?;
    let sent = pubsub.notify(&args.channel, &payload).await;
    pubsub.close().await?;
    sent.with_context(|| format!("failed to notify {}", args.channel))?;

    println!("Sent to {}", args.channel);
    Ok(())
}

fn lock_key(args: LockKeyArgs) {
    println!("{}", LockKey::for_channel(&args.channel));
}

fn validate_config(args: ValidateConfigArgs) -> Result<()> {
    match PubSubConfig::load(Some(&args.config)) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("   Single listener: {}", config.single_listener);
            println!("   Retry limit: {}", config.retry_limit);
            println!("   Retry delay: {:?}", config.retry_delay());
            println!("   Max payload: {} bytes", config.max_payload_size);
        }
        Err(e) => {
            eprintln!("Configuration validation failed: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}
