#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # pg-pubsub
//!
//! Resilient publish/subscribe on top of PostgreSQL `LISTEN`/`NOTIFY`.
//!
//! ## Overview
//!
//! Independent processes subscribe to named channels, receive asynchronously
//! delivered JSON messages and publish to any channel. Optionally, a single
//! active listener is elected per channel across the whole fleet, using
//! session-scoped advisory locks, with automatic failover when that listener
//! disappears.
//!
//! ## Key Features
//!
//! - **Automatic reconnect** with fixed or escalating backoff and a retry limit
//! - **Single-listener election** per channel, arbitrated by the server
//! - **Fast failover**: locks are released on session loss and announced on release
//! - **Typed events**: closed [`PubSubEvent`] enum with callbacks and broadcast receivers
//! - **Pluggable client**: [`PgNotifyClient`] for PostgreSQL, [`InMemoryClient`] in-process
//!
//! ## Module Organization
//!
//! - [`engine`] - The [`PgPubSub`] engine and its reconnect state machine
//! - [`lock`] - Exclusive channel lock built on advisory locks
//! - [`client`] - Underlying session clients
//! - [`codec`] - Payload (de)serialization and hashing
//! - [`sql`] - Statement rendering and identifier quoting
//! - [`events`] - Event types and the event bus
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_pubsub::{init_logging, EventKind, PgPubSub, PubSubConfig, PubSubEvent};
//! use serde_json::json;
//!
//! # async fn example() -> pg_pubsub::Result<()> {
//! init_logging();
//!
//! let pubsub = PgPubSub::new(PubSubConfig::load(None)?)?;
//! pubsub.on(EventKind::Message, |event| {
//!     if let PubSubEvent::Message { channel, payload } = event {
//!         tracing::info!(%channel, ?payload, "message");
//!     }
//! });
//!
//! pubsub.connect().await?;
//! pubsub.listen("orders").await?;
//! pubsub.notify("orders", &json!({"id": 1})).await?;
//! pubsub.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit tests live next to the code. Integration tests run against the
//! in-memory server; tests that need a live PostgreSQL read `DATABASE_URL` and
//! are ignored by default:
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/pg_pubsub_test cargo test -- --ignored
//! ```

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lock;
pub mod logging;
pub mod sql;

pub use backoff::RetryPolicy;
pub use client::{
    ClientEvent, InMemoryClient, InMemoryServer, LockKey, Notification, NotifyClient,
    PgNotifyClient,
};
pub use config::PubSubConfig;
pub use engine::{ConnectionState, PgPubSub, PubSubStats};
pub use error::{PubSubError, Result};
pub use events::{EventBus, EventKind, HandlerId, PubSubEvent};
pub use lock::{ChannelLock, LockState};
pub use logging::init_logging;
