//! # Configuration for pg-pubsub
//!
//! [`PubSubConfig`] holds the connection parameters and the recognized engine
//! options. Values are merged over documented defaults and are immutable once
//! handed to [`PgPubSub`](crate::PgPubSub).
//!
//! Configuration can be assembled in code with the `with_*` setters or loaded
//! with [`PubSubConfig::load`], which layers an optional file (TOML, YAML or
//! JSON, picked by extension) under `PG_PUBSUB_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{PubSubError, Result};

/// Environment variable prefix picked up by [`PubSubConfig::load`]
pub const ENV_PREFIX: &str = "PG_PUBSUB";

/// Hard server limit for a NOTIFY payload, in bytes
pub const NOTIFY_PAYLOAD_LIMIT: usize = 8000;

/// Configuration for a [`PgPubSub`](crate::PgPubSub) engine
///
/// # Examples
///
/// ```rust
/// use pg_pubsub::PubSubConfig;
/// use std::time::Duration;
///
/// let config = PubSubConfig::new()
///     .with_database_url("postgres://app@db:5432/app")
///     .with_single_listener(true)
///     .with_retry_limit(5)
///     .with_retry_delay(Duration::from_millis(500));
///
/// assert!(config.validate().is_ok());
/// assert!(config.single_listener);
/// assert_eq!(config.retry_delay(), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Connection parameters, as a PostgreSQL connection URL
    pub database_url: String,

    /// Elect one active listener per channel across all connected processes
    pub single_listener: bool,

    /// Reconnect attempts counted before the engine gives up and closes
    pub retry_limit: u32,

    /// Delay before each reconnect attempt, in milliseconds
    pub retry_delay_ms: u64,

    /// Growth factor applied to the delay per attempt (1.0 keeps it fixed)
    pub retry_backoff_factor: f64,

    /// Upper bound for an escalated reconnect delay, in milliseconds
    pub max_retry_delay_ms: u64,

    /// How often a standby retries to take over its channels, in milliseconds
    pub acquire_interval_ms: u64,

    /// Drop notifications published by this engine's own session
    pub filtered: bool,

    /// Maximum packed payload size accepted by `notify`, in bytes
    pub max_payload_size: usize,

    /// Capacity of the event broadcast buffers
    pub event_buffer_size: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/postgres".to_string(),
            single_listener: false,
            retry_limit: 10,
            retry_delay_ms: 3000,
            retry_backoff_factor: 1.0,
            max_retry_delay_ms: 30_000,
            acquire_interval_ms: 3000,
            filtered: false,
            max_payload_size: 7800, // Leave buffer under 8KB limit
            event_buffer_size: 1024,
        }
    }
}

impl PubSubConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from an optional file overlaid by `PG_PUBSUB_*` variables
    ///
    /// Missing keys fall back to [`PubSubConfig::default`]. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading pg-pubsub configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Set the connection URL
    pub fn with_database_url<S: Into<String>>(mut self, url: S) -> Self {
        self.database_url = url.into();
        self
    }

    /// Enable or disable single-listener election
    pub fn with_single_listener(mut self, enabled: bool) -> Self {
        self.single_listener = enabled;
        self
    }

    /// Set the reconnect attempt limit
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Set the delay between reconnect attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = duration_to_ms(delay);
        self
    }

    /// Escalate the reconnect delay by `factor` per attempt, capped at `max`
    pub fn with_retry_backoff(mut self, factor: f64, max: Duration) -> Self {
        self.retry_backoff_factor = factor;
        self.max_retry_delay_ms = duration_to_ms(max);
        self
    }

    /// Set the standby takeover polling interval
    pub fn with_acquire_interval(mut self, interval: Duration) -> Self {
        self.acquire_interval_ms = duration_to_ms(interval);
        self
    }

    /// Enable/disable dropping of self-published notifications
    pub fn with_filtered(mut self, filtered: bool) -> Self {
        self.filtered = filtered;
        self
    }

    /// Set maximum payload size
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size.min(NOTIFY_PAYLOAD_LIMIT - 1);
        self
    }

    /// Set the event buffer capacity
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Delay before a reconnect attempt
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Cap for escalated reconnect delays
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    /// Standby takeover polling interval
    pub fn acquire_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(PubSubError::config("database_url cannot be empty"));
        }

        if self.retry_limit == 0 {
            return Err(PubSubError::config("retry_limit must be at least 1"));
        }

        if self.retry_delay_ms == 0 {
            return Err(PubSubError::config("retry_delay_ms must be positive"));
        }

        if !self.retry_backoff_factor.is_finite() || self.retry_backoff_factor < 1.0 {
            return Err(PubSubError::config(
                "retry_backoff_factor must be a finite number >= 1.0",
            ));
        }

        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(PubSubError::config(
                "max_retry_delay_ms cannot be lower than retry_delay_ms",
            ));
        }

        if self.acquire_interval_ms == 0 {
            return Err(PubSubError::config("acquire_interval_ms must be positive"));
        }

        if self.max_payload_size == 0 || self.max_payload_size >= NOTIFY_PAYLOAD_LIMIT {
            return Err(PubSubError::config(
                "max_payload_size must be between 1 and 7999 bytes (pg_notify limit)",
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(PubSubError::config("event_buffer_size must be at least 1"));
        }

        Ok(())
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
