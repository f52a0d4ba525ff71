//! Error types for pg-pubsub

use thiserror::Error;

/// Result type for pg-pubsub operations
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors that can occur in pg-pubsub operations
#[derive(Error, Debug)]
pub enum PubSubError {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Configuration sources could not be read or merged
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Invalid channel name
    #[error("Invalid channel name {channel:?}: {reason}")]
    InvalidChannel { channel: String, reason: String },

    /// Packed payload does not fit into a single notification
    #[error("Payload size {size} exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// No live session on the underlying client
    #[error("Client is not connected to database")]
    NotConnected,

    /// A session could not be opened by a non-sqlx client
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Reconnect attempts used up; the engine closes itself after this
    #[error("Connect failed after {retries} retries...")]
    ReconnectExhausted { retries: u32 },
}

impl PubSubError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid channel error
    pub fn invalid_channel<C: Into<String>, R: Into<String>>(channel: C, reason: R) -> Self {
        Self::InvalidChannel {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Whether the error means the session is gone rather than a statement failing
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::NotConnected | Self::Connection { .. } => true,
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_exhausted_message() {
        let err = PubSubError::ReconnectExhausted { retries: 3 };
        assert_eq!(err.to_string(), "Connect failed after 3 retries...");
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(PubSubError::NotConnected.is_disconnect());
        assert!(PubSubError::connection("refused").is_disconnect());
        assert!(PubSubError::Database(sqlx::Error::PoolClosed).is_disconnect());
        assert!(!PubSubError::config("bad").is_disconnect());
        assert!(!PubSubError::invalid_channel("", "empty").is_disconnect());
    }
}
