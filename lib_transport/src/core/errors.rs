//! # Transport Errors
//!
//! One error type for the whole library. Steady-state failures (probe misses,
//! a single failed poll) are logged where they happen and never reach this
//! type's callers; what does surface here changes what the application can
//! rely on.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type TransportResult<T> = Result<T, TransportError>;

/// # Transport Error
#[derive(Debug, Error)]
pub enum TransportError {
    /// A send was attempted while the persistent channel had no open session.
    #[error("persistent channel is not connected")]
    NotConnected,

    /// The session provider has no access credential.
    #[error("no access credential available")]
    MissingCredential,

    /// A network operation exceeded its bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level HTTP failure.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The business API answered with a non-success `api_status`.
    #[error("api returned status {status}: {message}")]
    Api {
        /// `api_status` (or HTTP status when the body could not be read).
        status: u16,
        /// Server supplied message, if any.
        message: String,
    },

    /// WebSocket handshake or I/O failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A payload did not match the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Local filesystem failure (media cache).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The media intake queue no longer accepts work.
    #[error("media intake queue is closed")]
    QueueClosed,

    /// The media cache directory could not be created; media is disabled.
    #[error("media cache is unavailable")]
    CacheUnavailable,

    /// Both the channel and the REST fallback failed for one outbound message.
    #[error("send of message {client_message_id} failed: {reason}")]
    SendFailed {
        /// Client-generated id of the message that was not delivered.
        client_message_id: String,
        /// Last error seen.
        reason: String,
    },

    /// A configured URL did not parse.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration was rejected before anything started.
    #[error("configuration error: {0}")]
    Config(#[from] crate::configs::ConfigError),
}
