//! Error types for relay queries.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single strategy attempt against one relay.
///
/// The coordinator folds these into failed result envelopes; they only reach
/// callers that use a strategy directly.
#[derive(Error, Debug)]
pub enum QueryError {
    /// Relay URL could not be parsed or uses an unsupported scheme.
    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),

    /// Filter failed validation before any network call.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Attempt did not finish before its deadline.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// HTTP endpoint answered with a non-2xx status.
    #[error("http status {0}")]
    HttpStatus(u16),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body was not a recognizable event list.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// WebSocket protocol or transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// Relay ended the subscription with a `CLOSED` message.
    #[error("subscription closed by relay: {0}")]
    Closed(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<url::ParseError> for QueryError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidRelayUrl(e.to_string())
    }
}

impl From<tokio_socks::Error> for QueryError {
    fn from(e: tokio_socks::Error) -> Self {
        Self::Connection(format!("socks proxy: {e}"))
    }
}

/// Result alias for strategy calls.
pub type Result<T> = std::result::Result<T, QueryError>;
