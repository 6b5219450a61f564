use std::path::PathBuf;
use thiserror::Error;

use crate::secrets::SecretError;

#[derive(Error, Debug)]
pub enum BroadcasterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to resolve secret '{name}': {source}")]
    Secret {
        name: String,
        #[source]
        source: SecretError,
    },

    #[error("Invalid proxy URL '{url}': {reason}")]
    InvalidProxy { url: String, reason: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected response status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authorization rejected: {0}")]
    AuthRejected(String),

    #[error("Connection timed out after {0}s")]
    ConnectTimeout(u64),

    #[error("Connection task is not running")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(err.to_string())
    }
}

impl From<native_tls::Error> for TransportError {
    fn from(err: native_tls::Error) -> Self {
        TransportError::Tls(err.to_string())
    }
}

/// Errors raised while retrieving missed messages.
///
/// Too much history is not an error: fetchers report it through
/// `HistoryOutput::reset` instead.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("History request timed out after {0}ms")]
    Timeout(u64),

    #[error("Backend rejected history request: {0}")]
    Rejected(String),

    #[error("Malformed history response: {0}")]
    Malformed(String),
}

impl HistoryError {
    /// Returns true if the error is likely transient and the fetch can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            HistoryError::Timeout(_) => true,
            HistoryError::Transport(TransportError::Request(e)) => e.is_timeout() || e.is_connect(),
            HistoryError::Transport(TransportError::WebSocket(_) | TransportError::Closed) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BroadcasterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_error_retryable() {
        assert!(HistoryError::Timeout(5000).is_retryable());
        assert!(HistoryError::Transport(TransportError::Closed).is_retryable());
        assert!(!HistoryError::Rejected("nope".to_string()).is_retryable());
        assert!(!HistoryError::Malformed("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = BroadcasterError::from(ConfigError::Validation {
            message: "userId is required".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Config validation failed: userId is required"
        );
    }
}
