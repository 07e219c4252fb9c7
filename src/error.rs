//! Broker error types

use crate::session::SessionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Server binary is missing and the supervisor cannot fetch it
    #[error("language server for {language} is not installed and cannot be auto-installed")]
    NotInstalled { language: String },

    /// Server binary is missing but installable; the caller must download explicitly
    #[error("language server for {language} is not installed; download it first")]
    InstallRequired { language: String },

    /// Supervisor accepted the start request but the process did not come up
    #[error("failed to start language server for {language}: {reason}")]
    StartFailed { language: String, reason: String },

    /// No session registered under this identifier
    #[error("no session found: {0}")]
    SessionNotFound(SessionId),

    /// Document operations require a completed initialize handshake
    #[error("session {0} is not initialized")]
    NotInitialized(SessionId),

    /// No response arrived within the request timeout window
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    /// The server answered with a JSON-RPC error payload
    #[error("server error in '{method}': {message} (code {code})")]
    ServerError {
        method: String,
        code: i64,
        message: String,
    },

    /// The broker is being torn down; all outstanding requests are rejected
    #[error("broker is shutting down")]
    ShuttingDown,

    /// The response channel closed before a reply was received
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// Inbound text matched neither the response nor the notification shape
    #[error("malformed protocol message: {0}")]
    MalformedMessage(String),

    /// Failure reported by the external process supervisor
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// JSON serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BrokerError {
    pub(crate) fn supervisor(err: anyhow::Error) -> Self {
        BrokerError::Supervisor(err.to_string())
    }
}
