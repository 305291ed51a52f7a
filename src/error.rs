// Error handling module
// Defines the closed error taxonomy surfaced by the client

use thiserror::Error;

/// Errors that can occur while dispatching an authenticated request
///
/// Values are `Clone` so a single refresh outcome can be handed to every
/// caller queued behind it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The server rejected the credential and it could not be recovered
    /// within this request's single retry
    #[error("Authentication expired: {status} - {message}")]
    AuthExpired { status: u16, message: String },

    /// A refresh was needed but no refresh token is stored
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The refresh endpoint rejected the token, timed out, or was unreachable
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Network-level failure before a response was received
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: &'static str, message: String },

    /// Non-success response from the API
    #[error("Upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },

    /// Response body did not have the expected shape
    #[error("Invalid response body: {0}")]
    Decode(String),

    /// Credential store failure
    #[error("Credential storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the application should force a sign-out after this error
    pub fn requires_sign_out(&self) -> bool {
        matches!(self, ClientError::NoRefreshToken | ClientError::RefreshFailed(_))
    }

    /// Categorize a reqwest error for better debugging
    pub fn from_transport(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_request() {
            "request_error"
        } else if err.is_body() {
            "body_error"
        } else if err.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        ClientError::Transport {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for ClientError {
    fn from(err: rusqlite::Error) -> Self {
        ClientError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
