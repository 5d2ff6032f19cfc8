use thiserror::Error;

use crate::types::GraphQlError;

/// Errors surfaced to callers of the session core.
///
/// `Clone` so that one refresh outcome can be delivered to every queued
/// caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// No session is active, or the gateway rejected an anonymous call.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The session could not be renewed and has been ended.
    #[error("Session refresh failed: {0}")]
    RefreshFailed(String),

    /// The session was ended by logout while this operation was waiting.
    #[error("Session ended")]
    SessionEnded,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Gateway returned HTTP {status}")]
    Http { status: u16, body: String },

    #[error("GraphQL errors: {}", join_messages(.0))]
    GraphQl(Vec<GraphQlError>),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether this error means the caller must sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::NotAuthenticated
                | SessionError::RefreshFailed(_)
                | SessionError::SessionEnded
        )
    }
}

fn join_messages(errors: &[GraphQlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

impl From<core_runtime::Error> for SessionError {
    fn from(e: core_runtime::Error) -> Self {
        SessionError::Config(e.to_string())
    }
}

/// Why a token exchange failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The exchange never produced a response.
    #[error("refresh request failed: {0}")]
    Transport(String),

    /// The gateway refused the refresh token.
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    /// The gateway answered but the payload had no usable credentials.
    #[error("malformed refresh response: {0}")]
    MalformedResponse(String),
}

impl From<RefreshFailure> for SessionError {
    fn from(failure: RefreshFailure) -> Self {
        SessionError::RefreshFailed(failure.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
