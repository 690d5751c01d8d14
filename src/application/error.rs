use crate::infrastructure::error::InfraError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("not signed in or session expired: {0}")]
    Unauthenticated(String),
    #[error("unexpected server response: {0}")]
    Protocol(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("server did not return a session id")]
    MissingSessionId,
    #[error("session has not been started on the server yet")]
    SessionNotInitialized,
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("operation not allowed while {0}")]
    InvalidState(String),
    #[error("session is already completed")]
    AlreadyCompleted,
    #[error("credential store error: {0}")]
    Credential(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("progress persister is no longer running")]
    PersisterUnavailable,
}

impl SessionError {
    /// Transport failures and 5xx responses; safe to retry for idempotent calls.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Network(_) => true,
            SessionError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, SessionError::Unauthenticated(_))
    }

    /// Whether the presentation layer should show a blocking dialog. Persist
    /// failures never reach the user through this path; they are reported on
    /// the persister's health channel instead.
    pub fn blocks_user(&self) -> bool {
        !matches!(
            self,
            SessionError::Validation(_)
                | SessionError::InvalidState(_)
                | SessionError::AlreadyCompleted
        )
    }
}

impl From<InfraError> for SessionError {
    fn from(error: InfraError) -> Self {
        match error {
            InfraError::Network(message) => SessionError::Network(message),
            InfraError::Auth(message) => SessionError::Unauthenticated(message),
            InfraError::Http { status, body } => SessionError::Server {
                status,
                message: body,
            },
            InfraError::Protocol(message) => SessionError::Protocol(message),
            InfraError::Json(error) => SessionError::Protocol(error.to_string()),
            InfraError::Credential(message) => SessionError::Credential(message),
            InfraError::InvalidConfig(message) => SessionError::Config(message),
            InfraError::Io(error) => SessionError::Config(error.to_string()),
        }
    }
}
