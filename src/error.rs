// Error handling module
// Defines the client error taxonomy surfaced to callers

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed refresh exchange
///
/// Cloneable so one failure can be handed to every request parked on the
/// refresh that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    /// HTTP status of the refresh response, `None` for network failures
    /// or when no refresh token was stored
    pub status: Option<u16>,
    pub message: String,
}

impl RefreshFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// No refresh token was available to exchange
    pub fn missing_token() -> Self {
        Self::new(None, "No refresh token available")
    }
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} - {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Coarse classification of a [`ClientError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Refresh failed, or a request still got 401 after its one retry.
    /// The session the request was sent under has ended.
    TerminalAuthFailure,

    /// 401 from login, registration or another call that presents
    /// credentials itself. The stored session is untouched.
    InvalidCredentials,

    /// 403: the credential is valid but insufficient
    AuthorizationDenied,

    /// 429: caller decides whether and when to retry
    RateLimited,

    /// Any other HTTP failure or transport failure
    NetworkOrServerError,

    /// Failures that never reached the server (storage, encoding)
    Local,
}

/// Errors returned by the API client
#[derive(Error, Debug)]
pub enum ClientError {
    /// The refresh exchange failed; the session has been cleared
    #[error("Session expired: {0}")]
    RefreshFailed(RefreshFailure),

    /// 401 that could not be resolved by refreshing
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// 401 on a request that carries its own credentials
    #[error("Invalid credentials: {message}")]
    InvalidCredentials { message: String },

    /// 403
    #[error("Access denied: {message}")]
    Forbidden { message: String },

    /// 429
    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    /// Any other non-success status
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The request never produced a response
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// The response body did not have the expected shape
    #[error("Invalid response: {0}")]
    Decode(String),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Credential storage failure
    #[error("Credential storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::RefreshFailed(_) | ClientError::Unauthorized { .. } => {
                ErrorKind::TerminalAuthFailure
            }
            ClientError::InvalidCredentials { .. } => ErrorKind::InvalidCredentials,
            ClientError::Forbidden { .. } => ErrorKind::AuthorizationDenied,
            ClientError::RateLimited { .. } => ErrorKind::RateLimited,
            ClientError::Api { .. } | ClientError::Network { .. } | ClientError::Decode(_) => {
                ErrorKind::NetworkOrServerError
            }
            ClientError::InvalidRequest(_)
            | ClientError::Storage(_)
            | ClientError::Internal(_) => ErrorKind::Local,
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::RefreshFailed(failure) => failure.status,
            ClientError::Unauthorized { .. } | ClientError::InvalidCredentials { .. } => Some(401),
            ClientError::Forbidden { .. } => Some(403),
            ClientError::RateLimited { .. } => Some(429),
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Retry-After hint for rate-limited responses
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
