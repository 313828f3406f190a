//! Session error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the credential store, renewal coordinator and request pipeline.
///
/// The type is `Clone` because one renewal outcome is handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The access token was rejected. Recovered internally, never returned by
    /// `RequestPipeline::issue_request`.
    #[error("access token expired")]
    AuthExpired,

    /// The refresh token was rejected or missing - sign-in required.
    #[error("session is no longer valid: {reason}")]
    AuthInvalid { reason: String },

    #[error("network unavailable: {reason}")]
    NetworkUnavailable { reason: String },

    #[error("request timed out: {reason}")]
    Timeout { reason: String },

    /// Secure storage could not be read or written; credentials are not durable.
    #[error("secure storage failure: {reason}")]
    StorageFailure { reason: String },

    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    /// Non-auth HTTP failure or an `ERROR` envelope, surfaced by the typed helpers.
    #[error(
        "request failed with HTTP {status}: {}",
        .message.as_deref().unwrap_or("no message")
    )]
    Api {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl SessionError {
    pub fn auth_invalid(reason: impl Into<String>) -> Self {
        Self::AuthInvalid {
            reason: reason.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkUnavailable {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::StorageFailure {
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Check if this error ends the session and requires a fresh sign-in.
    pub fn requires_relogin(&self) -> bool {
        matches!(self, Self::AuthInvalid { .. })
    }

    /// Check if this error is transient and the caller may try again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkUnavailable { .. } | Self::Timeout { .. } => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

/// Classify a reqwest error into the session taxonomy.
pub fn classify_reqwest_error(err: &reqwest::Error) -> SessionError {
    if err.is_timeout() {
        SessionError::timeout(err.to_string())
    } else if err.is_decode() {
        SessionError::malformed(err.to_string())
    } else if err.is_builder() {
        SessionError::configuration(err.to_string())
    } else {
        SessionError::network(err.to_string())
    }
}
