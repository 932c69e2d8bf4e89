use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SeerError>;

/// How a completion-provider failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProviderFailureKind {
    /// Worth retrying (timeout, rate limit, 5xx).
    Transient,
    /// Retrying the same request cannot succeed.
    Fatal,
}

#[derive(Debug, Error)]
pub enum SeerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("provider failure: {message}")]
    Provider {
        kind: ProviderFailureKind,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SeerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Self::Provider { .. } => "PROVIDER_FAILURE",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_transient_provider(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                kind: ProviderFailureKind::Transient,
                ..
            }
        )
    }

    pub(crate) fn mutex_poisoned(name: &str) -> Self {
        Self::Internal(format!("{name} mutex poisoned"))
    }

    pub(crate) fn provider_transient(message: impl Into<String>) -> Self {
        Self::Provider {
            kind: ProviderFailureKind::Transient,
            message: message.into(),
        }
    }

    pub(crate) fn provider_fatal(message: impl Into<String>) -> Self {
        Self::Provider {
            kind: ProviderFailureKind::Fatal,
            message: message.into(),
        }
    }
}
