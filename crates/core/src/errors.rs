//! Error types shared across the sync engine.

use thiserror::Error;

use crate::sync::PrimingStage;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry policy class for document store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Failures reported by a document store collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or transport failure
    #[error("Document store unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the request with a status code
    #[error("Document store request failed ({status}): {message}")]
    Api { status: u16, message: String },

    /// Query shape the backend cannot execute (e.g. inclusion set too large)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Payload could not be decoded into documents
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> StoreRetryClass {
        match self {
            Self::Unavailable(_) => StoreRetryClass::Retryable,
            Self::Api { status, .. } => match *status {
                401 | 403 => StoreRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => StoreRetryClass::Retryable,
                500..=599 => StoreRetryClass::Retryable,
                _ => StoreRetryClass::Permanent,
            },
            Self::InvalidQuery(_) | Self::Malformed(_) => StoreRetryClass::Permanent,
        }
    }
}

/// Local persistence failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Document store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A priming phase that must complete failed; the run was aborted.
    #[error("Priming failed during {stage}: {message}")]
    Priming {
        stage: PrimingStage,
        message: String,
    },

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),
}

impl Error {
    pub fn priming(stage: PrimingStage, err: impl std::fmt::Display) -> Self {
        Self::Priming {
            stage,
            message: err.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Database(DatabaseError::Internal(message.into()))
    }
}
