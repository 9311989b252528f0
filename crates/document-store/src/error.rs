//! Error types for the REST document store client.

use harvestdesk_core::errors::{Error as CoreError, StoreError, StoreRetryClass};
use thiserror::Error;

/// Result type alias for document store client operations.
pub type Result<T> = std::result::Result<T, DocumentStoreError>;

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error response from the backend
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Query the backend would reject, caught before sending
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Missing or unusable access token
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Response body that does not look like a document listing
    #[error("Decode error: {0}")]
    Decode(String),

    /// No async runtime to drive a change feed on
    #[error("Runtime unavailable: {0}")]
    Runtime(String),
}

impl DocumentStoreError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> StoreRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => StoreRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => StoreRetryClass::Retryable,
                500..=599 => StoreRetryClass::Retryable,
                _ => StoreRetryClass::Permanent,
            },
            Self::Http(_) | Self::Runtime(_) => StoreRetryClass::Retryable,
            Self::Json(_) | Self::InvalidQuery(_) | Self::Decode(_) => StoreRetryClass::Permanent,
            Self::Auth(_) => StoreRetryClass::ReauthRequired,
        }
    }
}

impl From<DocumentStoreError> for StoreError {
    fn from(err: DocumentStoreError) -> Self {
        match err {
            DocumentStoreError::Http(e) => StoreError::unavailable(e.to_string()),
            DocumentStoreError::Runtime(message) => StoreError::unavailable(message),
            DocumentStoreError::Json(e) => StoreError::Malformed(e.to_string()),
            DocumentStoreError::Decode(message) => StoreError::Malformed(message),
            DocumentStoreError::Api { status, message } => StoreError::api(status, message),
            DocumentStoreError::InvalidQuery(message) => StoreError::invalid_query(message),
            DocumentStoreError::Auth(message) => StoreError::api(401, message),
        }
    }
}

impl From<DocumentStoreError> for CoreError {
    fn from(err: DocumentStoreError) -> Self {
        CoreError::Store(err.into())
    }
}
