use thiserror::Error;

/// Result type for policy store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Policy store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Caller-supplied input rejected before any storage contact.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stored row or policy line could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transport, statement, or transaction failure from the backend.
    #[error("backend error: {0}")]
    Backend(String),
}
