use thiserror::Error;

/// Result type for entity store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures surfaced by an [`EntityStore`](crate::EntityStore) adapter.
///
/// A guard that does not hold on `update` is not an error (zero rows match);
/// on `insert` it is reported as `Conflict`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// Duplicate id, unique index hit, or a rejected insert guard.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Row-level schema rule broken: non-positive price, unknown status, dangling job.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Transport or adapter failures, as opposed to rejections of the write itself.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Serialization(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
