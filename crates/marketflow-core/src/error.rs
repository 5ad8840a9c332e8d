use crate::steps::{Operation, Step};
use marketflow_storage::{BidRecord, JobRecord, StorageError, TransactionRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kind labels returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    InvalidInput,
    ConflictingState,
    StoreFailure,
    PartialFailure,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::ConflictingState => "conflicting_state",
            Self::StoreFailure => "store_failure",
            Self::PartialFailure => "partial_failure",
        }
    }
}

/// Last-known-good rows of the job touched by a failed sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub job: Option<JobRecord>,
    pub bids: Vec<BidRecord>,
    pub transactions: Vec<TransactionRecord>,
}

/// Diagnostic for a sequence that committed some steps and then failed.
#[derive(Debug, Clone, Serialize)]
pub struct PartialFailureReport {
    pub operation: Operation,
    pub failed_step: Step,
    pub committed_steps: Vec<Step>,
    pub cause: String,
    pub cause_kind: ErrorKind,
    pub snapshot: EntitySnapshot,
}

/// Workflow-layer errors.
///
/// Every variant except `StoreFailure` and `PartialFailure` is raised before
/// any write is attempted.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflicting state: {0}")]
    ConflictingState(String),

    #[error("store failure: {0}")]
    StoreFailure(String),

    #[error(
        "partial failure in {} at step '{}' after {} committed step(s): {}",
        .0.operation,
        .0.failed_step,
        .0.committed_steps.len(),
        .0.cause
    )]
    PartialFailure(Box<PartialFailureReport>),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::ConflictingState(_) => ErrorKind::ConflictingState,
            Self::StoreFailure(_) => ErrorKind::StoreFailure,
            Self::PartialFailure(_) => ErrorKind::PartialFailure,
        }
    }

    pub fn partial_report(&self) -> Option<&PartialFailureReport> {
        match self {
            Self::PartialFailure(report) => Some(report.as_ref()),
            _ => None,
        }
    }

    pub fn missing(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{entity} '{id}' does not exist"))
    }

    pub fn step_order_violation(operation: Operation, expected: &str, actual: &str) -> Self {
        Self::ConflictingState(format!(
            "step order violation in {operation}: expected '{expected}', got '{actual}'"
        ))
    }
}

impl From<StorageError> for WorkflowError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(message) => Self::NotFound(message),
            StorageError::Conflict(message) => Self::ConflictingState(message),
            StorageError::ConstraintViolation(message) | StorageError::InvalidInput(message) => {
                Self::InvalidInput(message)
            }
            other => Self::StoreFailure(other.to_string()),
        }
    }
}
