//! Error taxonomy for the coordination core

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::model::SourceId;

/// Errors surfaced by the coordinator and its components.
///
/// Detection, resolution and merge failures are normally absorbed by the
/// pipeline (fail-open, fall back to user review); they only reach a caller
/// when a component is driven directly.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Lock on {document_path} held by {holder}, retry after {retry_after:?}")]
    LockAcquisition {
        document_path: String,
        holder: SourceId,
        retry_after: Duration,
    },

    #[error("Conflict detection failed: {0}")]
    ConflictDetection(String),

    #[error("Conflict resolution failed: {0}")]
    ConflictResolution(String),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Event loop terminated correlation {correlation_id}")]
    EventLoopCritical { correlation_id: Uuid },

    #[error("Queue for {0} is full")]
    QueueFull(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal state poisoned: {0}")]
    StatePoisoned(&'static str),

    #[error("Coordinator is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinationError {
    /// An equivalent error for another recipient. I/O and serde errors
    /// cannot be cloned and are carried as their message.
    pub fn replicate(&self) -> Self {
        match self {
            CoordinationError::InvalidOperation(m) => CoordinationError::InvalidOperation(m.clone()),
            CoordinationError::LockAcquisition {
                document_path,
                holder,
                retry_after,
            } => CoordinationError::LockAcquisition {
                document_path: document_path.clone(),
                holder: holder.clone(),
                retry_after: *retry_after,
            },
            CoordinationError::ConflictDetection(m) => CoordinationError::ConflictDetection(m.clone()),
            CoordinationError::ConflictResolution(m) => CoordinationError::ConflictResolution(m.clone()),
            CoordinationError::Merge(m) => CoordinationError::Merge(m.clone()),
            CoordinationError::EventLoopCritical { correlation_id } => CoordinationError::EventLoopCritical {
                correlation_id: *correlation_id,
            },
            CoordinationError::QueueFull(p) => CoordinationError::QueueFull(p.clone()),
            CoordinationError::Config(m) => CoordinationError::Config(m.clone()),
            CoordinationError::StatePoisoned(what) => CoordinationError::StatePoisoned(*what),
            CoordinationError::ShuttingDown => CoordinationError::ShuttingDown,
            CoordinationError::Io(e) => CoordinationError::Io(std::io::Error::new(e.kind(), e.to_string())),
            CoordinationError::Serialization(e) => CoordinationError::InvalidOperation(e.to_string()),
        }
    }
}

/// Reason a lock request was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Lock on {document_path} held by {holder} (lock {lock_id}), expires in {retry_after:?}")]
pub struct LockDenied {
    pub document_path: String,
    pub lock_id: Uuid,
    pub holder: SourceId,
    pub retry_after: Duration,
}

impl From<LockDenied> for CoordinationError {
    fn from(denied: LockDenied) -> Self {
        CoordinationError::LockAcquisition {
            document_path: denied.document_path,
            holder: denied.holder,
            retry_after: denied.retry_after,
        }
    }
}

/// Errors from the per-document queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Queue for {document_path} is full ({limit} operations)")]
    QueueFull { document_path: String, limit: usize },

    #[error("Operation {0} is already queued")]
    Duplicate(Uuid),
}

impl From<SchedulerError> for CoordinationError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::QueueFull { document_path, .. } => {
                CoordinationError::QueueFull(document_path)
            }
            SchedulerError::Duplicate(id) => {
                CoordinationError::InvalidOperation(format!("operation {} is already queued", id))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
