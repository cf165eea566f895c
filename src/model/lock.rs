//! Document locks

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::operation::{OperationId, Priority, SourceId};

/// Unique identifier for a lock
pub type LockId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Exclusive,
    Shared,
    Coordination,
}

/// A live lock on one document path.
#[derive(Clone, Debug)]
pub struct DocumentLock {
    pub lock_id: LockId,
    pub document_path: String,
    pub operation_id: OperationId,
    pub source_id: SourceId,
    pub lock_type: LockType,
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Instant,
    pub can_be_preempted: bool,
}

impl DocumentLock {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before the lock force-expires.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
