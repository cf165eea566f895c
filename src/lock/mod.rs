//! Document Lock Manager
//!
//! Exclusive, preemptible, self-expiring locks keyed by document path.
//! At most one live lock exists per path; an expired lock is treated as
//! absent and is reaped by `sweep_expired` or by the next acquisition.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::LockDenied;
use crate::model::{DocumentLock, EditOperation, LockId, LockType, Priority};

/// A granted lock, plus the lock it displaced if any.
#[derive(Clone, Debug)]
pub struct LockGrant {
    pub lock: DocumentLock,
    /// Lock released because the requester out-prioritised it.
    pub preempted: Option<DocumentLock>,
    /// The requester's source already held the document. The lock keeps its
    /// id and stays with that holder.
    pub renewed: bool,
}

impl LockGrant {
    pub fn lock_id(&self) -> LockId {
        self.lock.lock_id
    }
}

pub struct DocumentLockManager {
    config: LockConfig,
    /// document path -> lock
    locks: HashMap<String, DocumentLock>,
    /// lock id -> document path
    by_id: HashMap<LockId, String>,
}

impl DocumentLockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            locks: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn set_config(&mut self, config: LockConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire an exclusive lock on `document_path` for `operation`.
    pub fn acquire(&mut self, document_path: &str, operation: &EditOperation) -> Result<LockGrant, LockDenied> {
        self.acquire_with_type(document_path, operation, LockType::Exclusive)
    }

    /// Acquire a lock of the given type. Whatever the type, a path carries
    /// at most one live lock.
    pub fn acquire_with_type(
        &mut self,
        document_path: &str,
        operation: &EditOperation,
        lock_type: LockType,
    ) -> Result<LockGrant, LockDenied> {
        let now = Instant::now();
        let expires_at = now + operation.metadata.estimated_processing_time() + self.config.expiry_buffer;

        let mut preempted = None;

        if let Some(existing) = self.locks.get_mut(document_path) {
            if existing.is_expired_at(now) {
                let lock_id = existing.lock_id;
                log::debug!("Reaping expired lock {} on {}", lock_id, document_path);
                self.remove(lock_id);
            } else if existing.source_id == operation.source_id {
                existing.expires_at = existing.expires_at.max(expires_at);
                log::debug!("Lock {} on {} renewed by {}", existing.lock_id, document_path, existing.source_id);
                return Ok(LockGrant {
                    lock: existing.clone(),
                    preempted: None,
                    renewed: true,
                });
            } else if !existing.can_be_preempted || operation.priority >= existing.priority {
                return Err(LockDenied {
                    document_path: document_path.to_string(),
                    lock_id: existing.lock_id,
                    holder: existing.source_id.clone(),
                    retry_after: existing.remaining_at(now),
                });
            } else {
                let lock_id = existing.lock_id;
                log::info!(
                    "Operation {} ({:?}) preempts lock {} held by {} on {}",
                    operation.id,
                    operation.priority,
                    lock_id,
                    existing.source_id,
                    document_path
                );
                preempted = self.remove(lock_id);
            }
        }

        let lock = DocumentLock {
            lock_id: Uuid::new_v4(),
            document_path: document_path.to_string(),
            operation_id: operation.id,
            source_id: operation.source_id.clone(),
            lock_type,
            priority: operation.priority,
            acquired_at: Utc::now(),
            expires_at,
            can_be_preempted: Self::preemptible(operation),
        };

        self.by_id.insert(lock.lock_id, document_path.to_string());
        self.locks.insert(document_path.to_string(), lock.clone());

        Ok(LockGrant {
            lock,
            preempted,
            renewed: false,
        })
    }

    /// Locks of user-initiated or high-priority work are never preempted.
    fn preemptible(operation: &EditOperation) -> bool {
        operation.priority >= Priority::Medium && !operation.metadata.user_initiated
    }

    /// Release a lock. Unknown or already-released ids are a no-op.
    pub fn release(&mut self, lock_id: LockId) -> Option<DocumentLock> {
        self.remove(lock_id)
    }

    fn remove(&mut self, lock_id: LockId) -> Option<DocumentLock> {
        let path = self.by_id.remove(&lock_id)?;
        match self.locks.get(&path) {
            Some(lock) if lock.lock_id == lock_id => self.locks.remove(&path),
            _ => None,
        }
    }

    /// Force-release every lock past its expiry.
    pub fn sweep_expired(&mut self) -> Vec<DocumentLock> {
        let now = Instant::now();
        let expired: Vec<LockId> = self
            .locks
            .values()
            .filter(|lock| lock.is_expired_at(now))
            .map(|lock| lock.lock_id)
            .collect();

        let mut released = Vec::with_capacity(expired.len());
        for lock_id in expired {
            if let Some(lock) = self.remove(lock_id) {
                log::warn!(
                    "Lock {} on {} held by {} expired without release",
                    lock.lock_id,
                    lock.document_path,
                    lock.source_id
                );
                released.push(lock);
            }
        }
        released
    }

    /// The live lock on a path, if any.
    pub fn lock_for(&self, document_path: &str) -> Option<&DocumentLock> {
        let now = Instant::now();
        self.locks
            .get(document_path)
            .filter(|lock| !lock.is_expired_at(now))
    }

    pub fn is_locked(&self, document_path: &str) -> bool {
        self.lock_for(document_path).is_some()
    }

    /// True when a live lock on the path belongs to another source.
    pub fn is_held_by_other(&self, document_path: &str, source_id: &str) -> bool {
        self.lock_for(document_path)
            .map(|lock| lock.source_id != source_id)
            .unwrap_or(false)
    }

    /// Time until the current lock on a path force-expires.
    pub fn estimate_wait(&self, document_path: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock_for(document_path).map(|lock| lock.remaining_at(now))
    }

    pub fn active_locks(&self) -> Vec<DocumentLock> {
        let now = Instant::now();
        self.locks
            .values()
            .filter(|lock| !lock.is_expired_at(now))
            .cloned()
            .collect()
    }
}
