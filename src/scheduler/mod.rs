//! Operation Scheduler
//!
//! One queue per document path, kept sorted by `(priority, timestamp)`.
//! Equal keys keep submission order. Operations consolidated within the
//! recent window are remembered per path so later passes can be checked
//! against them.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::lock::DocumentLockManager;
use crate::model::{EditOperation, OperationId, Priority, SourceId};

#[derive(Clone, Debug)]
struct QueueEntry {
    operation: EditOperation,
    enqueued_at: Instant,
}

/// Snapshot of one queued operation.
#[derive(Clone, Debug, Serialize)]
pub struct QueueStatus {
    pub operation_id: OperationId,
    pub source_id: SourceId,
    pub priority: Priority,
    pub position: usize,
    pub score: f64,
    pub waited_ms: u64,
}

/// One finished pass on a path.
#[derive(Clone, Debug)]
struct Consolidation {
    at: Instant,
    operations: Vec<EditOperation>,
}

pub struct OperationScheduler {
    config: SchedulerConfig,
    queues: HashMap<String, Vec<QueueEntry>>,
    recent: HashMap<String, VecDeque<Consolidation>>,
}

impl OperationScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queues: HashMap::new(),
            recent: HashMap::new(),
        }
    }

    pub fn set_config(&mut self, config: SchedulerConfig) {
        self.config = config;
    }

    /// Queue an operation and return its position in the document's queue.
    pub fn enqueue(&mut self, operation: EditOperation) -> Result<usize, SchedulerError> {
        let queue = self.queues.entry(operation.document_path.clone()).or_default();

        if queue.len() >= self.config.max_queue_size {
            return Err(SchedulerError::QueueFull {
                document_path: operation.document_path.clone(),
                limit: self.config.max_queue_size,
            });
        }
        if queue.iter().any(|e| e.operation.id == operation.id) {
            return Err(SchedulerError::Duplicate(operation.id));
        }

        let key = operation.schedule_key();
        let position = queue.partition_point(|e| e.operation.schedule_key() <= key);
        queue.insert(
            position,
            QueueEntry {
                operation,
                enqueued_at: Instant::now(),
            },
        );
        Ok(position)
    }

    /// Remove and return up to `max` operations from the head of a queue.
    pub fn drain_batch(&mut self, document_path: &str, max: usize) -> Vec<EditOperation> {
        let Some(queue) = self.queues.get_mut(document_path) else {
            return Vec::new();
        };
        let take = max.min(queue.len());
        let batch = queue.drain(..take).map(|e| e.operation).collect();
        if queue.is_empty() {
            self.queues.remove(document_path);
        }
        batch
    }

    /// Empty every queue, returning what was waiting.
    pub fn drain_all(&mut self) -> Vec<EditOperation> {
        self.queues
            .drain()
            .flat_map(|(_, queue)| queue.into_iter().map(|e| e.operation))
            .collect()
    }

    pub fn queue_len(&self, document_path: &str) -> usize {
        self.queues.get(document_path).map(Vec::len).unwrap_or(0)
    }

    /// Remember a finished pass and the operations it applied.
    pub fn record_consolidation(&mut self, document_path: &str, operations: &[EditOperation]) {
        let window = self.config.recent_consolidation_window;
        let passes = self.recent.entry(document_path.to_string()).or_default();
        passes.retain(|pass| pass.at.elapsed() < window);
        passes.push_back(Consolidation {
            at: Instant::now(),
            operations: operations.to_vec(),
        });
    }

    /// True when the path finished a consolidation inside the recent window.
    pub fn recently_consolidated(&self, document_path: &str) -> bool {
        self.recent
            .get(document_path)
            .and_then(|passes| passes.back())
            .map(|pass| pass.at.elapsed() < self.config.recent_consolidation_window)
            .unwrap_or(false)
    }

    /// Operations applied to the path inside the recent window, oldest first.
    pub fn settled_operations(&self, document_path: &str) -> Vec<EditOperation> {
        let window = self.config.recent_consolidation_window;
        self.recent
            .get(document_path)
            .map(|passes| {
                passes
                    .iter()
                    .filter(|pass| pass.at.elapsed() < window)
                    .flat_map(|pass| pass.operations.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget consolidations older than the recent window.
    pub fn prune_consolidations(&mut self) {
        let window = self.config.recent_consolidation_window;
        for passes in self.recent.values_mut() {
            passes.retain(|pass| pass.at.elapsed() < window);
        }
        self.recent.retain(|_, passes| !passes.is_empty());
    }

    /// Whether a submission from `source_id` must go through the queue.
    ///
    /// Coordination is needed when another source holds the document's
    /// lock, operations are already waiting, or the document was
    /// consolidated moments ago.
    pub fn requires_coordination(
        &self,
        document_path: &str,
        source_id: &str,
        locks: &DocumentLockManager,
    ) -> bool {
        locks.is_held_by_other(document_path, source_id)
            || self.queue_len(document_path) > 0
            || self.recently_consolidated(document_path)
    }

    /// Expected wait before a new operation on the path would be processed.
    pub fn estimate_wait_time(&self, document_path: &str, locks: &DocumentLockManager) -> Duration {
        if let Some(remaining) = locks.estimate_wait(document_path) {
            return remaining;
        }
        self.queues
            .get(document_path)
            .map(|q| {
                q.iter()
                    .map(|e| e.operation.metadata.estimated_processing_time())
                    .sum()
            })
            .unwrap_or_default()
    }

    /// Weighted urgency of an operation that has waited `waited`.
    pub fn priority_score(&self, operation: &EditOperation, waited: Duration) -> f64 {
        let weights = &self.config.weights;
        let priority = 1.0 - f64::from(operation.priority.ordinal()) / f64::from(Priority::Background.ordinal());
        let horizon = weights.age_horizon.as_secs_f64();
        let age = if horizon > 0.0 {
            (waited.as_secs_f64() / horizon).min(1.0)
        } else {
            1.0
        };
        let user = if operation.metadata.user_initiated { 1.0 } else { 0.0 };
        weights.priority * priority + weights.age * age + weights.user_initiated * user
    }

    pub fn queue_status(&self, document_path: &str) -> Vec<QueueStatus> {
        let Some(queue) = self.queues.get(document_path) else {
            return Vec::new();
        };
        queue
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                let waited = entry.enqueued_at.elapsed();
                QueueStatus {
                    operation_id: entry.operation.id,
                    source_id: entry.operation.source_id.clone(),
                    priority: entry.operation.priority,
                    position,
                    score: self.priority_score(&entry.operation, waited),
                    waited_ms: waited.as_millis() as u64,
                }
            })
            .collect()
    }
}
