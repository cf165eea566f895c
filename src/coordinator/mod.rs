//! Consolidation Orchestrator
//!
//! Entry point for components submitting edits. Wires the lock manager,
//! scheduler, detector, resolver and loop guard into one pipeline:
//!
//! ```text
//! submit ─┬─ no coordination needed ──────────────┐
//!         └─ queue ─ drain batch ─ lock ─ detect ─ resolve ─ assemble ─ unlock
//!                                                                  │
//!                         outcome to every waiter <────────────────┘
//! ```
//!
//! Passes for one document are serialized by a per-path gate. Different
//! documents proceed independently. A pass is also checked against the
//! operations applied on the same path inside the recent window; those
//! settled operations always keep their changes.

pub mod assembly;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::config::{CoordinatorConfig, LockConfig};
use crate::detect::{ConflictAnalyzer, ConflictDetector, DetectionStats, RuleBasedAnalyzer};
use crate::error::{CoordinationError, Result};
use crate::events::{ConsolidationEvent, EventBus, EventPayload};
use crate::guard::{GuardStats, LoopDecision, LoopGuard};
use crate::lock::{DocumentLockManager, LockGrant};
use crate::model::{
    ChangeConflict, ConflictType, EditOperation, MergedChange, OperationId, Priority, ResolutionOutcome,
    SourceId,
};
use crate::resolve::ConflictResolver;
use crate::scheduler::{OperationScheduler, QueueStatus};

use self::assembly::assemble;

/// Resolved conflicts kept for auditing.
const CONFLICT_HISTORY_LIMIT: usize = 256;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What a submitter gets back: the change set for its document, ready to
/// apply in order.
#[derive(Clone, Debug, Serialize)]
pub struct ConsolidationOutcome {
    pub document_path: String,
    /// Operations consolidated in this pass, in priority order.
    pub resolved_order: Vec<OperationId>,
    pub changes: Vec<MergedChange>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub requires_user_review: bool,
    pub confidence: f64,
    pub conflicts: Vec<ChangeConflict>,
    /// Operations pushed to a later pass.
    pub deferred_operations: Vec<OperationId>,
    /// False when the operation bypassed the queue.
    pub coordinated: bool,
}

type Responder = oneshot::Sender<Result<ConsolidationOutcome>>;

/// Publishes the events of one pass as a single chain.
struct PassEvents<'a> {
    bus: &'a EventBus,
    document_path: &'a str,
    source_id: SourceId,
    correlation_id: Uuid,
    parent: Option<Uuid>,
}

impl PassEvents<'_> {
    fn emit(&mut self, payload: EventPayload) {
        let event = ConsolidationEvent::new(self.document_path, self.source_id.clone(), payload)
            .correlated(self.correlation_id, self.parent);
        let id = event.id;
        if let Err(e) = self.bus.publish(event) {
            log::error!("Event for {} not delivered: {}", self.document_path, e);
        }
        self.parent = Some(id);
    }
}

pub struct ConsolidationCoordinator {
    config: Mutex<CoordinatorConfig>,
    config_dirty: AtomicBool,
    locks: Mutex<DocumentLockManager>,
    scheduler: Mutex<OperationScheduler>,
    detector: tokio::sync::Mutex<ConflictDetector>,
    resolver: Mutex<ConflictResolver>,
    guard: Arc<Mutex<LoopGuard>>,
    events: EventBus,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    waiters: Mutex<HashMap<OperationId, Responder>>,
    active: Mutex<HashMap<String, Vec<ChangeConflict>>>,
    history: Mutex<VecDeque<ChangeConflict>>,
    shutting_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

fn acquire<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| CoordinationError::StatePoisoned(what))
}

impl ConsolidationCoordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        Self::with_analyzer(config, Arc::new(RuleBasedAnalyzer))
    }

    /// Build a coordinator with a custom conflict analyzer.
    pub fn with_analyzer(config: CoordinatorConfig, analyzer: Arc<dyn ConflictAnalyzer>) -> Arc<Self> {
        let guard = Arc::new(Mutex::new(LoopGuard::new(config.loop_guard.clone())));
        let events = EventBus::new(EVENT_CHANNEL_CAPACITY, Arc::clone(&guard));
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            locks: Mutex::new(DocumentLockManager::new(config.lock.clone())),
            scheduler: Mutex::new(OperationScheduler::new(config.scheduler.clone())),
            detector: tokio::sync::Mutex::new(ConflictDetector::with_analyzer(config.detection.clone(), analyzer)),
            resolver: Mutex::new(ConflictResolver::new(config.merge.clone())),
            guard,
            events,
            gates: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            config: Mutex::new(config),
            config_dirty: AtomicBool::new(false),
        })
    }

    /// Spawn the periodic sweep of expired locks and loop guard state.
    pub fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self
            .config()
            .map(|c| c.loop_guard.sweep_interval)
            .unwrap_or(Duration::from_secs(5));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.sweep() {
                            log::error!("Sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            log::debug!("Sweep task stopped");
        });
    }

    /// Stop the sweep task and fail every queued submission.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let drained = match acquire(&self.scheduler, "scheduler") {
            Ok(mut scheduler) => scheduler.drain_all(),
            Err(e) => {
                log::error!("Could not drain queues on shutdown: {}", e);
                Vec::new()
            }
        };
        for op in &drained {
            self.respond(op.id, Err(CoordinationError::ShuttingDown));
        }
        log::info!("Coordinator shut down, {} queued operations cancelled", drained.len());
    }

    /// One round of housekeeping: expired locks, guard history, consolidation marks.
    pub fn sweep(&self) -> Result<()> {
        let expired = acquire(&self.locks, "lock manager")?.sweep_expired();
        acquire(&self.guard, "loop guard")?.sweep();
        acquire(&self.scheduler, "scheduler")?.prune_consolidations();
        if !expired.is_empty() {
            log::debug!("Sweep released {} expired locks", expired.len());
        }
        Ok(())
    }

    /// Submit an operation and wait for the consolidated change set of its
    /// document.
    pub async fn submit(self: &Arc<Self>, operation: EditOperation) -> Result<ConsolidationOutcome> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CoordinationError::ShuttingDown);
        }
        operation.validate().map_err(CoordinationError::InvalidOperation)?;

        let path = operation.document_path.clone();

        // Decided under the gate so concurrent submitters cannot both go direct.
        let gate = self.gate_for(&path)?;
        if let Ok(pass) = gate.try_lock_owned() {
            let coordinate = {
                let locks = acquire(&self.locks, "lock manager")?;
                let scheduler = acquire(&self.scheduler, "scheduler")?;
                scheduler.requires_coordination(&path, &operation.source_id, &locks)
            };
            if !coordinate {
                log::debug!("Operation {} on {} needs no coordination", operation.id, path);
                let outcome = self.consolidate(&path, vec![operation], false).await;
                drop(pass);
                return outcome;
            }
        }

        let (tx, rx) = oneshot::channel();
        acquire(&self.waiters, "waiters")?.insert(operation.id, tx);

        let position = {
            let enqueued = acquire(&self.scheduler, "scheduler")?.enqueue(operation.clone());
            match enqueued {
                Ok(position) => position,
                Err(e) => {
                    acquire(&self.waiters, "waiters")?.remove(&operation.id);
                    return Err(e.into());
                }
            }
        };
        log::debug!("Queued operation {} on {} at position {}", operation.id, path, position);
        self.announce_queued(&operation, position);

        self.spawn_pass(path);
        rx.await.map_err(|_| CoordinationError::ShuttingDown)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsolidationEvent> {
        self.events.subscribe()
    }

    /// Publish an event on behalf of a collaborator. The loop guard applies.
    pub fn publish(&self, event: ConsolidationEvent) -> Result<LoopDecision> {
        self.events.publish(event)
    }

    /// Replace the configuration. Takes effect at the next processing pass.
    pub fn update_config(&self, config: CoordinatorConfig) -> Result<()> {
        config.validate()?;
        *acquire(&self.config, "config")? = config;
        self.config_dirty.store(true, Ordering::SeqCst);
        log::info!("Configuration updated");
        Ok(())
    }

    pub fn config(&self) -> Result<CoordinatorConfig> {
        Ok(acquire(&self.config, "config")?.clone())
    }

    pub fn estimate_wait_time(&self, document_path: &str) -> Result<Duration> {
        let locks = acquire(&self.locks, "lock manager")?;
        let scheduler = acquire(&self.scheduler, "scheduler")?;
        Ok(scheduler.estimate_wait_time(document_path, &locks))
    }

    pub fn queue_status(&self, document_path: &str) -> Result<Vec<QueueStatus>> {
        Ok(acquire(&self.scheduler, "scheduler")?.queue_status(document_path))
    }

    /// Conflicts detected by passes still in progress.
    pub fn active_conflicts(&self) -> Result<Vec<ChangeConflict>> {
        Ok(acquire(&self.active, "active conflicts")?
            .values()
            .flatten()
            .cloned()
            .collect())
    }

    /// Most recent resolved conflicts, oldest first.
    pub fn conflict_history(&self) -> Result<Vec<ChangeConflict>> {
        Ok(acquire(&self.history, "conflict history")?.iter().cloned().collect())
    }

    /// The lock manager, for collaborators that hold documents manually.
    pub fn lock_manager(&self) -> &Mutex<DocumentLockManager> {
        &self.locks
    }

    pub fn guard_stats(&self) -> Result<GuardStats> {
        Ok(acquire(&self.guard, "loop guard")?.stats())
    }

    pub async fn detection_stats(&self) -> DetectionStats {
        self.detector.lock().await.stats().clone()
    }

    fn gate_for(&self, path: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut gates = acquire(&self.gates, "gates")?;
        Ok(Arc::clone(gates.entry(path.to_string()).or_default()))
    }

    fn announce_queued(&self, operation: &EditOperation, position: usize) {
        let event = ConsolidationEvent::new(
            operation.document_path.clone(),
            operation.source_id.clone(),
            EventPayload::OperationQueued {
                operation_id: operation.id,
                priority: operation.priority,
                position,
            },
        );
        let event = match operation.metadata.correlation_id {
            Some(correlation) => event.correlated(correlation, None),
            None => event,
        };
        if let Err(e) = self.events.publish(event) {
            log::error!("Queue event for {} not delivered: {}", operation.document_path, e);
        }
    }

    fn spawn_pass(self: &Arc<Self>, path: String) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.process_document(&path).await {
                log::error!("Processing {} failed: {}", path, e);
            }
        });
    }

    /// Drain and consolidate the document's queue until it is empty.
    async fn process_document(self: &Arc<Self>, path: &str) -> Result<()> {
        let gate = self.gate_for(path)?;
        let _pass = gate.lock().await;

        loop {
            self.apply_pending_config().await?;
            let max_batch = acquire(&self.config, "config")?.scheduler.max_batch_size;
            let batch = acquire(&self.scheduler, "scheduler")?.drain_batch(path, max_batch);
            if batch.is_empty() {
                return Ok(());
            }

            let ids: Vec<OperationId> = batch.iter().map(|op| op.id).collect();
            match self.consolidate(path, batch.clone(), true).await {
                Ok(outcome) => {
                    for id in ids.iter().filter(|id| !outcome.deferred_operations.contains(id)) {
                        self.respond(*id, Ok(outcome.clone()));
                    }
                    let deferred: Vec<EditOperation> = batch
                        .into_iter()
                        .filter(|op| outcome.deferred_operations.contains(&op.id))
                        .collect();
                    if !deferred.is_empty() {
                        self.spawn_resubmission(path.to_string(), deferred)?;
                    }
                }
                Err(e) => {
                    for id in ids {
                        self.respond(id, Err(e.replicate()));
                    }
                }
            }
        }
    }

    /// Put deferred operations back in the queue after the defer delay.
    /// Their submitters keep waiting.
    fn spawn_resubmission(self: &Arc<Self>, path: String, operations: Vec<EditOperation>) -> Result<()> {
        let delay = acquire(&self.config, "config")?.scheduler.defer_delay;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if coordinator.shutting_down.load(Ordering::SeqCst) {
                for op in &operations {
                    coordinator.respond(op.id, Err(CoordinationError::ShuttingDown));
                }
                return;
            }
            for op in operations {
                let enqueued = acquire(&coordinator.scheduler, "scheduler")
                    .and_then(|mut scheduler| scheduler.enqueue(op.clone()).map_err(CoordinationError::from));
                match enqueued {
                    Ok(position) => {
                        log::debug!("Resubmitted deferred operation {}", op.id);
                        coordinator.announce_queued(&op, position);
                    }
                    Err(e) => coordinator.respond(op.id, Err(e)),
                }
            }
            if let Err(e) = coordinator.process_document(&path).await {
                log::error!("Processing {} failed: {}", path, e);
            }
        });
        Ok(())
    }

    fn respond(&self, operation_id: OperationId, result: Result<ConsolidationOutcome>) {
        let responder = match acquire(&self.waiters, "waiters") {
            Ok(mut waiters) => waiters.remove(&operation_id),
            Err(e) => {
                log::error!("Cannot reach submitter of {}: {}", operation_id, e);
                None
            }
        };
        if let Some(tx) = responder {
            // The submitter may have stopped waiting.
            let _ = tx.send(result);
        }
    }

    async fn apply_pending_config(&self) -> Result<()> {
        if !self.config_dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let config = self.config()?;
        acquire(&self.locks, "lock manager")?.set_config(config.lock.clone());
        acquire(&self.scheduler, "scheduler")?.set_config(config.scheduler.clone());
        acquire(&self.resolver, "resolver")?.set_merge_config(config.merge.clone());
        acquire(&self.guard, "loop guard")?.set_config(config.loop_guard.clone());
        self.detector.lock().await.set_config(config.detection);
        log::debug!("Applied updated configuration");
        Ok(())
    }

    async fn acquire_document_lock(&self, path: &str, lead: &EditOperation, config: &LockConfig) -> Result<LockGrant> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let denied = match acquire(&self.locks, "lock manager")?.acquire(path, lead) {
                Ok(grant) => return Ok(grant),
                Err(denied) => denied,
            };
            if attempt >= config.max_acquire_attempts {
                let wait = self.estimate_wait_time(path)?;
                log::warn!(
                    "Giving up on lock for {} after {} attempts, held by {}",
                    path,
                    attempt,
                    denied.holder
                );
                return Err(CoordinationError::LockAcquisition {
                    document_path: path.to_string(),
                    holder: denied.holder,
                    retry_after: wait.max(denied.retry_after),
                });
            }
            log::debug!("Lock on {} held by {}, retrying", path, denied.holder);
            tokio::time::sleep(config.acquire_retry_interval).await;
        }
    }

    /// One processing pass over a priority-sorted batch.
    async fn consolidate(
        &self,
        path: &str,
        batch: Vec<EditOperation>,
        coordinated: bool,
    ) -> Result<ConsolidationOutcome> {
        let lead = batch
            .first()
            .ok_or_else(|| CoordinationError::InvalidOperation("empty batch".into()))?;
        let operation_ids: Vec<OperationId> = batch.iter().map(|op| op.id).collect();
        let mut events = PassEvents {
            bus: &self.events,
            document_path: path,
            source_id: lead.source_id.clone(),
            correlation_id: lead.metadata.correlation_id.unwrap_or_else(Uuid::new_v4),
            parent: None,
        };

        let lock_config = acquire(&self.config, "config")?.lock.clone();
        let grant = match self.acquire_document_lock(path, lead, &lock_config).await {
            Ok(grant) => grant,
            Err(e) => {
                events.emit(EventPayload::ConsolidationFailed {
                    operation_ids,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        if let Some(preempted) = &grant.preempted {
            log::warn!(
                "Operation {} preempted lock of {} on {}",
                lead.id,
                preempted.source_id,
                path
            );
        }
        events.emit(EventPayload::DocumentLocked {
            lock_id: grant.lock_id(),
            operation_id: lead.id,
        });

        let result = self.run_pass(path, &batch, coordinated, &mut events).await;

        // A renewed lock belongs to a collaborator holding the document.
        if !grant.renewed {
            acquire(&self.locks, "lock manager")?.release(grant.lock_id());
            events.emit(EventPayload::DocumentUnlocked {
                lock_id: grant.lock_id(),
            });
        }

        match &result {
            Ok(outcome) => {
                let applied: Vec<EditOperation> = batch
                    .iter()
                    .filter(|op| !outcome.deferred_operations.contains(&op.id))
                    .cloned()
                    .collect();
                acquire(&self.scheduler, "scheduler")?.record_consolidation(path, &applied);
                events.emit(EventPayload::ConsolidationComplete {
                    operation_ids: outcome.resolved_order.clone(),
                    change_count: outcome.changes.len(),
                    requires_user_review: outcome.requires_user_review,
                    coordinated,
                });
                log::info!(
                    "Consolidated {} operations on {} into {} changes (confidence {:.2}, {} conflicts)",
                    outcome.resolved_order.len(),
                    path,
                    outcome.changes.len(),
                    outcome.confidence,
                    outcome.conflicts.len()
                );
            }
            Err(e) => {
                events.emit(EventPayload::ConsolidationFailed {
                    operation_ids,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    /// Detect, resolve and assemble while the document is locked.
    async fn run_pass(
        &self,
        path: &str,
        batch: &[EditOperation],
        coordinated: bool,
        events: &mut PassEvents<'_>,
    ) -> Result<ConsolidationOutcome> {
        let batch_ids: HashSet<OperationId> = batch.iter().map(|op| op.id).collect();
        let settled: Vec<EditOperation> = acquire(&self.scheduler, "scheduler")?
            .settled_operations(path)
            .into_iter()
            .filter(|op| !batch_ids.contains(&op.id))
            .collect();

        let (mut conflicts, failed_open) = {
            let mut detector = self.detector.lock().await;
            let report = detector.detect(batch).await;
            let mut conflicts = report.conflicts;
            let mut failed_open = report.failed_open;

            if !settled.is_empty() {
                let mut combined: Vec<EditOperation> = settled.iter().chain(batch).cloned().collect();
                combined.sort_by_key(|op| op.schedule_key());
                let against_settled = detector.detect(&combined).await;
                // Only conflicts between this batch and earlier passes; the
                // settled operations no longer compete for the document.
                conflicts.extend(against_settled.conflicts.into_iter().filter(|c| {
                    c.conflict_type != ConflictType::ResourceContention
                        && c.operations.iter().any(|id| batch_ids.contains(id))
                        && c.operations.iter().any(|id| !batch_ids.contains(id))
                }));
                failed_open = failed_open.or(against_settled.failed_open);
            }
            (conflicts, failed_open)
        };

        if !conflicts.is_empty() {
            acquire(&self.active, "active conflicts")?.insert(path.to_string(), conflicts.clone());
            events.emit(EventPayload::ConflictDetected {
                conflicts: conflicts.clone(),
            });
        }

        // Settled changes are already applied, so they outrank the batch.
        let mut candidates: Vec<EditOperation> = batch.to_vec();
        candidates.extend(settled.iter().cloned().map(|mut op| {
            op.priority = Priority::Critical;
            op.metadata.can_defer = false;
            op
        }));
        let results = {
            let resolver = acquire(&self.resolver, "resolver")?;
            conflicts
                .iter_mut()
                .map(|conflict| resolver.resolve(conflict, &candidates))
                .collect::<Vec<_>>()
        };
        acquire(&self.active, "active conflicts")?.remove(path);

        if !conflicts.is_empty() {
            events.emit(EventPayload::ConflictResolved {
                conflict_ids: conflicts.iter().map(|c| c.id).collect(),
                strategies: results.iter().map(|r| r.strategy).collect(),
                requires_user_review: results.iter().any(|r| r.requires_user_review),
            });
            let mut history = acquire(&self.history, "conflict history")?;
            for conflict in &conflicts {
                if history.len() >= CONFLICT_HISTORY_LIMIT {
                    history.pop_front();
                }
                history.push_back(conflict.clone());
            }
        }

        let mut assembled = assemble(batch, &settled, &results);
        if let Some(reason) = failed_open {
            assembled
                .warnings
                .push(format!("conflict detection unavailable, changes passed through: {}", reason));
        }
        if conflicts
            .iter()
            .filter_map(|c| c.resolution.as_ref())
            .any(|r| r.outcome == ResolutionOutcome::FellBack)
        {
            assembled.requires_user_review = true;
        }

        if assembled.merged > 0 {
            events.emit(EventPayload::ChangesMerged {
                operation_ids: batch.iter().map(|op| op.id).collect(),
                change_count: assembled.changes.len(),
                confidence: assembled.confidence,
            });
        }

        Ok(ConsolidationOutcome {
            document_path: path.to_string(),
            resolved_order: batch
                .iter()
                .map(|op| op.id)
                .filter(|id| !assembled.deferred.contains(id))
                .collect(),
            changes: assembled.changes,
            warnings: assembled.warnings,
            errors: assembled.errors,
            requires_user_review: assembled.requires_user_review,
            confidence: assembled.confidence,
            conflicts,
            deferred_operations: assembled.deferred,
            coordinated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConflictType, EditChange, OperationMetadata, Priority};

    fn op(source: &str, priority: Priority, changes: Vec<EditChange>) -> EditOperation {
        EditOperation::new(source, "doc.md", priority, changes)
    }

    #[tokio::test]
    async fn test_uncontended_submission_bypasses_queue() {
        let coordinator = ConsolidationCoordinator::new(CoordinatorConfig::default());
        let operation = op("editor", Priority::High, vec![EditChange::insert(0, "hi")]);

        let outcome = coordinator.submit(operation.clone()).await.unwrap();
        assert!(!outcome.coordinated);
        assert_eq!(outcome.resolved_order, vec![operation.id]);
        assert_eq!(outcome.changes.len(), 1);
        assert!(!coordinator.lock_manager().lock().unwrap().is_locked("doc.md"));
    }

    #[tokio::test]
    async fn test_invalid_operation_is_rejected() {
        let coordinator = ConsolidationCoordinator::new(CoordinatorConfig::default());
        let empty = op("editor", Priority::High, Vec::new());
        assert!(matches!(
            coordinator.submit(empty).await,
            Err(CoordinationError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_document_queues_and_resolves_overlap() {
        let coordinator = ConsolidationCoordinator::new(CoordinatorConfig::default());

        // Hold the path gate so both submissions land in one batch.
        let gate = coordinator.gate_for("doc.md").unwrap();
        let held = gate.lock().await;

        let a = op("editor", Priority::High, vec![EditChange::replace(10, 20, "bar").with_removed_text("foo")]);
        let b = op("ai", Priority::Medium, vec![EditChange::insert(15, "baz")]);

        let first = tokio::spawn({
            let c = Arc::clone(&coordinator);
            let a = a.clone();
            async move { c.submit(a).await }
        });
        let second = tokio::spawn({
            let c = Arc::clone(&coordinator);
            let b = b.clone();
            async move { c.submit(b).await }
        });

        while coordinator.queue_status("doc.md").unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }
        drop(held);

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(first.coordinated && second.coordinated);
        assert_eq!(first.resolved_order, vec![a.id, b.id]);
        assert_eq!(second.resolved_order, first.resolved_order);

        assert!(first
            .conflicts
            .iter()
            .any(|c| c.conflict_type == ConflictType::OverlappingEdits && c.is_resolved()));
        let kept = first
            .changes
            .iter()
            .find(|m| m.id() == a.changes[0].id)
            .expect("A's change is kept");
        assert_eq!(kept.change, a.changes[0]);
        let b_kept = first.changes.iter().any(|m| m.id() == b.changes[0].id);
        let b_warned = first.warnings.iter().any(|w| w.contains(&b.changes[0].id.to_string()));
        assert!(b_kept || b_warned);
    }

    #[tokio::test]
    async fn test_pass_is_checked_against_recently_applied_operations() {
        let coordinator = ConsolidationCoordinator::new(CoordinatorConfig::default());
        let a = op("editor", Priority::High, vec![EditChange::replace(10, 20, "bar").with_removed_text("foo")]);
        let b = op("ai", Priority::Medium, vec![EditChange::insert(15, "baz")]);

        let first = coordinator.submit(a.clone()).await.unwrap();
        assert!(!first.coordinated);

        let second = coordinator.submit(b.clone()).await.unwrap();
        assert!(second.coordinated);
        let overlap = second
            .conflicts
            .iter()
            .find(|c| c.conflict_type == ConflictType::OverlappingEdits)
            .expect("overlap with the earlier pass");
        assert!(overlap.involves(&a.id) && overlap.involves(&b.id));
        assert!(second.changes.iter().all(|m| m.id() != a.changes[0].id));
        assert!(second.requires_user_review);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_denied_after_retries() {
        let mut config = CoordinatorConfig::default();
        config.lock.max_acquire_attempts = 2;
        let coordinator = ConsolidationCoordinator::new(config);

        let holder = op("indexer", Priority::Critical, vec![EditChange::insert(0, "x")]).with_metadata(
            OperationMetadata {
                estimated_processing_ms: 60_000,
                user_initiated: true,
                ..Default::default()
            },
        );
        coordinator.lock_manager().lock().unwrap().acquire("doc.md", &holder).unwrap();

        let result = coordinator
            .submit(op("ai", Priority::Low, vec![EditChange::insert(3, "y")]))
            .await;
        match result {
            Err(CoordinationError::LockAcquisition { holder, retry_after, .. }) => {
                assert_eq!(holder, "indexer");
                assert!(retry_after > Duration::from_secs(30));
            }
            other => panic!("expected lock failure, got {:?}", other.map(|o| o.document_path)),
        }
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let coordinator = ConsolidationCoordinator::new(CoordinatorConfig::default());
        let mut bad = CoordinatorConfig::default();
        bad.scheduler.max_batch_size = 0;
        assert!(coordinator.update_config(bad).is_err());

        let mut good = CoordinatorConfig::default();
        good.detection.overlap_tolerance = 9;
        coordinator.update_config(good.clone()).unwrap();
        assert_eq!(coordinator.config().unwrap(), good);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let coordinator = ConsolidationCoordinator::new(CoordinatorConfig::default());
        coordinator.start();
        coordinator.shutdown();
        let result = coordinator
            .submit(op("editor", Priority::High, vec![EditChange::insert(0, "a")]))
            .await;
        assert!(matches!(result, Err(CoordinationError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_events_are_published_for_a_pass() {
        let coordinator = ConsolidationCoordinator::new(CoordinatorConfig::default());
        let mut rx = coordinator.subscribe();

        coordinator
            .submit(op("editor", Priority::High, vec![EditChange::insert(0, "a")]))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type());
        }
        assert_eq!(
            kinds,
            vec!["document_locked", "document_unlocked", "consolidation_complete"]
        );
    }
}
