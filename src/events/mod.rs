//! Consolidation events and the guarded event bus
//!
//! Events travel on a single broadcast channel. Nothing reaches it without
//! passing the [`LoopGuard`] first.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::CoordinationError;
use crate::guard::{LoopDecision, LoopGuard, PreventionAction};
use crate::model::{
    ChangeConflict, ConflictId, LockId, OperationId, Priority, ResolutionStrategy, SourceId,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    OperationQueued {
        operation_id: OperationId,
        priority: Priority,
        position: usize,
    },
    ConflictDetected {
        conflicts: Vec<ChangeConflict>,
    },
    ConflictResolved {
        conflict_ids: Vec<ConflictId>,
        strategies: Vec<ResolutionStrategy>,
        requires_user_review: bool,
    },
    ChangesMerged {
        operation_ids: Vec<OperationId>,
        change_count: usize,
        confidence: f64,
    },
    DocumentLocked {
        lock_id: LockId,
        operation_id: OperationId,
    },
    DocumentUnlocked {
        lock_id: LockId,
    },
    ConsolidationComplete {
        operation_ids: Vec<OperationId>,
        change_count: usize,
        requires_user_review: bool,
        coordinated: bool,
    },
    ConsolidationFailed {
        operation_ids: Vec<OperationId>,
        error: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationEvent {
    pub id: Uuid,
    pub document_path: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: SourceId,
    /// Filled in by the bus when absent.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub parent_event_id: Option<Uuid>,
    pub payload: EventPayload,
}

impl ConsolidationEvent {
    pub fn new(document_path: impl Into<String>, source_id: impl Into<SourceId>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_path: document_path.into(),
            timestamp: Utc::now(),
            source_id: source_id.into(),
            correlation_id: None,
            parent_event_id: None,
            payload,
        }
    }

    pub fn correlated(mut self, correlation_id: Uuid, parent_event_id: Option<Uuid>) -> Self {
        self.correlation_id = Some(correlation_id);
        self.parent_event_id = parent_event_id;
        self
    }

    /// Event type name as used by the loop guard.
    pub fn event_type(&self) -> &'static str {
        match self.payload {
            EventPayload::OperationQueued { .. } => "operation_queued",
            EventPayload::ConflictDetected { .. } => "conflict_detected",
            EventPayload::ConflictResolved { .. } => "conflict_resolved",
            EventPayload::ChangesMerged { .. } => "changes_merged",
            EventPayload::DocumentLocked { .. } => "document_locked",
            EventPayload::DocumentUnlocked { .. } => "document_unlocked",
            EventPayload::ConsolidationComplete { .. } => "consolidation_complete",
            EventPayload::ConsolidationFailed { .. } => "consolidation_failed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConsolidationEvent>,
    guard: Arc<Mutex<LoopGuard>>,
}

impl EventBus {
    pub fn new(capacity: usize, guard: Arc<Mutex<LoopGuard>>) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, guard }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsolidationEvent> {
        self.sender.subscribe()
    }

    pub fn guard(&self) -> &Arc<Mutex<LoopGuard>> {
        &self.guard
    }

    /// Check `event` with the loop guard and deliver it if allowed.
    ///
    /// Delayed events are sent from a spawned task, so this must run
    /// inside a tokio runtime. A terminated chain is reported as
    /// `EventLoopCritical`.
    pub fn publish(&self, mut event: ConsolidationEvent) -> Result<LoopDecision, CoordinationError> {
        let guarded = {
            let mut guard = self
                .guard
                .lock()
                .map_err(|_| CoordinationError::StatePoisoned("loop guard"))?;
            guard.observe(
                event.id,
                event.event_type(),
                &event.source_id,
                event.correlation_id,
                event.parent_event_id,
            )
        };
        event.correlation_id = Some(guarded.node.correlation_id);
        let decision = guarded.decision;

        match decision.action {
            PreventionAction::Allow | PreventionAction::Warn => self.send(event),
            PreventionAction::Delay => {
                let sender = self.sender.clone();
                let delay = decision.delay.unwrap_or_default();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(event);
                });
            }
            PreventionAction::Throttle | PreventionAction::Block => match &event.payload {
                EventPayload::ConsolidationComplete { .. } | EventPayload::ConsolidationFailed { .. } => {
                    log::warn!(
                        "Dropped {} event {} for {} ({:?}): {}",
                        event.event_type(),
                        event.id,
                        event.document_path,
                        decision.action,
                        decision.reasons.join("; ")
                    );
                }
                _ => log::debug!("Dropped {} event {} ({:?})", event.event_type(), event.id, decision.action),
            },
            PreventionAction::TerminateChain => {
                return Err(CoordinationError::EventLoopCritical {
                    correlation_id: guarded.node.correlation_id,
                });
            }
        }
        Ok(decision)
    }

    fn send(&self, event: ConsolidationEvent) {
        // No subscribers is not an error.
        if self.sender.send(event).is_err() {
            log::trace!("Event published with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopGuardConfig;
    use std::time::Duration;

    fn bus() -> EventBus {
        EventBus::new(64, Arc::new(Mutex::new(LoopGuard::new(LoopGuardConfig::default()))))
    }

    fn unlocked() -> EventPayload {
        EventPayload::DocumentUnlocked { lock_id: Uuid::new_v4() }
    }

    #[test]
    fn test_payload_is_tagged_by_kind() {
        let event = ConsolidationEvent::new("doc.md", "coordinator", unlocked());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["kind"], "document_unlocked");
        assert_eq!(event.event_type(), "document_unlocked");
    }

    #[tokio::test]
    async fn test_allowed_event_is_delivered_with_correlation() {
        let bus = bus();
        let mut rx = bus.subscribe();

        let decision = bus.publish(ConsolidationEvent::new("doc.md", "editor", unlocked())).unwrap();
        assert_eq!(decision.action, PreventionAction::Allow);

        let received = rx.recv().await.unwrap();
        assert!(received.correlation_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_events_are_dropped() {
        let bus = bus();
        let mut rx = bus.subscribe();

        let mut delivered = 0;
        for _ in 0..5 {
            let decision = bus.publish(ConsolidationEvent::new("doc.md", "X", unlocked())).unwrap();
            if decision.action.delivers() {
                delivered += 1;
            }
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(delivered, 2);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_completion_is_not_delivered() {
        let bus = bus();
        let mut rx = bus.subscribe();
        let complete = || EventPayload::ConsolidationComplete {
            operation_ids: vec![Uuid::new_v4()],
            change_count: 1,
            requires_user_review: false,
            coordinated: true,
        };

        let mut suppressed = Vec::new();
        for _ in 0..5 {
            let decision = bus.publish(ConsolidationEvent::new("doc.md", "X", complete())).unwrap();
            if !decision.action.delivers() {
                assert!(!decision.reasons.is_empty());
                suppressed.push(decision.action);
            }
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(suppressed.len(), 3);
        assert!(suppressed
            .iter()
            .all(|a| matches!(a, PreventionAction::Throttle | PreventionAction::Block)));

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_chain_is_reported() {
        let guard = LoopGuard::new(LoopGuardConfig {
            max_chain_depth: 1,
            ..Default::default()
        });
        let bus = EventBus::new(16, Arc::new(Mutex::new(guard)));
        let correlation = Uuid::new_v4();

        for kind in ["a", "b"] {
            let event = ConsolidationEvent::new("doc.md", kind, unlocked()).correlated(correlation, None);
            bus.publish(event).unwrap();
        }
        let event = ConsolidationEvent::new("doc.md", "c", unlocked()).correlated(correlation, None);
        assert!(matches!(
            bus.publish(event),
            Err(CoordinationError::EventLoopCritical { correlation_id }) if correlation_id == correlation
        ));
    }
}
