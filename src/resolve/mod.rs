//! Conflict Resolver
//!
//! Picks a strategy for each detected conflict from a fixed table and runs
//! it. Merge strategies delegate to the [`ChangeMergingEngine`]; the rest
//! are decided here. Every resolution is written back onto the conflict as
//! an audit record.

use chrono::Utc;

use crate::config::MergeConfig;
use crate::merge::ChangeMergingEngine;
use crate::model::{
    ChangeConflict, ConflictResolution, ConflictResolutionResult, ConflictType, EditOperation,
    MergeStrategyKind, MergedChange, ResolutionOutcome, ResolutionStrategy, Severity,
};

const APPLIED_BY: &str = "conflict_resolver";

/// Strategy table keyed by conflict type and severity.
pub fn strategy_for(conflict_type: ConflictType, severity: Severity) -> ResolutionStrategy {
    match (conflict_type, severity) {
        (ConflictType::OverlappingEdits, Severity::Low) => ResolutionStrategy::MergeCompatible,
        (ConflictType::OverlappingEdits, Severity::High) => ResolutionStrategy::PriorityWins,
        (ConflictType::OverlappingEdits, _) => ResolutionStrategy::SequentialProcessing,
        (ConflictType::SemanticConflict, _) => ResolutionStrategy::SemanticMerge,
        (ConflictType::DependencyViolation, _) => ResolutionStrategy::SequentialProcessing,
        (ConflictType::PriorityConflict, _) => ResolutionStrategy::PriorityWins,
        (ConflictType::ResourceContention, _) => ResolutionStrategy::DeferOperation,
    }
}

pub struct ConflictResolver {
    engine: ChangeMergingEngine,
}

impl ConflictResolver {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            engine: ChangeMergingEngine::new(config),
        }
    }

    pub fn engine(&self) -> &ChangeMergingEngine {
        &self.engine
    }

    pub fn set_merge_config(&mut self, config: MergeConfig) {
        self.engine.set_config(config);
    }

    /// Resolve one conflict against the batch it was detected in and record
    /// the outcome on the conflict.
    pub fn resolve(
        &self,
        conflict: &mut ChangeConflict,
        operations: &[EditOperation],
    ) -> ConflictResolutionResult {
        let started_at = Utc::now();

        let mut involved: Vec<&EditOperation> = Vec::with_capacity(conflict.operations.len());
        let mut missing = Vec::new();
        for id in &conflict.operations {
            match operations.iter().find(|op| op.id == *id) {
                Some(op) => involved.push(op),
                None => missing.push(*id),
            }
        }
        involved.sort_by_key(|op| op.schedule_key());

        let planned = strategy_for(conflict.conflict_type, conflict.severity);
        let mut result = if !missing.is_empty() {
            let mut result = self.user_choice(conflict, &involved);
            result.warn(format!(
                "conflict {} references unknown operations {:?}",
                conflict.id, missing
            ));
            result
        } else if let Some(op) = involved
            .iter()
            .find(|op| !op.capabilities.accepts(planned))
        {
            let mut result = self.user_choice(conflict, &involved);
            result.warn(format!(
                "operation {} from {} does not accept {}",
                op.id, op.source_id, planned
            ));
            result
        } else {
            self.apply(planned, conflict, &involved)
        };

        if involved.iter().any(|op| op.metadata.requires_user_review) {
            result.requires_user_review = true;
        }

        log::debug!(
            "Resolved {} conflict {} ({:?}) with {}: {} kept, {} rejected, {} deferred",
            conflict.conflict_type,
            conflict.id,
            conflict.severity,
            result.strategy,
            result.final_changes.len(),
            result.rejected_changes.len(),
            result.deferred_operations.len()
        );

        let outcome = if result.fallback_required || !result.success {
            ResolutionOutcome::FellBack
        } else if result.requires_user_review {
            ResolutionOutcome::ResolvedWithReview
        } else {
            ResolutionOutcome::Resolved
        };
        conflict.resolution = Some(ConflictResolution {
            strategy: result.strategy,
            outcome,
            applied_by: APPLIED_BY.to_string(),
            started_at,
            resolved_at: Utc::now(),
            original_changes: involved.iter().flat_map(|op| op.changes.iter().cloned()).collect(),
            merged_changes: result.final_changes.clone(),
            rejected_changes: result.rejected_changes.clone(),
        });

        result
    }

    /// Run a specific strategy on a conflict.
    pub fn apply(
        &self,
        strategy: ResolutionStrategy,
        conflict: &ChangeConflict,
        involved: &[&EditOperation],
    ) -> ConflictResolutionResult {
        match strategy {
            ResolutionStrategy::PriorityWins => self.priority_wins(conflict, involved),
            ResolutionStrategy::SequentialProcessing => self.sequential(conflict, involved),
            ResolutionStrategy::MergeCompatible => {
                let owned: Vec<EditOperation> = involved.iter().map(|op| (*op).clone()).collect();
                self.engine.merge_operations(&owned)
            }
            ResolutionStrategy::SemanticMerge => {
                let owned: Vec<EditOperation> = involved.iter().map(|op| (*op).clone()).collect();
                self.engine.merge_operations_using(&owned, MergeStrategyKind::Semantic)
            }
            ResolutionStrategy::DeferOperation => self.defer(involved),
            ResolutionStrategy::UserChoice => self.user_choice(conflict, involved),
        }
    }

    /// The most important operation keeps everything; other operations keep
    /// the changes that do not overlap it.
    fn priority_wins(&self, conflict: &ChangeConflict, involved: &[&EditOperation]) -> ConflictResolutionResult {
        let mut result = ConflictResolutionResult::new(ResolutionStrategy::PriorityWins);
        let Some((winner, losers)) = involved.split_first() else {
            return result;
        };

        result
            .final_changes
            .extend(MergedChange::from_operation(winner, MergeStrategyKind::PriorityBased, 1.0));

        for loser in losers {
            for change in &loser.changes {
                let blocking = winner.changes.iter().find(|w| w.overlaps(change));
                match blocking {
                    Some(kept) => {
                        result.warn(format!(
                            "discarded change {} from {} ({:?}): overlaps change {} from {} ({:?})",
                            change.id,
                            loser.source_id,
                            loser.priority,
                            kept.id,
                            winner.source_id,
                            winner.priority
                        ));
                        result.rejected_changes.push(change.clone());
                    }
                    None => result.final_changes.push(MergedChange::passthrough(
                        loser.id,
                        change.clone(),
                        MergeStrategyKind::PriorityBased,
                        1.0,
                    )),
                }
            }
        }

        if !result.rejected_changes.is_empty() {
            result.confidence = 0.8;
        }
        if conflict.severity >= Severity::Critical {
            result.requires_user_review = true;
        }
        result
    }

    /// Keep everything, in (priority, timestamp) order.
    fn sequential(&self, conflict: &ChangeConflict, involved: &[&EditOperation]) -> ConflictResolutionResult {
        let mut result = ConflictResolutionResult::new(ResolutionStrategy::SequentialProcessing);
        for op in involved {
            result
                .final_changes
                .extend(MergedChange::from_operation(op, MergeStrategyKind::Passthrough, 1.0));
        }
        if conflict.severity >= Severity::Medium {
            result.requires_user_review = true;
            result.warn(format!(
                "{} conflict between {} applied sequentially, review recommended",
                conflict.conflict_type,
                involved
                    .iter()
                    .map(|op| op.source_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        result
    }

    /// The lead operation proceeds; the rest are retried later unless they
    /// cannot be deferred.
    fn defer(&self, involved: &[&EditOperation]) -> ConflictResolutionResult {
        let mut result = ConflictResolutionResult::new(ResolutionStrategy::DeferOperation);
        let Some((lead, rest)) = involved.split_first() else {
            return result;
        };
        result
            .final_changes
            .extend(MergedChange::from_operation(lead, MergeStrategyKind::Passthrough, 1.0));

        for op in rest {
            if op.metadata.can_defer {
                result.deferred_operations.push(op.id);
                result.warn(format!("operation {} from {} deferred", op.id, op.source_id));
            } else {
                result
                    .final_changes
                    .extend(MergedChange::from_operation(op, MergeStrategyKind::Passthrough, 1.0));
                result.warn(format!(
                    "operation {} from {} cannot be deferred; kept in this pass",
                    op.id, op.source_id
                ));
            }
        }
        result
    }

    fn user_choice(&self, conflict: &ChangeConflict, involved: &[&EditOperation]) -> ConflictResolutionResult {
        let mut result = ConflictResolutionResult::new(ResolutionStrategy::UserChoice);
        for op in involved {
            result
                .final_changes
                .extend(MergedChange::from_operation(op, MergeStrategyKind::Passthrough, 1.0));
        }
        result.requires_user_review = true;
        result.confidence = 0.5;
        result.warn(format!(
            "{} conflict {} left for the user to decide",
            conflict.conflict_type, conflict.id
        ));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EditChange, OperationCapabilities, OperationMetadata, Priority};

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(MergeConfig::default())
    }

    fn conflict_for(kind: ConflictType, severity: Severity, ops: &[&EditOperation]) -> ChangeConflict {
        ChangeConflict::new(
            kind,
            severity,
            ops.iter().map(|op| op.id).collect(),
            ops.iter().flat_map(|op| op.changes.iter().map(|c| c.id)).collect(),
            "test conflict",
        )
    }

    #[test]
    fn test_strategy_table() {
        use ConflictType::*;
        assert_eq!(strategy_for(OverlappingEdits, Severity::Low), ResolutionStrategy::MergeCompatible);
        assert_eq!(strategy_for(OverlappingEdits, Severity::High), ResolutionStrategy::PriorityWins);
        assert_eq!(strategy_for(OverlappingEdits, Severity::Medium), ResolutionStrategy::SequentialProcessing);
        assert_eq!(strategy_for(OverlappingEdits, Severity::Critical), ResolutionStrategy::SequentialProcessing);
        assert_eq!(strategy_for(SemanticConflict, Severity::Info), ResolutionStrategy::SemanticMerge);
        assert_eq!(strategy_for(DependencyViolation, Severity::High), ResolutionStrategy::SequentialProcessing);
        assert_eq!(strategy_for(PriorityConflict, Severity::Low), ResolutionStrategy::PriorityWins);
        assert_eq!(strategy_for(ResourceContention, Severity::Medium), ResolutionStrategy::DeferOperation);
    }

    #[test]
    fn test_priority_wins_keeps_winner_and_warns_about_discard() {
        let a = EditOperation::new("editor", "doc.md", Priority::High, vec![EditChange::replace(10, 20, "bar")]);
        let b_overlap = EditChange::replace(15, 25, "qux");
        let b_free = EditChange::insert(80, "tail");
        let b = EditOperation::new("ai", "doc.md", Priority::Low, vec![b_overlap.clone(), b_free.clone()]);
        let mut conflict = conflict_for(ConflictType::OverlappingEdits, Severity::High, &[&a, &b]);

        let result = resolver().resolve(&mut conflict, &[a.clone(), b.clone()]);

        assert_eq!(result.strategy, ResolutionStrategy::PriorityWins);
        let kept = result.final_change_ids();
        assert!(kept.contains(&a.changes[0].id));
        assert!(kept.contains(&b_free.id));
        assert!(!kept.contains(&b_overlap.id));
        assert_eq!(result.rejected_changes, vec![b_overlap.clone()]);
        assert!(result.warnings.iter().any(|w| w.contains(&b_overlap.id.to_string())));

        let audit = conflict.resolution.expect("audit record");
        assert_eq!(audit.strategy, ResolutionStrategy::PriorityWins);
        assert_eq!(audit.rejected_changes.len(), 1);
        assert_eq!(audit.original_changes.len(), 3);
    }

    #[test]
    fn test_sequential_requires_review_from_medium() {
        let a = EditOperation::new("editor", "doc.md", Priority::High, vec![EditChange::replace(10, 20, "bar")]);
        let b = EditOperation::new("ai", "doc.md", Priority::Medium, vec![EditChange::insert(15, "baz")]);
        let mut conflict = conflict_for(ConflictType::OverlappingEdits, Severity::Medium, &[&b, &a]);

        let result = resolver().resolve(&mut conflict, &[a.clone(), b.clone()]);
        assert_eq!(result.strategy, ResolutionStrategy::SequentialProcessing);
        assert!(result.requires_user_review);
        assert_eq!(result.final_change_ids(), vec![a.changes[0].id, b.changes[0].id]);
        assert_eq!(
            conflict.resolution.map(|r| r.outcome),
            Some(ResolutionOutcome::ResolvedWithReview)
        );
    }

    #[test]
    fn test_defer_respects_can_defer() {
        let lead = EditOperation::new("editor", "doc.md", Priority::High, vec![EditChange::insert(0, "a")]);
        let later = EditOperation::new("ai", "doc.md", Priority::Low, vec![EditChange::insert(10, "b")]);
        let pinned = EditOperation::new("proofreader", "doc.md", Priority::Low, vec![EditChange::insert(20, "c")])
            .with_metadata(OperationMetadata {
                can_defer: false,
                ..Default::default()
            });
        let mut conflict = conflict_for(ConflictType::ResourceContention, Severity::Medium, &[&lead, &later, &pinned]);

        let result = resolver().resolve(&mut conflict, &[lead.clone(), later.clone(), pinned.clone()]);
        assert_eq!(result.deferred_operations, vec![later.id]);
        let kept = result.final_change_ids();
        assert!(kept.contains(&lead.changes[0].id));
        assert!(kept.contains(&pinned.changes[0].id));
        assert!(!kept.contains(&later.changes[0].id));
    }

    #[test]
    fn test_unsupported_strategy_falls_back_to_user_choice() {
        let a = EditOperation::new("editor", "doc.md", Priority::Critical, vec![EditChange::replace(0, 10, "x")]);
        let b = EditOperation::new("ai", "doc.md", Priority::Low, vec![EditChange::replace(0, 10, "y")])
            .with_capabilities(OperationCapabilities {
                supported_strategies: vec![ResolutionStrategy::SequentialProcessing],
                ..Default::default()
            });
        let mut conflict = conflict_for(ConflictType::PriorityConflict, Severity::Medium, &[&a, &b]);

        let result = resolver().resolve(&mut conflict, &[a, b]);
        assert_eq!(result.strategy, ResolutionStrategy::UserChoice);
        assert!(result.requires_user_review);
        assert_eq!(result.final_changes.len(), 2);
        assert!(result.rejected_changes.is_empty());
    }

    #[test]
    fn test_unknown_operation_falls_back_to_user_choice() {
        let a = EditOperation::new("editor", "doc.md", Priority::High, vec![EditChange::insert(0, "x")]);
        let ghost = EditOperation::new("ai", "doc.md", Priority::Low, vec![EditChange::insert(0, "y")]);
        let mut conflict = conflict_for(ConflictType::OverlappingEdits, Severity::High, &[&a, &ghost]);

        let result = resolver().resolve(&mut conflict, &[a]);
        assert_eq!(result.strategy, ResolutionStrategy::UserChoice);
        assert!(result.warnings.iter().any(|w| w.contains("unknown operations")));
    }

    #[test]
    fn test_requires_user_review_flag_forces_review() {
        let a = EditOperation::new("editor", "doc.md", Priority::High, vec![EditChange::replace(10, 20, "bar")])
            .with_metadata(OperationMetadata {
                requires_user_review: true,
                ..Default::default()
            });
        let b = EditOperation::new("ai", "doc.md", Priority::Low, vec![EditChange::replace(12, 18, "q")]);
        let mut conflict = conflict_for(ConflictType::OverlappingEdits, Severity::High, &[&a, &b]);

        let result = resolver().resolve(&mut conflict, &[a, b]);
        assert!(result.requires_user_review);
    }

    #[test]
    fn test_merge_compatible_delegates_to_engine() {
        let caps = OperationCapabilities {
            mergeable_with: vec!["*".into()],
            supports_auto_merge: true,
            ..Default::default()
        };
        let a = EditOperation::new("editor", "doc.md", Priority::Medium, vec![EditChange::insert(5, "hello")])
            .with_capabilities(caps.clone());
        let b = EditOperation::new("ai", "doc.md", Priority::Medium, vec![EditChange::insert(5, " world")])
            .with_capabilities(caps);
        let mut conflict = conflict_for(ConflictType::OverlappingEdits, Severity::Low, &[&a, &b]);

        let result = resolver().resolve(&mut conflict, &[a, b]);
        assert_eq!(result.strategy, ResolutionStrategy::MergeCompatible);
        assert_eq!(result.final_changes.len(), 1);
        assert_eq!(result.final_changes[0].strategy, MergeStrategyKind::TextBased);
        assert!(result.requires_user_review);
    }
}
