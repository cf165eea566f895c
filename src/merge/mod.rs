//! Change Merging Engine
//!
//! Merges operations that are allowed to be merged and passes the rest
//! through untouched, then puts every resulting change into a safe
//! application order.
//!
//! # Pipeline
//!
//! ```text
//! operations
//!   ↓ sort (priority, timestamp, user-initiated first)
//! groups of mutually mergeable operations
//!   ↓ first applicable strategy, folded left to right
//! merged changes (+ untouched changes of ungrouped operations)
//!   ↓ reverse position order, dependency check
//! ConflictResolutionResult
//! ```

pub mod ordering;
pub mod strategy;

pub use ordering::{application_cmp, dependency_violations, order_for_application, DependencyViolation};
pub use strategy::{
    MergeSide, MergeStep, MergeStrategy, NonOverlappingStrategy, PriorityBasedStrategy,
    SemanticStrategy, TextBasedStrategy,
};

use crate::config::MergeConfig;
use crate::model::{
    ConflictResolutionResult, EditOperation, MergeStrategyKind, MergedChange, ResolutionStrategy,
};

pub struct ChangeMergingEngine {
    config: MergeConfig,
    strategies: Vec<Box<dyn MergeStrategy>>,
}

/// Outcome of merging one group.
struct GroupOutcome {
    changes: Vec<MergedChange>,
    confidence: f64,
}

impl ChangeMergingEngine {
    pub fn new(config: MergeConfig) -> Self {
        let strategies = strategy::default_strategies(config.semantic_threshold, config.semantic_proximity);
        Self { config, strategies }
    }

    pub fn set_config(&mut self, config: MergeConfig) {
        if config.semantic_threshold != self.config.semantic_threshold
            || config.semantic_proximity != self.config.semantic_proximity
        {
            self.strategies = strategy::default_strategies(config.semantic_threshold, config.semantic_proximity);
        }
        self.config = config;
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge a set of operations, picking strategies automatically.
    pub fn merge_operations(&self, operations: &[EditOperation]) -> ConflictResolutionResult {
        self.run(operations, None, ResolutionStrategy::MergeCompatible)
    }

    /// Merge a set of operations with one strategy forced for every group.
    pub fn merge_operations_using(
        &self,
        operations: &[EditOperation],
        kind: MergeStrategyKind,
    ) -> ConflictResolutionResult {
        let resolution = match kind {
            MergeStrategyKind::Semantic => ResolutionStrategy::SemanticMerge,
            _ => ResolutionStrategy::MergeCompatible,
        };
        self.run(operations, Some(kind), resolution)
    }

    fn run(
        &self,
        operations: &[EditOperation],
        forced: Option<MergeStrategyKind>,
        resolution: ResolutionStrategy,
    ) -> ConflictResolutionResult {
        let mut result = ConflictResolutionResult::new(resolution);

        if operations.len() <= 1 {
            for op in operations {
                result
                    .final_changes
                    .extend(MergedChange::from_operation(op, MergeStrategyKind::Passthrough, 1.0));
            }
            self.finish(&mut result);
            return result;
        }

        let mut sorted: Vec<&EditOperation> = operations.iter().collect();
        sorted.sort_by_key(|op| (op.priority, op.timestamp, !op.metadata.user_initiated));

        let mut confidence: f64 = 1.0;
        for group in self.group(&sorted) {
            if group.len() == 1 {
                let op = group[0];
                result.warn(format!(
                    "operation {} from {} cannot be merged with the others; kept unmerged",
                    op.id, op.source_id
                ));
                result.requires_user_review = true;
                result
                    .final_changes
                    .extend(MergedChange::from_operation(op, MergeStrategyKind::Passthrough, 1.0));
                continue;
            }

            let outcome = self.merge_group(&group, forced, &mut result);
            confidence = confidence.min(outcome.confidence);
            result.final_changes.extend(outcome.changes);
        }

        result.confidence = confidence;
        self.finish(&mut result);
        result
    }

    /// Greedy grouping: an operation joins the first group whose every
    /// member it can be merged with.
    fn group<'a>(&self, sorted: &[&'a EditOperation]) -> Vec<Vec<&'a EditOperation>> {
        let mut groups: Vec<Vec<&'a EditOperation>> = Vec::new();
        for &op in sorted {
            match groups
                .iter_mut()
                .find(|g| g.iter().all(|member| self.can_group(member, op)))
            {
                Some(group) => group.push(op),
                None => groups.push(vec![op]),
            }
        }
        groups
    }

    /// Two operations may share a group when both allow it, their
    /// priorities are close, and overlapping changes are auto-mergeable.
    pub fn can_group(&self, a: &EditOperation, b: &EditOperation) -> bool {
        a.mutually_mergeable(b)
            && a.priority.gap(b.priority) <= self.config.max_priority_gap
            && (!a.overlaps(b)
                || (a.capabilities.supports_auto_merge && b.capabilities.supports_auto_merge))
    }

    fn select(&self, left: &MergeSide, right: &MergeSide, forced: Option<MergeStrategyKind>) -> Option<&dyn MergeStrategy> {
        self.strategies
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| forced.map(|k| s.kind() == k).unwrap_or(true))
            .find(|s| s.can_apply(left, right))
    }

    fn merge_group(
        &self,
        group: &[&EditOperation],
        forced: Option<MergeStrategyKind>,
        result: &mut ConflictResolutionResult,
    ) -> GroupOutcome {
        let sides: Vec<MergeSide> = group.iter().map(|op| MergeSide::from_operation(op)).collect();

        let Some(strategy) = self.select(&sides[0], &sides[1], forced) else {
            return self.fall_back(group, "no merge strategy applies", result);
        };
        log::debug!(
            "Merging {} operations with {:?} strategy",
            group.len(),
            strategy.kind()
        );

        let mut running = sides[0].clone();
        let mut confidence: f64 = 1.0;
        let mut rejected = Vec::new();
        let mut warnings = Vec::new();
        let mut requires_review = false;

        for next in &sides[1..] {
            if !strategy.can_apply(&running, next) {
                let reason = format!("{:?} strategy no longer applies to operation {}", strategy.kind(), next.operations[0]);
                return self.fall_back(group, &reason, result);
            }
            match strategy.merge(&running, next) {
                Ok(step) => {
                    confidence = confidence.min(step.confidence);
                    requires_review |= step.requires_review;
                    rejected.extend(step.rejected);
                    warnings.extend(step.warnings);
                    running = step.merged;
                }
                Err(reason) => return self.fall_back(group, &reason, result),
            }
        }

        result.rejected_changes.extend(rejected);
        result.warnings.extend(warnings);
        result.requires_user_review |= requires_review;

        GroupOutcome {
            changes: running.changes,
            confidence,
        }
    }

    /// Keep every original change of the group and ask for review.
    fn fall_back(
        &self,
        group: &[&EditOperation],
        reason: &str,
        result: &mut ConflictResolutionResult,
    ) -> GroupOutcome {
        let ids: Vec<String> = group.iter().map(|op| op.id.to_string()).collect();
        log::warn!("Merge of operations [{}] failed: {}", ids.join(", "), reason);

        result.fail(format!("merge of operations [{}] failed: {}", ids.join(", "), reason));
        result.warn(format!(
            "kept all original changes of operations [{}] unmerged",
            ids.join(", ")
        ));
        result.fallback_required = true;
        result.requires_user_review = true;

        GroupOutcome {
            changes: group
                .iter()
                .flat_map(|op| MergedChange::from_operation(op, MergeStrategyKind::Fallback, 0.0))
                .collect(),
            confidence: 0.0,
        }
    }

    /// Order the final changes, validate dependencies and settle review.
    fn finish(&self, result: &mut ConflictResolutionResult) {
        order_for_application(&mut result.final_changes);
        let dependency_warnings = ordering::dependency_warnings(&result.final_changes);
        result.warnings.extend(dependency_warnings);
        if result.confidence < self.config.confidence_threshold {
            result.requires_user_review = true;
        }
    }
}
