//! Merge strategies
//!
//! Each strategy merges two sides: the running result of a group and the
//! next operation. The engine tries them in order and keeps the first one
//! that applies.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    ChangeId, EditChange, EditOperation, MergeStrategyKind, MergedChange, OperationId, Priority,
};

/// One side of a pairwise merge.
#[derive(Clone, Debug)]
pub struct MergeSide {
    pub operations: Vec<OperationId>,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub user_initiated: bool,
    pub changes: Vec<MergedChange>,
}

impl MergeSide {
    pub fn from_operation(operation: &EditOperation) -> Self {
        Self {
            operations: vec![operation.id],
            priority: operation.priority,
            timestamp: operation.timestamp,
            user_initiated: operation.metadata.user_initiated,
            changes: MergedChange::from_operation(operation, MergeStrategyKind::Passthrough, 1.0),
        }
    }

    /// True when this side should win against `other`.
    pub fn outranks(&self, other: &MergeSide) -> bool {
        (self.priority, self.timestamp, !self.user_initiated)
            <= (other.priority, other.timestamp, !other.user_initiated)
    }

    /// Combine the bookkeeping of two sides around a merged change list.
    fn combine(left: &MergeSide, right: &MergeSide, changes: Vec<MergedChange>) -> MergeSide {
        let mut operations = left.operations.clone();
        operations.extend(right.operations.iter().copied());
        let (lead, _) = if left.outranks(right) { (left, right) } else { (right, left) };
        MergeSide {
            operations,
            priority: lead.priority,
            timestamp: lead.timestamp,
            user_initiated: left.user_initiated || right.user_initiated,
            changes,
        }
    }

    fn overlapping_pairs<'a>(&'a self, other: &'a MergeSide) -> Vec<(&'a MergedChange, &'a MergedChange)> {
        let mut pairs = Vec::new();
        for a in &self.changes {
            for b in &other.changes {
                if a.change.overlaps(&b.change) {
                    pairs.push((a, b));
                }
            }
        }
        pairs
    }
}

/// Result of one pairwise merge.
#[derive(Clone, Debug)]
pub struct MergeStep {
    pub merged: MergeSide,
    pub rejected: Vec<EditChange>,
    pub warnings: Vec<String>,
    pub confidence: f64,
    pub requires_review: bool,
}

pub trait MergeStrategy: Send + Sync {
    fn kind(&self) -> MergeStrategyKind;

    fn can_apply(&self, left: &MergeSide, right: &MergeSide) -> bool;

    fn merge(&self, left: &MergeSide, right: &MergeSide) -> Result<MergeStep, String>;
}

/// Re-label a change as produced by `kind`, capping its confidence.
fn relabel(mut merged: MergedChange, kind: MergeStrategyKind, confidence: f64) -> MergedChange {
    merged.strategy = kind;
    merged.confidence = merged.confidence.min(confidence);
    merged
}

/// Mark `keeper` as replacing `superseded` and everything it replaced.
fn absorb(keeper: &mut MergedChange, superseded: &MergedChange) {
    keeper.supersedes.push(superseded.change.id);
    keeper.supersedes.extend(superseded.supersedes.iter().copied());
    for op in &superseded.source_operations {
        if !keeper.source_operations.contains(op) {
            keeper.source_operations.push(*op);
        }
    }
}

/// Direct concatenation of two change sets that never touch.
pub struct NonOverlappingStrategy;

impl NonOverlappingStrategy {
    const CONFIDENCE: f64 = 0.9;
}

impl MergeStrategy for NonOverlappingStrategy {
    fn kind(&self) -> MergeStrategyKind {
        MergeStrategyKind::NonOverlapping
    }

    fn can_apply(&self, left: &MergeSide, right: &MergeSide) -> bool {
        left.overlapping_pairs(right).is_empty()
    }

    fn merge(&self, left: &MergeSide, right: &MergeSide) -> Result<MergeStep, String> {
        if !self.can_apply(left, right) {
            return Err("change sets overlap".into());
        }
        let changes = left
            .changes
            .iter()
            .chain(right.changes.iter())
            .cloned()
            .map(|m| relabel(m, self.kind(), Self::CONFIDENCE))
            .collect();
        Ok(MergeStep {
            merged: MergeSide::combine(left, right, changes),
            rejected: Vec::new(),
            warnings: Vec::new(),
            confidence: Self::CONFIDENCE,
            requires_review: false,
        })
    }
}

/// The higher-priority side wins every overlap outright.
pub struct PriorityBasedStrategy;

impl PriorityBasedStrategy {
    const CONFIDENCE: f64 = 0.8;
}

impl MergeStrategy for PriorityBasedStrategy {
    fn kind(&self) -> MergeStrategyKind {
        MergeStrategyKind::PriorityBased
    }

    fn can_apply(&self, left: &MergeSide, right: &MergeSide) -> bool {
        left.priority != right.priority
    }

    fn merge(&self, left: &MergeSide, right: &MergeSide) -> Result<MergeStep, String> {
        if !self.can_apply(left, right) {
            return Err("sides share the same priority".into());
        }
        let (winner, loser) = if left.outranks(right) { (left, right) } else { (right, left) };

        let mut changes: Vec<MergedChange> = winner
            .changes
            .iter()
            .cloned()
            .map(|m| relabel(m, self.kind(), Self::CONFIDENCE))
            .collect();
        let mut rejected = Vec::new();
        let mut warnings = Vec::new();

        for candidate in &loser.changes {
            let blocker = winner
                .changes
                .iter()
                .find(|w| w.change.overlaps(&candidate.change));
            match blocker {
                Some(blocker) => {
                    warnings.push(format!(
                        "discarded change {} ({}..{}) overlapping higher-priority change {}",
                        candidate.change.id, candidate.change.from, candidate.change.to, blocker.change.id
                    ));
                    rejected.push(candidate.change.clone());
                }
                None => changes.push(relabel(candidate.clone(), self.kind(), Self::CONFIDENCE)),
            }
        }

        Ok(MergeStep {
            merged: MergeSide::combine(left, right, changes),
            rejected,
            warnings,
            confidence: Self::CONFIDENCE,
            requires_review: false,
        })
    }
}

/// Intention-aware merge for annotated changes.
///
/// Annotated changes on opposite sides that overlap or sit within
/// `proximity` characters must be compatible. For each overlapping pair the
/// more confident edit is kept and supersedes the other.
pub struct SemanticStrategy {
    pub threshold: f64,
    pub proximity: usize,
}

impl MergeStrategy for SemanticStrategy {
    fn kind(&self) -> MergeStrategyKind {
        MergeStrategyKind::Semantic
    }

    fn can_apply(&self, left: &MergeSide, right: &MergeSide) -> bool {
        left.overlapping_pairs(right).iter().all(|(a, b)| {
            a.change.semantic_context.is_some() && b.change.semantic_context.is_some()
        })
    }

    fn merge(&self, left: &MergeSide, right: &MergeSide) -> Result<MergeStep, String> {
        if !self.can_apply(left, right) {
            return Err("overlapping changes without semantic context".into());
        }

        let mut confidence: f64 = 1.0;
        for a in &left.changes {
            for b in &right.changes {
                let (Some(ca), Some(cb)) = (&a.change.semantic_context, &b.change.semantic_context) else {
                    continue;
                };
                if !a.change.semantically_near(&b.change, self.proximity) {
                    continue;
                }
                let compatibility = ca.compatibility_with(cb);
                if compatibility < self.threshold {
                    return Err(format!(
                        "{:?} change {} and {:?} change {} are incompatible ({:.2})",
                        ca.intention, a.change.id, cb.intention, b.change.id, compatibility
                    ));
                }
                if a.change.overlaps(&b.change) {
                    confidence = confidence.min(compatibility * ca.confidence.min(cb.confidence));
                }
            }
        }

        let left_wins_ties = left.outranks(right);
        let mut left_changes = left.changes.clone();
        let mut right_changes = right.changes.clone();
        let mut superseded: HashSet<ChangeId> = HashSet::new();
        let mut warnings = Vec::new();

        for li in 0..left_changes.len() {
            for ri in 0..right_changes.len() {
                let (l, r) = (&left_changes[li], &right_changes[ri]);
                if superseded.contains(&l.change.id) || superseded.contains(&r.change.id) {
                    continue;
                }
                if !l.change.overlaps(&r.change) {
                    continue;
                }
                let lc = l.change.semantic_context.as_ref().map(|c| c.confidence).unwrap_or(0.0);
                let rc = r.change.semantic_context.as_ref().map(|c| c.confidence).unwrap_or(0.0);
                let keep_left = lc > rc || (lc == rc && left_wins_ties);
                if keep_left {
                    let loser = right_changes[ri].clone();
                    absorb(&mut left_changes[li], &loser);
                    superseded.insert(loser.change.id);
                    warnings.push(format!(
                        "change {} folded into semantically compatible change {}",
                        loser.change.id, left_changes[li].change.id
                    ));
                } else {
                    let loser = left_changes[li].clone();
                    absorb(&mut right_changes[ri], &loser);
                    superseded.insert(loser.change.id);
                    warnings.push(format!(
                        "change {} folded into semantically compatible change {}",
                        loser.change.id, right_changes[ri].change.id
                    ));
                }
            }
        }

        let changes = left_changes
            .into_iter()
            .chain(right_changes)
            .filter(|m| !superseded.contains(&m.change.id))
            .map(|mut m| {
                m.preserved_semantics = true;
                relabel(m, self.kind(), confidence)
            })
            .collect();

        Ok(MergeStep {
            merged: MergeSide::combine(left, right, changes),
            rejected: Vec::new(),
            warnings,
            confidence,
            requires_review: false,
        })
    }
}

/// Last resort: inserts at the same position are concatenated into one
/// insert, higher priority text first. Always needs a human look.
pub struct TextBasedStrategy;

impl TextBasedStrategy {
    const CONFIDENCE: f64 = 0.5;
}

impl MergeStrategy for TextBasedStrategy {
    fn kind(&self) -> MergeStrategyKind {
        MergeStrategyKind::TextBased
    }

    fn can_apply(&self, left: &MergeSide, right: &MergeSide) -> bool {
        left.overlapping_pairs(right).iter().all(|(a, b)| {
            a.change.kind == b.change.kind && !a.change.kind.is_destructive()
        })
    }

    fn merge(&self, left: &MergeSide, right: &MergeSide) -> Result<MergeStep, String> {
        if !self.can_apply(left, right) {
            return Err("overlapping changes are destructive or of different kinds".into());
        }
        let (winner, loser) = if left.outranks(right) { (left, right) } else { (right, left) };

        let mut consumed: HashSet<ChangeId> = HashSet::new();
        let mut changes = Vec::new();
        let mut warnings = Vec::new();

        for w in &winner.changes {
            let partners: Vec<&MergedChange> = loser
                .changes
                .iter()
                .filter(|l| !consumed.contains(&l.change.id) && w.change.overlaps(&l.change))
                .collect();
            if partners.is_empty() {
                changes.push(relabel(w.clone(), self.kind(), Self::CONFIDENCE));
                continue;
            }

            let mut text = w.change.text.clone().unwrap_or_default();
            let mut combined = MergedChange {
                source_operations: w.source_operations.clone(),
                change: EditChange {
                    id: Uuid::new_v4(),
                    semantic_context: None,
                    ..w.change.clone()
                },
                confidence: Self::CONFIDENCE,
                strategy: self.kind(),
                preserved_semantics: false,
                supersedes: Vec::new(),
            };
            absorb(&mut combined, w);
            for partner in partners {
                text.push_str(partner.change.text.as_deref().unwrap_or_default());
                for dep in &partner.change.depends_on {
                    if !combined.change.depends_on.contains(dep) {
                        combined.change.depends_on.push(*dep);
                    }
                }
                absorb(&mut combined, partner);
                consumed.insert(partner.change.id);
            }
            combined.change.text = Some(text);
            warnings.push(format!(
                "combined {} same-position inserts at {} into change {}",
                combined.supersedes.len(),
                combined.change.from,
                combined.change.id
            ));
            changes.push(combined);
        }

        changes.extend(
            loser
                .changes
                .iter()
                .filter(|l| !consumed.contains(&l.change.id))
                .cloned()
                .map(|m| relabel(m, self.kind(), Self::CONFIDENCE)),
        );

        Ok(MergeStep {
            merged: MergeSide::combine(left, right, changes),
            rejected: Vec::new(),
            warnings,
            confidence: Self::CONFIDENCE,
            requires_review: true,
        })
    }
}

/// The default strategy list, in selection order.
pub fn default_strategies(semantic_threshold: f64, semantic_proximity: usize) -> Vec<Box<dyn MergeStrategy>> {
    vec![
        Box::new(NonOverlappingStrategy),
        Box::new(PriorityBasedStrategy),
        Box::new(SemanticStrategy {
            threshold: semantic_threshold,
            proximity: semantic_proximity,
        }),
        Box::new(TextBasedStrategy),
    ]
}
