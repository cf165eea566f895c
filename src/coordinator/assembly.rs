//! Folding per-conflict resolution results into one change set
//!
//! Each conflict is resolved on its own, so results can disagree. The
//! rules, applied in order:
//!
//! 1. start from every change of every operation that was not deferred
//! 2. remove changes any result rejected
//! 3. drop merge products that replace a rejected change, come from a
//!    deferred operation, or rewrite a change settled by an earlier pass
//! 4. accept the remaining products first come first served, skipping
//!    one whose own id an earlier product already replaced
//! 5. remove originals replaced by an accepted product, and originals
//!    whose id a product carries forward
//! 6. put everything in application order and check dependencies

use std::collections::{HashMap, HashSet};

use crate::merge::{order_for_application, ordering::dependency_warnings};
use crate::model::{
    ChangeId, ConflictResolutionResult, EditOperation, MergeStrategyKind, MergedChange, OperationId,
};

#[derive(Clone, Debug, Default)]
pub struct Assembly {
    pub changes: Vec<MergedChange>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub requires_user_review: bool,
    pub confidence: f64,
    pub deferred: Vec<OperationId>,
    /// Merge products that made it into `changes`.
    pub merged: usize,
}

/// `settled` are operations applied by earlier passes. They take part in
/// resolution but none of their changes are handed out again.
pub fn assemble(
    batch: &[EditOperation],
    settled: &[EditOperation],
    results: &[ConflictResolutionResult],
) -> Assembly {
    let mut assembly = Assembly {
        confidence: 1.0,
        ..Default::default()
    };

    let mut deferred: HashSet<OperationId> = HashSet::new();
    let mut rejected: HashSet<ChangeId> = HashSet::new();
    for result in results {
        deferred.extend(result.deferred_operations.iter().copied());
        rejected.extend(result.rejected_changes.iter().map(|c| c.id));
        assembly.warnings.extend(result.warnings.iter().cloned());
        assembly.errors.extend(result.errors.iter().cloned());
        assembly.requires_user_review |= result.requires_user_review;
        assembly.confidence = assembly.confidence.min(result.confidence);
    }
    assembly.deferred = batch
        .iter()
        .map(|op| op.id)
        .filter(|id| deferred.contains(id))
        .collect();

    // Results may re-label kept originals (strategy, confidence).
    let mut relabelled: HashMap<ChangeId, MergedChange> = HashMap::new();
    let mut products: Vec<&MergedChange> = Vec::new();
    for result in results {
        for change in &result.final_changes {
            if change.supersedes.is_empty() {
                relabelled.entry(change.id()).or_insert_with(|| change.clone());
            } else {
                products.push(change);
            }
        }
    }

    let mut baseline: Vec<MergedChange> = batch
        .iter()
        .filter(|op| !deferred.contains(&op.id))
        .flat_map(|op| MergedChange::from_operation(op, MergeStrategyKind::Passthrough, 1.0))
        .filter(|m| !rejected.contains(&m.id()))
        .map(|m| relabelled.remove(&m.id()).unwrap_or(m))
        .collect();

    let settled_changes: HashSet<ChangeId> = settled
        .iter()
        .flat_map(|op| op.changes.iter().map(|c| c.id))
        .collect();

    let mut superseded: HashSet<ChangeId> = HashSet::new();
    let mut accepted: Vec<MergedChange> = Vec::new();
    for product in products {
        if settled_changes.contains(&product.id())
            || product.supersedes.iter().any(|id| settled_changes.contains(id))
        {
            assembly.warnings.push(format!(
                "merged change {} dropped: it rewrites a change applied by an earlier pass",
                product.id()
            ));
            continue;
        }
        if rejected.contains(&product.id()) || product.supersedes.iter().any(|id| rejected.contains(id)) {
            assembly.warnings.push(format!(
                "merged change {} dropped: it replaces a rejected change",
                product.id()
            ));
            continue;
        }
        if product.source_operations.iter().any(|op| deferred.contains(op)) {
            continue;
        }
        if superseded.contains(&product.id()) || accepted.iter().any(|a| a.id() == product.id()) {
            continue;
        }
        if product.supersedes.iter().any(|id| superseded.contains(id)) {
            assembly.warnings.push(format!(
                "merged change {} dropped: its inputs were already merged elsewhere",
                product.id()
            ));
            continue;
        }
        superseded.extend(product.supersedes.iter().copied());
        accepted.push(product.clone());
    }

    // A product may keep the id of the original it absorbed into.
    let product_ids: HashSet<ChangeId> = accepted.iter().map(|p| p.id()).collect();
    baseline.retain(|m| !superseded.contains(&m.id()) && !product_ids.contains(&m.id()));
    assembly.merged = accepted.len();
    for product in &accepted {
        assembly.confidence = assembly.confidence.min(product.confidence);
    }

    let mut changes = baseline;
    changes.extend(accepted);
    order_for_application(&mut changes);
    assembly.warnings.extend(dependency_warnings(&changes));
    assembly.changes = changes;

    if batch.iter().any(|op| op.metadata.requires_user_review && !deferred.contains(&op.id)) {
        assembly.requires_user_review = true;
    }
    assembly
}
