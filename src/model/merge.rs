//! Merge products and resolution results

use serde::{Deserialize, Serialize};

use super::change::{ChangeId, EditChange};
use super::conflict::ResolutionStrategy;
use super::operation::{EditOperation, OperationId};

/// Which merge strategy produced a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategyKind {
    Passthrough,
    NonOverlapping,
    PriorityBased,
    Semantic,
    TextBased,
    Fallback,
}

/// A change ready to be applied, with its provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergedChange {
    pub source_operations: Vec<OperationId>,
    pub change: EditChange,
    pub confidence: f64,
    pub strategy: MergeStrategyKind,
    pub preserved_semantics: bool,
    /// Original changes this one replaces. Empty for unmodified changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<ChangeId>,
}

impl MergedChange {
    /// Wrap an original change without modification.
    pub fn passthrough(operation: OperationId, change: EditChange, strategy: MergeStrategyKind, confidence: f64) -> Self {
        Self {
            source_operations: vec![operation],
            change,
            confidence,
            strategy,
            preserved_semantics: true,
            supersedes: Vec::new(),
        }
    }

    /// Every change of `operation`, unmodified.
    pub fn from_operation(operation: &EditOperation, strategy: MergeStrategyKind, confidence: f64) -> Vec<Self> {
        operation
            .changes
            .iter()
            .cloned()
            .map(|c| Self::passthrough(operation.id, c, strategy, confidence))
            .collect()
    }

    pub fn id(&self) -> ChangeId {
        self.change.id
    }
}

/// Outcome of resolving one conflict or merging one set of operations.
///
/// Nothing is dropped silently: every rejected change is listed and
/// accompanied by a warning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictResolutionResult {
    pub success: bool,
    pub strategy: ResolutionStrategy,
    pub final_changes: Vec<MergedChange>,
    pub rejected_changes: Vec<EditChange>,
    pub deferred_operations: Vec<OperationId>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub requires_user_review: bool,
    pub fallback_required: bool,
    pub confidence: f64,
}

impl ConflictResolutionResult {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self {
            success: true,
            strategy,
            final_changes: Vec::new(),
            rejected_changes: Vec::new(),
            deferred_operations: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            requires_user_review: false,
            fallback_required: false,
            confidence: 1.0,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.errors.push(message.into());
    }

    pub fn final_change_ids(&self) -> Vec<ChangeId> {
        self.final_changes.iter().map(|m| m.change.id).collect()
    }
}
