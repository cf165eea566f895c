//! Detected conflicts and the audit trail of their resolution

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::change::{ChangeId, EditChange};
use super::merge::MergedChange;
use super::operation::OperationId;

/// Unique identifier for a conflict
pub type ConflictId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    OverlappingEdits,
    SemanticConflict,
    DependencyViolation,
    ResourceContention,
    PriorityConflict,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictType::OverlappingEdits => "overlapping_edits",
            ConflictType::SemanticConflict => "semantic_conflict",
            ConflictType::DependencyViolation => "dependency_violation",
            ConflictType::ResourceContention => "resource_contention",
            ConflictType::PriorityConflict => "priority_conflict",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Grade a risk score in `[0, 1]`.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Severity::Critical
        } else if score >= 0.6 {
            Severity::High
        } else if score >= 0.4 {
            Severity::Medium
        } else if score >= 0.2 {
            Severity::Low
        } else {
            Severity::Info
        }
    }
}

/// How a conflict gets resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    MergeCompatible,
    PriorityWins,
    SequentialProcessing,
    SemanticMerge,
    DeferOperation,
    UserChoice,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionStrategy::MergeCompatible => "merge_compatible",
            ResolutionStrategy::PriorityWins => "priority_wins",
            ResolutionStrategy::SequentialProcessing => "sequential_processing",
            ResolutionStrategy::SemanticMerge => "semantic_merge",
            ResolutionStrategy::DeferOperation => "defer_operation",
            ResolutionStrategy::UserChoice => "user_choice",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved,
    ResolvedWithReview,
    FellBack,
}

/// Audit record attached to a conflict once it has been resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub outcome: ResolutionOutcome,
    pub applied_by: String,
    pub started_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub original_changes: Vec<EditChange>,
    pub merged_changes: Vec<MergedChange>,
    pub rejected_changes: Vec<EditChange>,
}

/// An incompatibility between two or more operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeConflict {
    pub id: ConflictId,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub operations: Vec<OperationId>,
    pub changes: Vec<ChangeId>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl ChangeConflict {
    pub fn new(
        conflict_type: ConflictType,
        severity: Severity,
        operations: Vec<OperationId>,
        changes: Vec<ChangeId>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conflict_type,
            severity,
            operations,
            changes,
            description: description.into(),
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    pub fn involves(&self, operation_id: &OperationId) -> bool {
        self.operations.contains(operation_id)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_score() {
        assert_eq!(Severity::from_score(0.05), Severity::Info);
        assert_eq!(Severity::from_score(0.25), Severity::Low);
        assert_eq!(Severity::from_score(0.4), Severity::Medium);
        assert_eq!(Severity::from_score(0.75), Severity::High);
        assert_eq!(Severity::from_score(0.95), Severity::Critical);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn test_display_matches_serde_names() {
        let json = serde_json::to_string(&ConflictType::OverlappingEdits).unwrap();
        assert_eq!(json, format!("\"{}\"", ConflictType::OverlappingEdits));
        let json = serde_json::to_string(&ResolutionStrategy::DeferOperation).unwrap();
        assert_eq!(json, format!("\"{}\"", ResolutionStrategy::DeferOperation));
    }
}
