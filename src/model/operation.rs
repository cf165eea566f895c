//! Edit operations: batches of changes submitted by one component

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::change::EditChange;
use super::conflict::ResolutionStrategy;

/// Unique identifier for an operation
pub type OperationId = Uuid;

/// Name of the component that submitted an operation (e.g. `"editor"`).
pub type SourceId = String;

/// Scheduling priority. Lower ordinal wins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Ordinal distance between two priorities.
    pub fn gap(self, other: Priority) -> u8 {
        self.ordinal().abs_diff(other.ordinal())
    }
}

/// Wildcard accepted in `mergeable_with`.
pub const ANY_SOURCE: &str = "*";

/// What an operation allows the coordinator to do with it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationCapabilities {
    /// Sources this operation may be auto-merged with. `"*"` allows any.
    pub mergeable_with: Vec<SourceId>,
    /// Whether overlapping changes may be merged automatically.
    pub supports_auto_merge: bool,
    /// Resolution strategies this operation accepts. Empty accepts all.
    pub supported_strategies: Vec<ResolutionStrategy>,
}

impl OperationCapabilities {
    pub fn can_merge_with(&self, source: &str) -> bool {
        self.mergeable_with
            .iter()
            .any(|s| s == ANY_SOURCE || s == source)
    }

    pub fn accepts(&self, strategy: ResolutionStrategy) -> bool {
        self.supported_strategies.is_empty() || self.supported_strategies.contains(&strategy)
    }
}

/// Scheduling hints attached to an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationMetadata {
    pub user_initiated: bool,
    pub estimated_processing_ms: u64,
    pub can_defer: bool,
    pub requires_user_review: bool,
    /// Correlation inherited from the event that triggered this operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for OperationMetadata {
    fn default() -> Self {
        Self {
            user_initiated: false,
            estimated_processing_ms: 0,
            can_defer: true,
            requires_user_review: false,
            correlation_id: None,
            description: None,
        }
    }
}

impl OperationMetadata {
    pub fn estimated_processing_time(&self) -> Duration {
        Duration::from_millis(self.estimated_processing_ms)
    }
}

/// A batch of edits submitted atomically by one component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditOperation {
    pub id: OperationId,
    pub source_id: SourceId,
    pub document_path: String,
    pub changes: Vec<EditChange>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub capabilities: OperationCapabilities,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

impl EditOperation {
    pub fn new(
        source_id: impl Into<SourceId>,
        document_path: impl Into<String>,
        priority: Priority,
        changes: Vec<EditChange>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            document_path: document_path.into(),
            changes,
            timestamp: Utc::now(),
            priority,
            capabilities: OperationCapabilities::default(),
            metadata: OperationMetadata::default(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_capabilities(mut self, capabilities: OperationCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_metadata(mut self, metadata: OperationMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Scheduling key: priority first, then submission time.
    pub fn schedule_key(&self) -> (Priority, DateTime<Utc>) {
        (self.priority, self.timestamp)
    }

    /// Range covering every change, or `None` for an empty operation.
    pub fn span(&self) -> Option<(usize, usize)> {
        let from = self.changes.iter().map(|c| c.from).min()?;
        let to = self.changes.iter().map(|c| c.to).max()?;
        Some((from, to))
    }

    /// True when any change of `self` overlaps any change of `other`.
    pub fn overlaps(&self, other: &EditOperation) -> bool {
        self.changes
            .iter()
            .any(|a| other.changes.iter().any(|b| a.overlaps(b)))
    }

    /// Mutual merge permission between two operations' sources.
    pub fn mutually_mergeable(&self, other: &EditOperation) -> bool {
        self.capabilities.can_merge_with(&other.source_id)
            && other.capabilities.can_merge_with(&self.source_id)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.document_path.trim().is_empty() {
            return Err(format!("operation {} has no document path", self.id));
        }
        if self.source_id.trim().is_empty() {
            return Err(format!("operation {} has no source", self.id));
        }
        if self.changes.is_empty() {
            return Err(format!("operation {} carries no changes", self.id));
        }
        for change in &self.changes {
            change.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Low < Priority::Background);
        assert_eq!(Priority::High.gap(Priority::Low), 2);
        assert_eq!(Priority::Background.ordinal(), 4);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_capabilities_wildcard() {
        let caps = OperationCapabilities {
            mergeable_with: vec![ANY_SOURCE.into()],
            ..Default::default()
        };
        assert!(caps.can_merge_with("proofreader"));
        assert!(!OperationCapabilities::default().can_merge_with("proofreader"));
        assert!(caps.accepts(ResolutionStrategy::PriorityWins));
    }

    #[test]
    fn test_span_and_validate() {
        let op = EditOperation::new(
            "editor",
            "notes.md",
            Priority::High,
            vec![EditChange::replace(10, 20, "bar"), EditChange::insert(40, "x")],
        );
        assert_eq!(op.span(), Some((10, 40)));
        assert!(op.validate().is_ok());

        let empty = EditOperation::new("editor", "notes.md", Priority::High, Vec::new());
        assert!(empty.validate().is_err());
        assert_eq!(empty.span(), None);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "id": "6f1c1b8e-3c1a-4b57-9d8e-1f0f3b3c2a10",
            "source_id": "proofreader",
            "document_path": "draft.md",
            "timestamp": "2024-01-01T00:00:00Z",
            "changes": [{ "id": "0b0c9c46-54f6-4b0b-8d7a-3c9f7f7d8e21", "kind": "insert", "from": 3, "to": 3, "text": "x" }]
        }"#;
        let op: EditOperation = serde_json::from_str(json).unwrap();
        assert_eq!(op.priority, Priority::Medium);
        assert!(op.metadata.can_defer);
        assert_eq!(op.changes.len(), 1);
    }
}
