//! Data model shared by every component
//!
//! Changes, operations, locks, conflicts and merge products. Changes are
//! immutable once created; merges supersede them with new changes.

mod change;
mod conflict;
mod lock;
mod merge;
mod operation;

pub use change::{ChangeId, ChangeKind, EditChange, EditScope, Intention, SemanticContext};
pub use conflict::{
    ChangeConflict, ConflictId, ConflictResolution, ConflictType, ResolutionOutcome,
    ResolutionStrategy, Severity,
};
pub use lock::{DocumentLock, LockId, LockType};
pub use merge::{ConflictResolutionResult, MergeStrategyKind, MergedChange};
pub use operation::{
    EditOperation, OperationCapabilities, OperationId, OperationMetadata, Priority, SourceId,
    ANY_SOURCE,
};
