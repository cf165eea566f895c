// Scrivener - edit consolidation for documents with many writers

pub mod config;
pub mod coordinator;
pub mod detect;
pub mod error;
pub mod events;
pub mod guard;
pub mod lock;
pub mod merge;
pub mod model;
pub mod resolve;
pub mod scheduler;

pub use config::CoordinatorConfig;
pub use coordinator::{ConsolidationCoordinator, ConsolidationOutcome};
pub use detect::{ConflictAnalyzer, ConflictDetector, RuleBasedAnalyzer};
pub use error::{CoordinationError, Result};
pub use events::{ConsolidationEvent, EventBus, EventPayload};
pub use guard::{LoopGuard, PreventionAction};
pub use lock::DocumentLockManager;
pub use merge::ChangeMergingEngine;
pub use resolve::ConflictResolver;
pub use scheduler::OperationScheduler;
