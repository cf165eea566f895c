//! Conflict Detector
//!
//! Finds every conflict in a priority-sorted batch of operations for one
//! document. The analysis itself sits behind [`ConflictAnalyzer`] so the
//! rule engine can be swapped; results are cached by a SHA-256 of the
//! batch. A failing analyzer is retried once after the cache is purged and
//! then the detector fails open with an empty conflict set.

pub mod rules;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::DetectionConfig;
use crate::error::CoordinationError;
use crate::model::{ChangeConflict, EditOperation};

/// Pluggable conflict analysis.
#[async_trait]
pub trait ConflictAnalyzer: Send + Sync {
    /// Analyze a priority-sorted batch for one document.
    async fn analyze(
        &self,
        operations: &[EditOperation],
        config: &DetectionConfig,
    ) -> Result<Vec<ChangeConflict>, CoordinationError>;

    fn name(&self) -> &str;
}

/// The built-in rules from [`rules`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedAnalyzer;

#[async_trait]
impl ConflictAnalyzer for RuleBasedAnalyzer {
    async fn analyze(
        &self,
        operations: &[EditOperation],
        config: &DetectionConfig,
    ) -> Result<Vec<ChangeConflict>, CoordinationError> {
        Ok(rules::detect_all(operations, config))
    }

    fn name(&self) -> &str {
        "rules"
    }
}

/// What one detection call produced.
#[derive(Clone, Debug, Default)]
pub struct DetectionReport {
    pub conflicts: Vec<ChangeConflict>,
    pub cache_hit: bool,
    /// Set when the analyzer failed twice and the detector returned nothing.
    pub failed_open: Option<String>,
}

/// Counters exposed for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetectionStats {
    pub runs: u64,
    pub cache_hits: u64,
    pub recoveries: u64,
    pub failed_open: u64,
}

pub struct ConflictDetector {
    config: DetectionConfig,
    analyzer: Arc<dyn ConflictAnalyzer>,
    cache: HashMap<String, Vec<ChangeConflict>>,
    cache_order: VecDeque<String>,
    stats: DetectionStats,
}

impl ConflictDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self::with_analyzer(config, Arc::new(RuleBasedAnalyzer))
    }

    pub fn with_analyzer(config: DetectionConfig, analyzer: Arc<dyn ConflictAnalyzer>) -> Self {
        Self {
            config,
            analyzer,
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            stats: DetectionStats::default(),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Replace the configuration. Cached results were computed under the old
    /// thresholds, so the cache is cleared.
    pub fn set_config(&mut self, config: DetectionConfig) {
        if config != self.config {
            self.clear_cache();
        }
        self.config = config;
    }

    pub fn stats(&self) -> &DetectionStats {
        &self.stats
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.cache_order.clear();
    }

    /// Hex SHA-256 of the serialized batch.
    pub fn content_hash(operations: &[EditOperation]) -> Result<String, CoordinationError> {
        let bytes = serde_json::to_vec(operations)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Detect conflicts in `operations`. Never fails: analyzer errors are
    /// reported in the returned [`DetectionReport`].
    pub async fn detect(&mut self, operations: &[EditOperation]) -> DetectionReport {
        self.stats.runs += 1;

        if operations.len() < 2 {
            return DetectionReport::default();
        }

        let key = match Self::content_hash(operations) {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("Could not hash batch, detecting without cache: {}", e);
                None
            }
        };

        if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)) {
            self.stats.cache_hits += 1;
            return DetectionReport {
                conflicts: hit.clone(),
                cache_hit: true,
                failed_open: None,
            };
        }

        let conflicts = match self.analyzer.analyze(operations, &self.config).await {
            Ok(conflicts) => conflicts,
            Err(first) => {
                log::warn!(
                    "Analyzer '{}' failed ({}), purging cache and retrying",
                    self.analyzer.name(),
                    first
                );
                self.recover();
                match self.analyzer.analyze(operations, &self.config).await {
                    Ok(conflicts) => conflicts,
                    Err(second) => {
                        self.stats.failed_open += 1;
                        log::error!(
                            "Analyzer '{}' failed again, continuing without conflicts: {}",
                            self.analyzer.name(),
                            second
                        );
                        return DetectionReport {
                            conflicts: Vec::new(),
                            cache_hit: false,
                            failed_open: Some(second.to_string()),
                        };
                    }
                }
            }
        };

        log::debug!(
            "Detected {} conflicts among {} operations",
            conflicts.len(),
            operations.len()
        );

        if let Some(key) = key {
            self.store(key, conflicts.clone());
        }

        DetectionReport {
            conflicts,
            cache_hit: false,
            failed_open: None,
        }
    }

    fn recover(&mut self) {
        self.stats.recoveries += 1;
        self.clear_cache();
    }

    fn store(&mut self, key: String, conflicts: Vec<ChangeConflict>) {
        if self.config.cache_capacity == 0 {
            return;
        }
        while self.cache.len() >= self.config.cache_capacity {
            match self.cache_order.pop_front() {
                Some(oldest) => {
                    self.cache.remove(&oldest);
                }
                None => break,
            }
        }
        if self.cache.insert(key.clone(), conflicts).is_none() {
            self.cache_order.push_back(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConflictType, EditChange, Priority};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn overlapping_pair() -> Vec<EditOperation> {
        vec![
            EditOperation::new("editor", "doc.md", Priority::High, vec![EditChange::replace(10, 20, "bar")]),
            EditOperation::new("ai", "doc.md", Priority::Medium, vec![EditChange::insert(15, "baz")]),
        ]
    }

    /// Fails the first `failures` calls, then delegates to the rules.
    struct FlakyAnalyzer {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConflictAnalyzer for FlakyAnalyzer {
        async fn analyze(
            &self,
            operations: &[EditOperation],
            config: &DetectionConfig,
        ) -> Result<Vec<ChangeConflict>, CoordinationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(CoordinationError::ConflictDetection("analyzer unavailable".into()));
            }
            Ok(rules::detect_all(operations, config))
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_detects_and_caches() {
        let mut detector = ConflictDetector::new(DetectionConfig::default());
        let ops = overlapping_pair();

        let first = detector.detect(&ops).await;
        assert!(!first.cache_hit);
        assert!(first
            .conflicts
            .iter()
            .any(|c| c.conflict_type == ConflictType::OverlappingEdits));

        let second = detector.detect(&ops).await;
        assert!(second.cache_hit);
        assert_eq!(second.conflicts.len(), first.conflicts.len());
        assert_eq!(detector.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_single_operation_has_no_conflicts() {
        let mut detector = ConflictDetector::new(DetectionConfig::default());
        let ops = vec![EditOperation::new("editor", "doc.md", Priority::High, vec![EditChange::delete(0, 5)])];
        assert!(detector.detect(&ops).await.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_config_change_invalidates_cache() {
        let mut detector = ConflictDetector::new(DetectionConfig::default());
        detector.detect(&overlapping_pair()).await;
        assert_eq!(detector.cached_entries(), 1);

        detector.set_config(DetectionConfig::default());
        assert_eq!(detector.cached_entries(), 1);

        detector.set_config(DetectionConfig {
            overlap_tolerance: 10,
            ..Default::default()
        });
        assert_eq!(detector.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let mut detector = ConflictDetector::new(DetectionConfig {
            cache_capacity: 2,
            ..Default::default()
        });
        for _ in 0..5 {
            detector.detect(&overlapping_pair()).await;
        }
        assert_eq!(detector.cached_entries(), 2);
    }

    #[tokio::test]
    async fn test_recovers_after_one_failure() {
        let analyzer = Arc::new(FlakyAnalyzer {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let mut detector = ConflictDetector::with_analyzer(DetectionConfig::default(), analyzer.clone());

        let report = detector.detect(&overlapping_pair()).await;
        assert!(report.failed_open.is_none());
        assert!(!report.conflicts.is_empty());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(detector.stats().recoveries, 1);
    }

    #[tokio::test]
    async fn test_fails_open_after_second_failure() {
        let analyzer = Arc::new(FlakyAnalyzer {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let mut detector = ConflictDetector::with_analyzer(DetectionConfig::default(), analyzer.clone());

        let report = detector.detect(&overlapping_pair()).await;
        assert!(report.conflicts.is_empty());
        assert!(report.failed_open.is_some());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(detector.stats().failed_open, 1);
        assert_eq!(detector.cached_entries(), 0);
    }
}
