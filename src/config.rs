//! Coordinator configuration
//!
//! Every knob the pipeline reads lives in one of the domain structs below.
//! All of them have documented defaults and deserialize with
//! `#[serde(default)]`, so a JSON file only needs to name the values it
//! overrides. Durations are written as milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoordinationError;

/// Serialize `Duration` fields as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Top-level configuration handed to the coordinator at construction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub lock: LockConfig,
    pub scheduler: SchedulerConfig,
    pub detection: DetectionConfig,
    pub merge: MergeConfig,
    pub loop_guard: LoopGuardConfig,
}

impl CoordinatorConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, CoordinationError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoordinationError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.scheduler.max_batch_size == 0 {
            return Err(CoordinationError::Config("scheduler.max_batch_size must be at least 1".into()));
        }
        if self.scheduler.max_queue_size == 0 {
            return Err(CoordinationError::Config("scheduler.max_queue_size must be at least 1".into()));
        }
        if self.lock.max_acquire_attempts == 0 {
            return Err(CoordinationError::Config("lock.max_acquire_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.merge.confidence_threshold) {
            return Err(CoordinationError::Config(format!(
                "merge.confidence_threshold must be within [0, 1], got {}",
                self.merge.confidence_threshold
            )));
        }
        if self.detection.contention_threshold < 2 {
            return Err(CoordinationError::Config("detection.contention_threshold must be at least 2".into()));
        }
        if self.loop_guard.sweep_interval.is_zero() {
            return Err(CoordinationError::Config("loop_guard.sweep_interval must be positive".into()));
        }
        if self.loop_guard.max_events_per_second <= 0.0 {
            return Err(CoordinationError::Config("loop_guard.max_events_per_second must be positive".into()));
        }
        Ok(())
    }
}

/// Document Lock Manager settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Added to an operation's estimated processing time to get the lock expiry.
    #[serde(with = "millis")]
    pub expiry_buffer: Duration,
    /// Wait between lock attempts inside a processing pass.
    #[serde(with = "millis")]
    pub acquire_retry_interval: Duration,
    /// Attempts before a pass gives up with `LockAcquisition`.
    pub max_acquire_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expiry_buffer: Duration::from_secs(5),
            acquire_retry_interval: Duration::from_millis(250),
            max_acquire_attempts: 3,
        }
    }
}

/// Weights of the queue priority score. The defaults are a starting point,
/// not a tuned optimum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub priority: f64,
    pub age: f64,
    pub user_initiated: f64,
    /// Age at which the age component saturates.
    #[serde(with = "millis")]
    pub age_horizon: Duration,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            priority: 0.5,
            age: 0.3,
            user_initiated: 0.2,
            age_horizon: Duration::from_secs(30),
        }
    }
}

/// Operation Scheduler settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Operations accepted per document queue.
    pub max_queue_size: usize,
    /// Operations consolidated together in one processing pass.
    pub max_batch_size: usize,
    /// A document consolidated this recently still routes new submissions
    /// through the queue.
    #[serde(with = "millis")]
    pub recent_consolidation_window: Duration,
    /// Delay before a deferred operation is resubmitted.
    #[serde(with = "millis")]
    pub defer_delay: Duration,
    pub weights: ScoringWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 256,
            max_batch_size: 32,
            recent_consolidation_window: Duration::from_secs(5),
            defer_delay: Duration::from_secs(1),
            weights: ScoringWeights::default(),
        }
    }
}

/// Weights of the overlap risk score used to grade overlapping edits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub overlap: f64,
    pub destructive: f64,
    pub semantic_uncertainty: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            overlap: 0.5,
            destructive: 0.3,
            semantic_uncertainty: 0.2,
        }
    }
}

/// Conflict Detector settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Overlap (in characters) tolerated before two ranges conflict.
    pub overlap_tolerance: usize,
    /// Intention compatibility below this is a semantic conflict.
    pub semantic_threshold: f64,
    /// Changes further apart than this are not compared semantically.
    pub semantic_proximity: usize,
    /// Priority gap (in ordinal steps) above which nearby operations conflict.
    pub priority_gap_threshold: u8,
    /// Operation spans within this distance count as touching for priority conflicts.
    pub priority_proximity: usize,
    /// Batches larger than this raise a resource contention conflict.
    pub contention_threshold: usize,
    /// Detection results kept in the content-hash cache.
    pub cache_capacity: usize,
    pub risk_weights: RiskWeights,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            overlap_tolerance: 3,
            semantic_threshold: 0.3,
            semantic_proximity: 100,
            priority_gap_threshold: 1,
            priority_proximity: 0,
            contention_threshold: 8,
            cache_capacity: 64,
            risk_weights: RiskWeights::default(),
        }
    }
}

/// Change Merging Engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Merges below this confidence require user review.
    pub confidence_threshold: f64,
    /// Largest priority gap (ordinal steps) allowed inside a merge group.
    pub max_priority_gap: u8,
    /// Minimum intention compatibility for the semantic strategy.
    pub semantic_threshold: f64,
    /// Annotated changes closer than this must be compatible to merge.
    pub semantic_proximity: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            max_priority_gap: 2,
            semantic_threshold: 0.3,
            semantic_proximity: 100,
        }
    }
}

/// Event Loop Guard settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopGuardConfig {
    /// Correlation chains deeper than this are terminated.
    pub max_chain_depth: usize,
    /// Identical (type, source) entries in one chain before blocking.
    pub max_repeats_in_chain: usize,
    /// Window for A -> B -> A oscillation.
    #[serde(with = "millis")]
    pub oscillation_window: Duration,
    /// Sustained rate per (source, type) above which events are throttled.
    pub max_events_per_second: f64,
    /// Floor on the span used when estimating a rate from a short burst.
    #[serde(with = "millis")]
    pub rate_min_span: Duration,
    /// Events per (source, type) inside `tracking_window` before the chain is terminated.
    pub max_events_per_window: usize,
    #[serde(with = "millis")]
    pub tracking_window: Duration,
    /// Events per source per second before delaying.
    pub max_interactions_per_second: usize,
    /// Window for identical rapid-fire events.
    #[serde(with = "millis")]
    pub rapid_fire_window: Duration,
    /// Identical events inside `rapid_fire_window` before delaying.
    pub rapid_fire_count: usize,
    /// Delay applied to `Delay` decisions.
    #[serde(with = "millis")]
    pub delay: Duration,
    /// Correlations idle for this long are dropped.
    #[serde(with = "millis")]
    pub correlation_ttl: Duration,
    /// Event history older than this is pruned.
    #[serde(with = "millis")]
    pub history_retention: Duration,
    /// Period of the background sweep.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: 64,
            max_repeats_in_chain: 3,
            oscillation_window: Duration::from_millis(500),
            max_events_per_second: 10.0,
            rate_min_span: Duration::from_millis(100),
            max_events_per_window: 100,
            tracking_window: Duration::from_secs(10),
            max_interactions_per_second: 50,
            rapid_fire_window: Duration::from_millis(100),
            rapid_fire_count: 3,
            delay: Duration::from_millis(200),
            correlation_ttl: Duration::from_secs(30),
            history_retention: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_overrides_defaults() {
        let config = CoordinatorConfig::from_json_str(
            r#"{ "detection": { "overlap_tolerance": 5 }, "lock": { "expiry_buffer": 1500 } }"#,
        )
        .unwrap();

        assert_eq!(config.detection.overlap_tolerance, 5);
        assert_eq!(config.lock.expiry_buffer, Duration::from_millis(1500));
        assert_eq!(config.merge, MergeConfig::default());
        assert_eq!(config.loop_guard.rapid_fire_window, Duration::from_millis(100));
    }

    #[test]
    fn test_roundtrip_preserves_durations() {
        let config = CoordinatorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"defer_delay\":1000"));
        assert_eq!(CoordinatorConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let result = CoordinatorConfig::from_json_str(r#"{ "merge": { "confidence_threshold": 1.5 } }"#);
        assert!(matches!(result, Err(CoordinationError::Config(_))));

        let result = CoordinatorConfig::from_json_str(r#"{ "scheduler": { "max_batch_size": 0 } }"#);
        assert!(matches!(result, Err(CoordinationError::Config(_))));
    }
}
