//! Event Loop Guard
//!
//! Every event is placed in a correlation chain and run past four
//! detectors. The most severe action wins:
//!
//! - direct loop: repeats inside one chain, A -> B -> A oscillation, chain depth
//! - frequency: sustained rate and absolute count per (source, type)
//! - interaction saturation: events per source per second
//! - temporal: identical events in quick succession
//!
//! A terminated correlation stays inactive until it is swept; events that
//! still arrive for it are blocked. Other correlations are unaffected.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::LoopGuardConfig;
use crate::model::SourceId;

const ONE_SECOND: Duration = Duration::from_secs(1);

/// Prevention actions, least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreventionAction {
    Allow,
    Warn,
    Delay,
    Throttle,
    Block,
    TerminateChain,
}

impl PreventionAction {
    /// Whether the event may still be delivered.
    pub fn delivers(self) -> bool {
        self <= PreventionAction::Delay
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventChainNode {
    pub event_id: Uuid,
    pub event_type: String,
    pub source_id: SourceId,
    pub timestamp: Instant,
    pub correlation_id: Uuid,
    pub depth: usize,
    pub parent_event_id: Option<Uuid>,
}

/// All nodes sharing a root cause.
#[derive(Clone, Debug)]
pub struct Correlation {
    pub id: Uuid,
    pub chain: Vec<EventChainNode>,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub active: bool,
}

impl Correlation {
    fn new(id: Uuid, now: Instant) -> Self {
        Self {
            id,
            chain: Vec::new(),
            created_at: now,
            last_seen: now,
            active: true,
        }
    }

    fn repeats_of(&self, event_type: &str, source_id: &str) -> usize {
        self.chain
            .iter()
            .filter(|n| n.event_type == event_type && n.source_id == source_id)
            .count()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoopDecision {
    pub action: PreventionAction,
    pub reasons: Vec<String>,
    pub delay: Option<Duration>,
}

impl LoopDecision {
    fn allow() -> Self {
        Self {
            action: PreventionAction::Allow,
            reasons: Vec::new(),
            delay: None,
        }
    }

    fn escalate(&mut self, action: PreventionAction, reason: String) {
        self.action = self.action.max(action);
        self.reasons.push(reason);
    }
}

/// A node together with the decision taken for it.
#[derive(Clone, Debug)]
pub struct GuardedNode {
    pub node: EventChainNode,
    pub decision: LoopDecision,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GuardStats {
    pub events_seen: u64,
    pub allowed: u64,
    pub warned: u64,
    pub delayed: u64,
    pub throttled: u64,
    pub blocked: u64,
    pub terminated: u64,
    pub active_correlations: usize,
    pub inactive_correlations: usize,
    pub tracked_keys: usize,
    pub history_len: usize,
}

pub struct LoopGuard {
    config: LoopGuardConfig,
    correlations: HashMap<Uuid, Correlation>,
    /// (source, event type) -> timestamps inside `tracking_window`
    frequency: HashMap<(SourceId, String), VecDeque<Instant>>,
    /// source -> timestamps inside the last second
    interactions: HashMap<SourceId, VecDeque<Instant>>,
    history: VecDeque<EventChainNode>,
    stats: GuardStats,
}

impl LoopGuard {
    pub fn new(config: LoopGuardConfig) -> Self {
        Self {
            config,
            correlations: HashMap::new(),
            frequency: HashMap::new(),
            interactions: HashMap::new(),
            history: VecDeque::new(),
            stats: GuardStats::default(),
        }
    }

    pub fn config(&self) -> &LoopGuardConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: LoopGuardConfig) {
        self.config = config;
    }

    /// Build the chain node for an event and check it.
    pub fn observe(
        &mut self,
        event_id: Uuid,
        event_type: &str,
        source_id: &str,
        correlation_id: Option<Uuid>,
        parent_event_id: Option<Uuid>,
    ) -> GuardedNode {
        let now = Instant::now();
        let correlation_id = correlation_id.unwrap_or_else(Uuid::new_v4);
        let depth = self
            .correlations
            .get(&correlation_id)
            .map(|c| c.chain.len())
            .unwrap_or(0);

        let node = EventChainNode {
            event_id,
            event_type: event_type.to_string(),
            source_id: source_id.to_string(),
            timestamp: now,
            correlation_id,
            depth,
            parent_event_id,
        };
        let decision = self.check(&node);
        GuardedNode { node, decision }
    }

    /// Run every detector against `node`, then record it.
    pub fn check(&mut self, node: &EventChainNode) -> LoopDecision {
        let now = node.timestamp;
        self.stats.events_seen += 1;

        let correlation = self
            .correlations
            .entry(node.correlation_id)
            .or_insert_with(|| Correlation::new(node.correlation_id, now));
        correlation.last_seen = now;

        if !correlation.active {
            self.stats.blocked += 1;
            return LoopDecision {
                action: PreventionAction::Block,
                reasons: vec![format!("correlation {} was terminated", node.correlation_id)],
                delay: None,
            };
        }

        let key = (node.source_id.clone(), node.event_type.clone());
        let frequency = self.frequency.entry(key).or_default();
        frequency.push_back(now);
        prune_before(frequency, now, self.config.tracking_window);

        let interactions = self.interactions.entry(node.source_id.clone()).or_default();
        interactions.push_back(now);
        prune_before(interactions, now, ONE_SECOND);

        let mut decision = LoopDecision::allow();
        direct_loop(&self.config, correlation, node, &mut decision);
        frequency_loop(&self.config, frequency, now, &mut decision);
        saturation_loop(&self.config, interactions.len(), &node.source_id, &mut decision);
        temporal_loop(&self.config, frequency, now, &mut decision);

        correlation.chain.push(node.clone());
        if decision.action == PreventionAction::TerminateChain {
            correlation.active = false;
            log::error!(
                "Terminated event chain {} at {} from {}: {}",
                node.correlation_id,
                node.event_type,
                node.source_id,
                decision.reasons.join("; ")
            );
        } else if decision.action > PreventionAction::Allow {
            log::warn!(
                "{:?} {} from {}: {}",
                decision.action,
                node.event_type,
                node.source_id,
                decision.reasons.join("; ")
            );
        }
        if decision.action == PreventionAction::Delay {
            decision.delay = Some(self.config.delay);
        }

        self.history.push_back(node.clone());
        self.count(decision.action);
        decision
    }

    /// Whether a correlation is known and still active.
    pub fn is_active(&self, correlation_id: &Uuid) -> bool {
        self.correlations
            .get(correlation_id)
            .map(|c| c.active)
            .unwrap_or(false)
    }

    pub fn correlation(&self, correlation_id: &Uuid) -> Option<&Correlation> {
        self.correlations.get(correlation_id)
    }

    /// Drop history, idle correlations and stale trackers.
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&mut self, now: Instant) {
        prune_nodes_before(&mut self.history, now, self.config.history_retention);

        let ttl = self.config.correlation_ttl;
        let before = self.correlations.len();
        self.correlations
            .retain(|_, c| now.saturating_duration_since(c.last_seen) <= ttl);

        let window = self.config.tracking_window;
        self.frequency.retain(|_, stamps| {
            prune_before(stamps, now, window);
            !stamps.is_empty()
        });
        self.interactions.retain(|_, stamps| {
            prune_before(stamps, now, ONE_SECOND);
            !stamps.is_empty()
        });

        let dropped = before - self.correlations.len();
        if dropped > 0 {
            log::debug!("Loop guard swept {} idle correlations", dropped);
        }
    }

    pub fn stats(&self) -> GuardStats {
        let active = self.correlations.values().filter(|c| c.active).count();
        GuardStats {
            active_correlations: active,
            inactive_correlations: self.correlations.len() - active,
            tracked_keys: self.frequency.len(),
            history_len: self.history.len(),
            ..self.stats.clone()
        }
    }

    fn count(&mut self, action: PreventionAction) {
        let counter = match action {
            PreventionAction::Allow => &mut self.stats.allowed,
            PreventionAction::Warn => &mut self.stats.warned,
            PreventionAction::Delay => &mut self.stats.delayed,
            PreventionAction::Throttle => &mut self.stats.throttled,
            PreventionAction::Block => &mut self.stats.blocked,
            PreventionAction::TerminateChain => &mut self.stats.terminated,
        };
        *counter += 1;
    }
}

fn prune_before(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = stamps.front() {
        if now.saturating_duration_since(oldest) > window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

fn prune_nodes_before(nodes: &mut VecDeque<EventChainNode>, now: Instant, window: Duration) {
    while let Some(oldest) = nodes.front() {
        if now.saturating_duration_since(oldest.timestamp) > window {
            nodes.pop_front();
        } else {
            break;
        }
    }
}

/// Repeats, oscillation and depth within the node's correlation. `chain`
/// does not contain `node` yet.
fn direct_loop(
    config: &LoopGuardConfig,
    correlation: &Correlation,
    node: &EventChainNode,
    decision: &mut LoopDecision,
) {
    let repeats = correlation.repeats_of(&node.event_type, &node.source_id) + 1;
    if repeats >= config.max_repeats_in_chain {
        decision.escalate(
            PreventionAction::Block,
            format!("{} from {} repeated {} times in one chain", node.event_type, node.source_id, repeats),
        );
    }

    if let [.., before, previous] = correlation.chain.as_slice() {
        let oscillates = before.source_id == node.source_id
            && previous.source_id != node.source_id
            && before.event_type == node.event_type
            && previous.event_type == node.event_type
            && node.timestamp.saturating_duration_since(before.timestamp) <= config.oscillation_window;
        if oscillates {
            decision.escalate(
                PreventionAction::Throttle,
                format!(
                    "{} bouncing between {} and {}",
                    node.event_type, node.source_id, previous.source_id
                ),
            );
        }
    }

    if node.depth > config.max_chain_depth {
        decision.escalate(
            PreventionAction::TerminateChain,
            format!("chain depth {} exceeds {}", node.depth, config.max_chain_depth),
        );
    } else if node.depth > config.max_chain_depth / 2 {
        decision.escalate(
            PreventionAction::Warn,
            format!("chain depth {} approaching {}", node.depth, config.max_chain_depth),
        );
    }
}

/// Sustained rate over the last second and absolute count over the
/// tracking window. `stamps` already contains the current event.
fn frequency_loop(config: &LoopGuardConfig, stamps: &VecDeque<Instant>, now: Instant, decision: &mut LoopDecision) {
    let recent: Vec<Instant> = stamps
        .iter()
        .copied()
        .filter(|t| now.saturating_duration_since(*t) <= ONE_SECOND)
        .collect();
    if recent.len() >= 3 {
        let span = now.saturating_duration_since(recent[0]).max(config.rate_min_span);
        let rate = (recent.len() - 1) as f64 / span.as_secs_f64();
        if rate > config.max_events_per_second {
            decision.escalate(
                PreventionAction::Throttle,
                format!("{:.1} events/s exceeds {:.1}", rate, config.max_events_per_second),
            );
        }
    }

    if stamps.len() >= config.max_events_per_window {
        decision.escalate(
            PreventionAction::TerminateChain,
            format!(
                "{} events within {:?} (limit {})",
                stamps.len(),
                config.tracking_window,
                config.max_events_per_window
            ),
        );
    }
}

fn saturation_loop(config: &LoopGuardConfig, per_second: usize, source_id: &str, decision: &mut LoopDecision) {
    if per_second > config.max_interactions_per_second {
        decision.escalate(
            PreventionAction::Delay,
            format!(
                "{} issued {} events in one second (limit {})",
                source_id, per_second, config.max_interactions_per_second
            ),
        );
    }
}

fn temporal_loop(config: &LoopGuardConfig, stamps: &VecDeque<Instant>, now: Instant, decision: &mut LoopDecision) {
    let burst = stamps
        .iter()
        .filter(|t| now.saturating_duration_since(**t) <= config.rapid_fire_window)
        .count();
    if burst >= config.rapid_fire_count {
        decision.escalate(
            PreventionAction::Delay,
            format!("{} identical events within {:?}", burst, config.rapid_fire_window),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> LoopGuard {
        LoopGuard::new(LoopGuardConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_burst_escalates_monotonically() {
        let mut guard = guard();
        let mut actions = Vec::new();
        for _ in 0..5 {
            let guarded = guard.observe(Uuid::new_v4(), "Y", "X", None, None);
            actions.push(guarded.decision.action);
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert!(actions.windows(2).all(|w| w[0] <= w[1]), "{:?}", actions);
        assert!(actions[3] >= PreventionAction::Throttle, "{:?}", actions);
        assert_eq!(actions[0], PreventionAction::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeats_in_one_chain_block() {
        let mut guard = guard();
        let correlation = Uuid::new_v4();
        let mut actions = Vec::new();
        for _ in 0..3 {
            actions.push(guard.observe(Uuid::new_v4(), "changes_merged", "ai", Some(correlation), None).decision.action);
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert_eq!(actions, vec![PreventionAction::Allow, PreventionAction::Allow, PreventionAction::Block]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oscillation_throttles() {
        let mut guard = guard();
        let correlation = Uuid::new_v4();
        guard.observe(Uuid::new_v4(), "edit", "a", Some(correlation), None);
        tokio::time::advance(Duration::from_millis(100)).await;
        guard.observe(Uuid::new_v4(), "edit", "b", Some(correlation), None);
        tokio::time::advance(Duration::from_millis(100)).await;
        let decision = guard.observe(Uuid::new_v4(), "edit", "a", Some(correlation), None).decision;
        assert_eq!(decision.action, PreventionAction::Throttle);

        // Too slow to count as ping-pong.
        let slow = Uuid::new_v4();
        guard.observe(Uuid::new_v4(), "edit", "c", Some(slow), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        guard.observe(Uuid::new_v4(), "edit", "d", Some(slow), None);
        tokio::time::advance(Duration::from_secs(1)).await;
        let decision = guard.observe(Uuid::new_v4(), "edit", "c", Some(slow), None).decision;
        assert_eq!(decision.action, PreventionAction::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_depth_terminates_only_owning_chain() {
        let mut guard = LoopGuard::new(LoopGuardConfig {
            max_chain_depth: 4,
            ..Default::default()
        });
        let runaway = Uuid::new_v4();
        let mut last = PreventionAction::Allow;
        for i in 0..6 {
            last = guard
                .observe(Uuid::new_v4(), &format!("step_{}", i), &format!("source_{}", i), Some(runaway), None)
                .decision
                .action;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(last, PreventionAction::TerminateChain);
        assert!(!guard.is_active(&runaway));

        let blocked = guard.observe(Uuid::new_v4(), "later", "other", Some(runaway), None).decision;
        assert_eq!(blocked.action, PreventionAction::Block);

        let unrelated = guard.observe(Uuid::new_v4(), "later", "other", None, None).decision;
        assert_eq!(unrelated.action, PreventionAction::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_count_terminates() {
        let mut guard = LoopGuard::new(LoopGuardConfig {
            max_events_per_window: 5,
            ..Default::default()
        });
        let mut actions = Vec::new();
        for _ in 0..5 {
            actions.push(guard.observe(Uuid::new_v4(), "tick", "timer", None, None).decision.action);
            tokio::time::advance(Duration::from_millis(900)).await;
        }
        assert_eq!(actions[..4], [PreventionAction::Allow; 4]);
        assert_eq!(actions[4], PreventionAction::TerminateChain);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation_delays() {
        let mut guard = LoopGuard::new(LoopGuardConfig {
            max_interactions_per_second: 3,
            ..Default::default()
        });
        let mut last = None;
        for i in 0..4 {
            last = Some(guard.observe(Uuid::new_v4(), &format!("kind_{}", i), "chatty", None, None).decision);
            tokio::time::advance(Duration::from_millis(200)).await;
        }
        let decision = last.expect("decision");
        assert_eq!(decision.action, PreventionAction::Delay);
        assert_eq!(decision.delay, Some(Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_bounds_state() {
        let mut guard = guard();
        for i in 0..20 {
            guard.observe(Uuid::new_v4(), "e", &format!("s{}", i), None, None);
        }
        assert_eq!(guard.stats().active_correlations, 20);

        tokio::time::advance(Duration::from_secs(120)).await;
        guard.sweep();

        let stats = guard.stats();
        assert_eq!(stats.active_correlations, 0);
        assert_eq!(stats.tracked_keys, 0);
        assert_eq!(stats.history_len, 0);
        assert_eq!(stats.events_seen, 20);
    }
}
