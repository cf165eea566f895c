//! Built-in conflict rules
//!
//! Each rule looks at the whole batch and reports at most one conflict per
//! pair of operations. The detector returns the union of all rules.

use std::collections::{BTreeMap, HashMap};

use crate::config::DetectionConfig;
use crate::merge::{application_cmp, dependency_violations};
use crate::model::{
    ChangeConflict, ChangeId, ChangeKind, ConflictType, EditChange, EditOperation, OperationId, Severity,
};

/// Run every rule over a priority-sorted batch.
pub fn detect_all(operations: &[EditOperation], config: &DetectionConfig) -> Vec<ChangeConflict> {
    let mut conflicts = Vec::new();
    conflicts.extend(overlapping_edits(operations, config));
    conflicts.extend(semantic_conflicts(operations, config));
    conflicts.extend(dependency_conflicts(operations));
    conflicts.extend(priority_conflicts(operations, config));
    conflicts.extend(resource_contention(operations, config));
    conflicts
}

/// Accumulates the change pairs found between two operations.
struct PairFindings {
    changes: Vec<ChangeId>,
    severity: Severity,
    notes: Vec<String>,
}

impl PairFindings {
    fn new() -> Self {
        Self {
            changes: Vec::new(),
            severity: Severity::Info,
            notes: Vec::new(),
        }
    }

    fn record(&mut self, a: &EditChange, b: &EditChange, severity: Severity, note: String) {
        for id in [a.id, b.id] {
            if !self.changes.contains(&id) {
                self.changes.push(id);
            }
        }
        self.severity = self.severity.max(severity);
        self.notes.push(note);
    }
}

fn pairs(operations: &[EditOperation]) -> impl Iterator<Item = (&EditOperation, &EditOperation)> {
    operations
        .iter()
        .enumerate()
        .flat_map(move |(i, a)| operations[i + 1..].iter().map(move |b| (a, b)))
}

/// Weighted risk of two overlapping changes, in `[0, 1]`.
fn overlap_risk(a: &EditChange, b: &EditChange, measured: usize, config: &DetectionConfig) -> f64 {
    let weights = &config.risk_weights;
    let ratio = (measured as f64 / a.footprint().min(b.footprint()) as f64).min(1.0);
    let destructive = [a, b].iter().filter(|c| c.kind.is_destructive()).count() as f64 / 2.0;
    // Missing context means unknown intent, which is treated as incompatible.
    let uncertainty = match (&a.semantic_context, &b.semantic_context) {
        (Some(ca), Some(cb)) => 1.0 - ca.confidence.min(cb.confidence),
        _ => 1.0,
    };
    (weights.overlap * ratio + weights.destructive * destructive + weights.semantic_uncertainty * uncertainty)
        .clamp(0.0, 1.0)
}

/// Changes whose ranges intersect by more than the tolerance, inserts that
/// land inside another change's range, and inserts at a shared position.
pub fn overlapping_edits(operations: &[EditOperation], config: &DetectionConfig) -> Vec<ChangeConflict> {
    let mut conflicts = Vec::new();

    for (op_a, op_b) in pairs(operations) {
        let mut findings = PairFindings::new();

        for a in &op_a.changes {
            for b in &op_b.changes {
                if a.same_insert_point(b) {
                    findings.record(a, b, Severity::Low, format!("both insert at {}", a.from));
                    continue;
                }

                let inside = a.lands_inside(b) || b.lands_inside(a);
                let shared = a.overlap_len(b);
                if !inside && shared <= config.overlap_tolerance {
                    continue;
                }

                let measured = if inside {
                    if a.kind == ChangeKind::Insert { a.footprint() } else { b.footprint() }
                } else {
                    shared
                };
                let mut severity = Severity::from_score(overlap_risk(a, b, measured, config));
                if inside {
                    severity = severity.max(Severity::Medium);
                }
                findings.record(
                    a,
                    b,
                    severity,
                    format!("{}..{} and {}..{} overlap", a.from, a.to, b.from, b.to),
                );
            }
        }

        if !findings.changes.is_empty() {
            conflicts.push(ChangeConflict::new(
                ConflictType::OverlappingEdits,
                findings.severity,
                vec![op_a.id, op_b.id],
                findings.changes,
                format!(
                    "{} and {} edit the same text: {}",
                    op_a.source_id,
                    op_b.source_id,
                    findings.notes.join("; ")
                ),
            ));
        }
    }

    conflicts
}

/// Annotated changes close to each other whose intentions do not mix.
pub fn semantic_conflicts(operations: &[EditOperation], config: &DetectionConfig) -> Vec<ChangeConflict> {
    let mut conflicts = Vec::new();

    for (op_a, op_b) in pairs(operations) {
        let mut findings = PairFindings::new();

        for a in &op_a.changes {
            for b in &op_b.changes {
                let (Some(ca), Some(cb)) = (&a.semantic_context, &b.semantic_context) else {
                    continue;
                };
                if !a.semantically_near(b, config.semantic_proximity) {
                    continue;
                }
                let compatibility = ca.compatibility_with(cb);
                if compatibility >= config.semantic_threshold {
                    continue;
                }
                let severity = if compatibility < 0.15 {
                    Severity::High
                } else if compatibility < 0.25 {
                    Severity::Medium
                } else {
                    Severity::Low
                };
                findings.record(
                    a,
                    b,
                    severity,
                    format!("{:?} vs {:?} ({:.2})", ca.intention, cb.intention, compatibility),
                );
            }
        }

        if !findings.changes.is_empty() {
            conflicts.push(ChangeConflict::new(
                ConflictType::SemanticConflict,
                findings.severity,
                vec![op_a.id, op_b.id],
                findings.changes,
                format!(
                    "{} and {} pursue incompatible intentions: {}",
                    op_a.source_id,
                    op_b.source_id,
                    findings.notes.join("; ")
                ),
            ));
        }
    }

    conflicts
}

/// Changes that would be applied before a change they depend on.
pub fn dependency_conflicts(operations: &[EditOperation]) -> Vec<ChangeConflict> {
    let mut owner: HashMap<ChangeId, OperationId> = HashMap::new();
    let mut all: Vec<&EditChange> = Vec::new();
    for op in operations {
        for change in &op.changes {
            owner.insert(change.id, op.id);
            all.push(change);
        }
    }
    all.sort_by(|a, b| application_cmp(a, b));

    // Keyed by (dependent op, dependency op); BTreeMap keeps output stable.
    let mut grouped: BTreeMap<(OperationId, OperationId), Vec<ChangeId>> = BTreeMap::new();
    for violation in dependency_violations(all) {
        let (Some(&dependent_op), Some(&dependency_op)) =
            (owner.get(&violation.dependent), owner.get(&violation.dependency))
        else {
            continue;
        };
        let ids = grouped.entry((dependent_op, dependency_op)).or_default();
        for id in [violation.dependent, violation.dependency] {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    grouped
        .into_iter()
        .map(|((dependent_op, dependency_op), changes)| {
            let mut involved = vec![dependent_op];
            if dependency_op != dependent_op {
                involved.push(dependency_op);
            }
            ChangeConflict::new(
                ConflictType::DependencyViolation,
                Severity::Medium,
                involved,
                changes,
                format!(
                    "operation {} has changes ordered before changes they depend on in operation {}",
                    dependent_op, dependency_op
                ),
            )
        })
        .collect()
}

fn span_distance(a: (usize, usize), b: (usize, usize)) -> usize {
    if a.1 < b.0 {
        b.0 - a.1
    } else if b.1 < a.0 {
        a.0 - b.1
    } else {
        0
    }
}

/// Operations working on the same region with clearly different priorities.
pub fn priority_conflicts(operations: &[EditOperation], config: &DetectionConfig) -> Vec<ChangeConflict> {
    let mut conflicts = Vec::new();

    for (op_a, op_b) in pairs(operations) {
        let gap = op_a.priority.gap(op_b.priority);
        if gap <= config.priority_gap_threshold {
            continue;
        }
        let (Some(span_a), Some(span_b)) = (op_a.span(), op_b.span()) else {
            continue;
        };
        if span_distance(span_a, span_b) > config.priority_proximity {
            continue;
        }
        let severity = if gap >= 3 { Severity::Medium } else { Severity::Low };
        conflicts.push(ChangeConflict::new(
            ConflictType::PriorityConflict,
            severity,
            vec![op_a.id, op_b.id],
            Vec::new(),
            format!(
                "{} ({:?}) and {} ({:?}) touch the same region",
                op_a.source_id, op_a.priority, op_b.source_id, op_b.priority
            ),
        ));
    }

    conflicts
}

/// A batch larger than the contention threshold: the lead operation plus
/// every operation beyond the threshold compete for the document.
pub fn resource_contention(operations: &[EditOperation], config: &DetectionConfig) -> Vec<ChangeConflict> {
    if operations.len() <= config.contention_threshold {
        return Vec::new();
    }
    let mut involved = vec![operations[0].id];
    involved.extend(operations[config.contention_threshold..].iter().map(|op| op.id));
    vec![ChangeConflict::new(
        ConflictType::ResourceContention,
        Severity::Medium,
        involved,
        Vec::new(),
        format!(
            "{} operations queued for one pass, limit {}",
            operations.len(),
            config.contention_threshold
        ),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EditScope, Intention, Priority, SemanticContext};

    fn op(source: &str, priority: Priority, changes: Vec<EditChange>) -> EditOperation {
        EditOperation::new(source, "doc.md", priority, changes)
    }

    fn config() -> DetectionConfig {
        DetectionConfig::default()
    }

    #[test]
    fn test_insert_inside_replace_is_overlap() {
        let a = op("editor", Priority::High, vec![EditChange::replace(10, 20, "bar").with_removed_text("foo")]);
        let b = op("ai", Priority::Medium, vec![EditChange::insert(15, "baz")]);

        let conflicts = overlapping_edits(&[a.clone(), b.clone()], &config());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::OverlappingEdits);
        assert!(conflicts[0].severity >= Severity::Medium);
        assert_eq!(conflicts[0].operations, vec![a.id, b.id]);
    }

    #[test]
    fn test_overlap_within_tolerance_is_ignored() {
        let a = op("editor", Priority::High, vec![EditChange::replace(10, 20, "x")]);
        let b = op("ai", Priority::High, vec![EditChange::replace(17, 30, "y")]);
        assert!(overlapping_edits(&[a.clone(), b.clone()], &config()).is_empty());

        let c = op("ai", Priority::High, vec![EditChange::replace(16, 30, "y")]);
        assert_eq!(overlapping_edits(&[a, c], &config()).len(), 1);
    }

    #[test]
    fn test_overlap_severity_scales_with_size() {
        let a = op("editor", Priority::High, vec![EditChange::delete(0, 100)]);
        let small = op("ai", Priority::High, vec![EditChange::replace(95, 200, "y")]);
        let full = op("ai", Priority::High, vec![EditChange::delete(0, 100)]);

        let small_sev = overlapping_edits(&[a.clone(), small], &config())[0].severity;
        let full_sev = overlapping_edits(&[a, full], &config())[0].severity;
        assert!(small_sev < full_sev);
        assert_eq!(full_sev, Severity::Critical);
    }

    #[test]
    fn test_one_conflict_per_operation_pair() {
        let a = op("editor", Priority::High, vec![EditChange::delete(0, 10), EditChange::delete(50, 60)]);
        let b = op("ai", Priority::High, vec![EditChange::delete(0, 10), EditChange::delete(50, 60)]);
        let conflicts = overlapping_edits(&[a, b], &config());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].changes.len(), 4);
    }

    #[test]
    fn test_semantic_conflict_needs_both_contexts() {
        let fix = SemanticContext::new(Intention::Correction, EditScope::Word, 0.9);
        let rework = SemanticContext::new(Intention::Restructuring, EditScope::Paragraph, 0.9);

        let a = op("proofreader", Priority::Medium, vec![EditChange::replace(10, 14, "teh").with_context(fix)]);
        let b = op("ai", Priority::Medium, vec![EditChange::replace(40, 90, "...").with_context(rework)]);
        let conflicts = semantic_conflicts(&[a.clone(), b], &config());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, Severity::Medium);

        let plain = op("ai", Priority::Medium, vec![EditChange::replace(40, 90, "...")]);
        assert!(semantic_conflicts(&[a, plain], &config()).is_empty());
    }

    #[test]
    fn test_distant_semantic_changes_are_not_compared() {
        let fix = SemanticContext::new(Intention::Correction, EditScope::Word, 0.9);
        let rework = SemanticContext::new(Intention::Restructuring, EditScope::Paragraph, 0.9);
        let a = op("proofreader", Priority::Medium, vec![EditChange::replace(10, 14, "x").with_context(fix)]);
        let b = op("ai", Priority::Medium, vec![EditChange::replace(500, 600, "y").with_context(rework)]);
        assert!(semantic_conflicts(&[a, b], &config()).is_empty());
    }

    #[test]
    fn test_dependency_violation() {
        let base = EditChange::insert(5, "intro ");
        let follow = EditChange::insert(80, "see intro").depending_on(base.id);
        let a = op("editor", Priority::High, vec![base]);
        let b = op("ai", Priority::Medium, vec![follow]);

        let conflicts = dependency_conflicts(&[a.clone(), b.clone()]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::DependencyViolation);
        assert_eq!(conflicts[0].operations, vec![b.id, a.id]);
    }

    #[test]
    fn test_priority_conflict_without_character_overlap() {
        let a = op("editor", Priority::High, vec![EditChange::replace(10, 20, "x")]);
        let b = op("ai", Priority::Background, vec![EditChange::delete(0, 40)]);
        let conflicts = priority_conflicts(&[a.clone(), b], &config());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, Severity::Medium);

        let near = op("ai", Priority::Medium, vec![EditChange::delete(0, 40)]);
        assert!(priority_conflicts(&[a, near], &config()).is_empty());
    }

    #[test]
    fn test_resource_contention_lists_lead_and_overflow() {
        let config = DetectionConfig {
            contention_threshold: 2,
            ..Default::default()
        };
        let ops: Vec<EditOperation> = (0..4)
            .map(|i| op("ai", Priority::Low, vec![EditChange::insert(i * 100, "x")]))
            .collect();
        let conflicts = resource_contention(&ops, &config);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].operations, vec![ops[0].id, ops[2].id, ops[3].id]);
        assert!(resource_contention(&ops[..2], &config).is_empty());
    }
}
