//! Safe application order for changes expressed in pre-edit coordinates
//!
//! Changes are applied from the end of the document towards the start so an
//! earlier edit never shifts the range of one still to be applied. At equal
//! start positions deletes go first, then replaces, then inserts.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::model::{ChangeId, EditChange, MergedChange};

/// Comparator for application order.
pub fn application_cmp(a: &EditChange, b: &EditChange) -> Ordering {
    b.from
        .cmp(&a.from)
        .then_with(|| a.kind.application_rank().cmp(&b.kind.application_rank()))
        .then_with(|| b.to.cmp(&a.to))
}

/// Sort merged changes into application order. The sort is stable, so ties
/// keep their incoming (priority) order.
pub fn order_for_application(changes: &mut [MergedChange]) {
    changes.sort_by(|a, b| application_cmp(&a.change, &b.change));
}

/// A change scheduled before one of the changes it depends on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyViolation {
    pub dependent: ChangeId,
    pub dependency: ChangeId,
}

/// Check `depends_on` against an already ordered list. Dependencies absent
/// from the list are assumed to be applied already.
pub fn dependency_violations<'a, I>(ordered: I) -> Vec<DependencyViolation>
where
    I: IntoIterator<Item = &'a EditChange>,
{
    let ordered: Vec<&EditChange> = ordered.into_iter().collect();
    let index: HashMap<ChangeId, usize> = ordered
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect();

    let mut violations = Vec::new();
    for (position, change) in ordered.iter().enumerate() {
        for dependency in &change.depends_on {
            if let Some(&dep_position) = index.get(dependency) {
                if dep_position > position {
                    violations.push(DependencyViolation {
                        dependent: change.id,
                        dependency: *dependency,
                    });
                }
            }
        }
    }
    violations
}

/// Human-readable warnings for every dependency violation in `ordered`.
pub fn dependency_warnings(ordered: &[MergedChange]) -> Vec<String> {
    dependency_violations(ordered.iter().map(|m| &m.change))
        .into_iter()
        .map(|v| {
            format!(
                "change {} depends on {} which is applied after it",
                v.dependent, v.dependency
            )
        })
        .collect()
}
