//! Atomic text mutations and their editorial intent

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a change
pub type ChangeId = Uuid;

/// The three kinds of text mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Delete,
    Replace,
}

impl ChangeKind {
    /// Deletes and replaces remove existing text.
    pub fn is_destructive(self) -> bool {
        matches!(self, ChangeKind::Delete | ChangeKind::Replace)
    }

    /// Application rank among changes starting at the same position:
    /// deletes first, inserts last.
    pub fn application_rank(self) -> u8 {
        match self {
            ChangeKind::Delete => 0,
            ChangeKind::Replace => 1,
            ChangeKind::Insert => 2,
        }
    }
}

/// What an edit is trying to achieve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intention {
    Correction,
    Enhancement,
    Formatting,
    ContentAddition,
    Restructuring,
}

impl Intention {
    fn index(self) -> usize {
        match self {
            Intention::Correction => 0,
            Intention::Enhancement => 1,
            Intention::Formatting => 2,
            Intention::ContentAddition => 3,
            Intention::Restructuring => 4,
        }
    }

    /// Symmetric compatibility of two intentions, in `[0, 1]`.
    pub fn compatibility(self, other: Intention) -> f64 {
        COMPATIBILITY[self.index()][other.index()]
    }
}

// Rows and columns follow the declaration order of `Intention`.
const COMPATIBILITY: [[f64; 5]; 5] = [
    // correction, enhancement, formatting, content_addition, restructuring
    [0.9, 0.7, 0.8, 0.6, 0.2],
    [0.7, 0.6, 0.7, 0.5, 0.3],
    [0.8, 0.7, 0.9, 0.8, 0.4],
    [0.6, 0.5, 0.8, 0.7, 0.3],
    [0.2, 0.3, 0.4, 0.3, 0.2],
];

/// How much of the document an edit is meant to touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditScope {
    Word,
    Sentence,
    Paragraph,
    Section,
    Document,
}

impl EditScope {
    /// Section and document scoped edits interact with everything nearby.
    pub fn is_broad(self) -> bool {
        matches!(self, EditScope::Section | EditScope::Document)
    }
}

/// Annotation describing editorial intent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticContext {
    pub intention: Intention,
    pub scope: EditScope,
    pub confidence: f64,
    #[serde(default)]
    pub preserve_formatting: bool,
    #[serde(default)]
    pub preserve_content: bool,
}

impl SemanticContext {
    pub fn new(intention: Intention, scope: EditScope, confidence: f64) -> Self {
        Self {
            intention,
            scope,
            confidence: confidence.clamp(0.0, 1.0),
            preserve_formatting: false,
            preserve_content: false,
        }
    }

    pub fn preserving_formatting(mut self) -> Self {
        self.preserve_formatting = true;
        self
    }

    pub fn preserving_content(mut self) -> Self {
        self.preserve_content = true;
        self
    }

    /// Compatibility of two annotated edits.
    ///
    /// Starts from the intention matrix and halves it when one side asks to
    /// preserve exactly what the other side's intention changes.
    pub fn compatibility_with(&self, other: &SemanticContext) -> f64 {
        let mut score = self.intention.compatibility(other.intention);
        if violates_preservation(self, other) || violates_preservation(other, self) {
            score *= 0.5;
        }
        score
    }
}

fn violates_preservation(keeper: &SemanticContext, editor: &SemanticContext) -> bool {
    (keeper.preserve_formatting && editor.intention == Intention::Formatting)
        || (keeper.preserve_content && editor.intention == Intention::Restructuring)
}

/// One atomic text mutation in pre-edit coordinates.
///
/// Changes are never mutated after creation; merges produce new changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditChange {
    pub id: ChangeId,
    pub kind: ChangeKind,
    pub from: usize,
    pub to: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_context: Option<SemanticContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ChangeId>,
}

impl EditChange {
    /// Insert `text` at `at`.
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ChangeKind::Insert,
            from: at,
            to: at,
            text: Some(text.into()),
            removed_text: None,
            semantic_context: None,
            depends_on: Vec::new(),
        }
    }

    /// Delete `[from, to)`.
    pub fn delete(from: usize, to: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ChangeKind::Delete,
            from,
            to,
            text: None,
            removed_text: None,
            semantic_context: None,
            depends_on: Vec::new(),
        }
    }

    /// Replace `[from, to)` with `text`.
    pub fn replace(from: usize, to: usize, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ChangeKind::Replace,
            from,
            to,
            text: Some(text.into()),
            removed_text: None,
            semantic_context: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_removed_text(mut self, removed: impl Into<String>) -> Self {
        self.removed_text = Some(removed.into());
        self
    }

    pub fn with_context(mut self, context: SemanticContext) -> Self {
        self.semantic_context = Some(context);
        self
    }

    pub fn depending_on(mut self, change_id: ChangeId) -> Self {
        self.depends_on.push(change_id);
        self
    }

    /// Length of the affected range in the original document.
    pub fn range_len(&self) -> usize {
        self.to.saturating_sub(self.from)
    }

    /// Length of the inserted text in characters.
    pub fn text_len(&self) -> usize {
        self.text.as_deref().map(|t| t.chars().count()).unwrap_or(0)
    }

    /// Size used when weighing overlaps: the range, or the inserted text for inserts.
    pub fn footprint(&self) -> usize {
        match self.kind {
            ChangeKind::Insert => self.text_len().max(1),
            _ => self.range_len().max(1),
        }
    }

    /// Number of characters shared by the two ranges.
    pub fn overlap_len(&self, other: &EditChange) -> usize {
        let start = self.from.max(other.from);
        let end = self.to.min(other.to);
        end.saturating_sub(start)
    }

    /// True when this insert lands strictly inside `other`'s range.
    pub fn lands_inside(&self, other: &EditChange) -> bool {
        self.kind == ChangeKind::Insert
            && other.kind != ChangeKind::Insert
            && other.from < self.from
            && self.from < other.to
    }

    /// True when both are inserts at the same position.
    pub fn same_insert_point(&self, other: &EditChange) -> bool {
        self.kind == ChangeKind::Insert && other.kind == ChangeKind::Insert && self.from == other.from
    }

    /// Any shared characters, an insert swallowed by the other range, or a
    /// shared insert position.
    pub fn overlaps(&self, other: &EditChange) -> bool {
        self.overlap_len(other) > 0
            || self.lands_inside(other)
            || other.lands_inside(self)
            || self.same_insert_point(other)
    }

    /// Distance between the two ranges (0 when they touch or overlap).
    pub fn distance_to(&self, other: &EditChange) -> usize {
        if self.to < other.from {
            other.from - self.to
        } else if other.to < self.from {
            self.from - other.to
        } else {
            0
        }
    }

    /// Close enough for intentions to interact: overlapping, within
    /// `proximity` characters, or either side scoped to a section or more.
    pub fn semantically_near(&self, other: &EditChange, proximity: usize) -> bool {
        let broad = [self, other]
            .iter()
            .filter_map(|c| c.semantic_context.as_ref())
            .any(|ctx| ctx.scope.is_broad());
        broad || self.overlaps(other) || self.distance_to(other) <= proximity
    }

    /// Check the internal consistency of the change.
    pub fn validate(&self) -> Result<(), String> {
        if self.from > self.to {
            return Err(format!("change {} has from {} > to {}", self.id, self.from, self.to));
        }
        match self.kind {
            ChangeKind::Insert if self.from != self.to => {
                Err(format!("insert {} must have an empty range", self.id))
            }
            ChangeKind::Insert | ChangeKind::Replace if self.text.is_none() => {
                Err(format!("{:?} {} carries no text", self.kind, self.id))
            }
            ChangeKind::Delete if self.from == self.to => {
                Err(format!("delete {} has an empty range", self.id))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix_is_symmetric() {
        let all = [
            Intention::Correction,
            Intention::Enhancement,
            Intention::Formatting,
            Intention::ContentAddition,
            Intention::Restructuring,
        ];
        for a in all {
            for b in all {
                assert_eq!(a.compatibility(b), b.compatibility(a), "{:?} x {:?}", a, b);
            }
        }
        assert_eq!(Intention::Correction.compatibility(Intention::Correction), 0.9);
        assert_eq!(Intention::Correction.compatibility(Intention::Restructuring), 0.2);
    }

    #[test]
    fn test_preservation_halves_compatibility() {
        let keep = SemanticContext::new(Intention::Correction, EditScope::Word, 1.0).preserving_formatting();
        let fmt = SemanticContext::new(Intention::Formatting, EditScope::Word, 1.0);
        assert!((keep.compatibility_with(&fmt) - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_insert_inside_replace_overlaps() {
        let replace = EditChange::replace(10, 20, "bar");
        let insert = EditChange::insert(15, "baz");
        assert_eq!(insert.overlap_len(&replace), 0);
        assert!(insert.lands_inside(&replace));
        assert!(replace.overlaps(&insert));

        let at_edge = EditChange::insert(20, "x");
        assert!(!at_edge.overlaps(&replace));
    }

    #[test]
    fn test_validate() {
        assert!(EditChange::insert(3, "a").validate().is_ok());
        assert!(EditChange::delete(5, 5).validate().is_err());

        let mut bad = EditChange::replace(4, 8, "x");
        bad.from = 9;
        assert!(bad.validate().is_err());
    }
}
