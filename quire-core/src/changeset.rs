//! Change sets: which ranges of a base document a transform touched.

use crate::mapping::{Assoc, Mappable};
use crate::step::Step;
use crate::transform::Transform;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Delete,
    Mark,
}

/// A range of the base document touched by one step. Insertions are zero
/// width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub from: usize,
    pub to: usize,
    pub kind: ChangeKind,
    /// Index of the originating step in the transform.
    pub step: usize,
}

impl Change {
    /// Inclusive overlap: touching ranges overlap.
    pub fn overlaps(&self, other: &Change) -> bool {
        self.from <= other.to && other.from <= self.to
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// Project every step of the transform back onto its base document.
    pub fn from_transform(tr: &Transform) -> Self {
        let mut changes = Vec::new();
        for (index, step) in tr.steps().iter().enumerate() {
            let back = tr.mapping().slice_range(0, index).invert();
            let (from, to) = step.range();
            let base_from = back.map(from, Assoc::Before);
            let base_to = back.map(to, Assoc::After).max(base_from);
            match step {
                Step::Replace { slice, .. } => {
                    if to > from {
                        changes.push(Change {
                            from: base_from,
                            to: base_to,
                            kind: ChangeKind::Delete,
                            step: index,
                        });
                    }
                    if !slice.is_empty() {
                        changes.push(Change {
                            from: base_from,
                            to: base_from,
                            kind: ChangeKind::Insert,
                            step: index,
                        });
                    }
                }
                Step::AddMark { .. } | Step::RemoveMark { .. } => changes.push(Change {
                    from: base_from,
                    to: base_to,
                    kind: ChangeKind::Mark,
                    step: index,
                }),
            }
        }
        Self { changes }
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Every pair `(ours, theirs)` of overlapping changes.
    pub fn find_conflicts(&self, other: &ChangeSet) -> Vec<(Change, Change)> {
        let mut conflicts = Vec::new();
        for ours in &self.changes {
            for theirs in &other.changes {
                if ours.overlaps(theirs) {
                    conflicts.push((ours.clone(), theirs.clone()));
                }
            }
        }
        conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Document;
    use crate::schema::{Mark, Schema};
    use std::sync::Arc;

    fn transform(f: impl FnOnce(&mut Transform)) -> Transform {
        let base = Document::from_paragraphs(&["The quick brown fox jumps"]);
        let mut tr = Transform::new(Arc::new(Schema::default()), base);
        f(&mut tr);
        tr
    }

    #[test]
    fn test_changes_are_in_base_coordinates() {
        let tr = transform(|tr| {
            tr.insert_text(1, "AAAA").unwrap();
            tr.delete(15, 20).unwrap();
        });
        let changes = ChangeSet::from_transform(&tr);
        assert_eq!(
            changes.changes(),
            &[
                Change { from: 1, to: 1, kind: ChangeKind::Insert, step: 0 },
                Change { from: 11, to: 16, kind: ChangeKind::Delete, step: 1 },
            ]
        );
    }

    #[test]
    fn test_compound_replace_yields_delete_and_insert() {
        let tr = transform(|tr| {
            tr.replace(5, 10, crate::node::Slice::text("slow")).unwrap();
        });
        let kinds: Vec<_> = ChangeSet::from_transform(&tr)
            .changes()
            .iter()
            .map(|c| c.kind)
            .collect();
        assert_eq!(kinds, vec![ChangeKind::Delete, ChangeKind::Insert]);
    }

    #[test]
    fn test_disjoint_edits_do_not_conflict() {
        let local = ChangeSet::from_transform(&transform(|tr| {
            tr.insert_text(20, "x").unwrap();
        }));
        let remote = ChangeSet::from_transform(&transform(|tr| {
            tr.delete(1, 6).unwrap();
        }));
        assert!(local.find_conflicts(&remote).is_empty());
    }

    #[test]
    fn test_overlap_is_inclusive() {
        let local = ChangeSet::from_transform(&transform(|tr| {
            tr.insert_text(6, "x").unwrap();
        }));
        let remote = ChangeSet::from_transform(&transform(|tr| {
            tr.delete(1, 6).unwrap();
        }));
        assert_eq!(local.find_conflicts(&remote).len(), 1);
    }

    #[test]
    fn test_mark_overlapping_delete_conflicts() {
        let local = ChangeSet::from_transform(&transform(|tr| {
            tr.add_mark(3, 8, Mark::Strong).unwrap();
        }));
        let remote = ChangeSet::from_transform(&transform(|tr| {
            tr.delete(7, 12).unwrap();
        }));
        let conflicts = local.find_conflicts(&remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].0.kind, ChangeKind::Mark);
        assert_eq!(conflicts[0].1.kind, ChangeKind::Delete);
    }
}
