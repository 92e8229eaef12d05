//! Transforms: a base document plus the steps applied to it.

use crate::mapping::Mapping;
use crate::node::{Document, Slice, Token};
use crate::schema::{Mark, Schema, SchemaError};
use crate::step::{Step, StepError};
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("Step {index} failed: {source}")]
    Step {
        index: usize,
        #[source]
        source: StepError,
    },
    #[error("Schema check failed: {0}")]
    Schema(#[from] SchemaError),
    #[error("Recreated document does not match the target document")]
    Mismatch,
}

/// Tracks a sequence of steps applied to a base document, along with the
/// intermediate documents and the mapping of all step maps.
#[derive(Debug, Clone)]
pub struct Transform {
    schema: Arc<Schema>,
    docs: Vec<Document>,
    steps: Vec<Step>,
    mapping: Mapping,
    doc: Document,
}

impl Transform {
    pub fn new(schema: Arc<Schema>, doc: Document) -> Self {
        Self {
            schema,
            docs: Vec::new(),
            steps: Vec::new(),
            mapping: Mapping::new(),
            doc,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The current document.
    pub fn doc(&self) -> &Document {
        &self.doc
    }

    /// The document the transform started from.
    pub fn before(&self) -> &Document {
        self.docs.first().unwrap_or(&self.doc)
    }

    /// Documents before each step.
    pub fn docs(&self) -> &[Document] {
        &self.docs
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn mapping_mut(&mut self) -> &mut Mapping {
        &mut self.mapping
    }

    pub fn doc_changed(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Apply a step, failing with its index if it cannot be applied.
    pub fn step(&mut self, step: Step) -> Result<&mut Self, TransformError> {
        let index = self.steps.len();
        self.maybe_step(step)
            .map_err(|source| TransformError::Step { index, source })?;
        Ok(self)
    }

    /// Try to apply a step. On failure the transform is left unchanged.
    pub fn maybe_step(&mut self, step: Step) -> Result<(), StepError> {
        let doc = step.apply(&self.doc, &self.schema)?;
        self.add_step(step, doc);
        Ok(())
    }

    fn add_step(&mut self, step: Step, doc: Document) {
        self.mapping.append_map(step.get_map(), None);
        self.docs.push(std::mem::replace(&mut self.doc, doc));
        self.steps.push(step);
    }

    pub fn replace(
        &mut self,
        from: usize,
        to: usize,
        slice: Slice,
    ) -> Result<&mut Self, TransformError> {
        if from == to && slice.is_empty() {
            return Ok(self);
        }
        self.step(Step::Replace { from, to, slice })
    }

    pub fn insert(&mut self, pos: usize, slice: Slice) -> Result<&mut Self, TransformError> {
        self.replace(pos, pos, slice)
    }

    pub fn insert_text(&mut self, pos: usize, text: &str) -> Result<&mut Self, TransformError> {
        self.insert(pos, Slice::text(text))
    }

    pub fn delete(&mut self, from: usize, to: usize) -> Result<&mut Self, TransformError> {
        self.replace(from, to, Slice::empty())
    }

    /// Add a mark to every character in the range that lacks it. Marks of
    /// the same type with other attributes are removed first.
    pub fn add_mark(
        &mut self,
        from: usize,
        to: usize,
        mark: Mark,
    ) -> Result<&mut Self, TransformError> {
        let mut removed = Vec::new();
        let mut added = Vec::new();
        for (pos, marks) in self.markable_chars(from, to) {
            if mark.is_in_set(marks) {
                continue;
            }
            for old in marks.iter().filter(|m| m.mark_type() == mark.mark_type()) {
                coalesce(
                    &mut removed,
                    Step::RemoveMark {
                        from: pos,
                        to: pos + 1,
                        mark: old.clone(),
                    },
                );
            }
            coalesce(
                &mut added,
                Step::AddMark {
                    from: pos,
                    to: pos + 1,
                    mark: mark.clone(),
                },
            );
        }
        for step in removed.into_iter().chain(added) {
            self.step(step)?;
        }
        Ok(self)
    }

    /// Remove a mark from every character in the range that has it.
    pub fn remove_mark(
        &mut self,
        from: usize,
        to: usize,
        mark: Mark,
    ) -> Result<&mut Self, TransformError> {
        let mut removed = Vec::new();
        for (pos, marks) in self.markable_chars(from, to) {
            if mark.is_in_set(marks) {
                coalesce(
                    &mut removed,
                    Step::RemoveMark {
                        from: pos,
                        to: pos + 1,
                        mark: mark.clone(),
                    },
                );
            }
        }
        for step in removed {
            self.step(step)?;
        }
        Ok(self)
    }

    fn markable_chars(&self, from: usize, to: usize) -> Vec<(usize, &[Mark])> {
        let mut block = None;
        let mut chars = Vec::new();
        for (pos, token) in self.doc.tokens().iter().enumerate().take(to) {
            match token {
                Token::Open(b) => block = Some(*b),
                Token::Close => block = None,
                Token::Char(_, marks) => {
                    if pos >= from && block.is_some_and(|b| self.schema.block_allows_marks(&b)) {
                        chars.push((pos, marks.as_slice()));
                    }
                }
            }
        }
        chars
    }

    /// A transform over the same base document where every compound replace
    /// is split into a deletion and an insertion. A step whose parts cannot
    /// be applied separately is kept whole.
    pub fn simplify(&self) -> Transform {
        let mut tr = Transform::new(self.schema.clone(), self.before().clone());
        for step in &self.steps {
            let parts = step.split();
            if parts.len() > 1 {
                let mut attempt = tr.clone();
                if parts.iter().all(|p| attempt.maybe_step(p.clone()).is_ok()) {
                    tr = attempt;
                    continue;
                }
                debug!("Keeping compound step whole: {:?}", step);
            }
            if let Err(e) = tr.maybe_step(step.clone()) {
                warn!("Step no longer applies while simplifying: {}", e);
            }
        }
        tr
    }
}

/// Push a step, merging it into an earlier step of the list when possible.
pub(crate) fn coalesce(steps: &mut Vec<Step>, step: Step) {
    for existing in steps.iter_mut().rev() {
        if let Some(merged) = existing.merge(&step) {
            *existing = merged;
            return;
        }
    }
    steps.push(step);
}

// ─── Rebasing ───────────────────────────────────────────────────────────────

/// A local step paired with its inverse, so it can be undone before remote
/// steps are applied and redone on top of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebaseable {
    pub step: Step,
    pub inverted: Step,
}

impl Rebaseable {
    pub fn new(step: Step, inverted: Step) -> Self {
        Self { step, inverted }
    }
}

/// Result of rebasing local steps.
#[derive(Debug, Clone, Default)]
pub struct RebaseOutcome {
    pub rebased: Vec<Rebaseable>,
    /// Local steps that no longer apply after the remote steps.
    pub dropped: Vec<Step>,
}

/// Undo `steps` on the transform's document, apply `over`, then map and
/// reapply each local step on top. The transform must start at the document
/// with `steps` applied.
pub fn rebase_steps(
    steps: &[Rebaseable],
    over: &[Step],
    transform: &mut Transform,
) -> Result<RebaseOutcome, TransformError> {
    for rebaseable in steps.iter().rev() {
        transform.step(rebaseable.inverted.clone())?;
    }
    for step in over {
        transform.step(step.clone())?;
    }
    let mut outcome = RebaseOutcome::default();
    let mut map_from = steps.len();
    for rebaseable in steps {
        let mapped = rebaseable.step.map(&transform.mapping().slice(map_from));
        map_from -= 1;
        let Some(mapped) = mapped else {
            outcome.dropped.push(rebaseable.step.clone());
            continue;
        };
        let before = transform.doc().clone();
        match transform.maybe_step(mapped.clone()) {
            Ok(()) => {
                let last = transform.steps().len() - 1;
                transform.mapping_mut().set_mirror(map_from, last);
                let inverted = mapped.invert(&before);
                outcome.rebased.push(Rebaseable::new(mapped, inverted));
            }
            Err(e) => {
                debug!("Dropping local step during rebase: {}", e);
                outcome.dropped.push(rebaseable.step.clone());
            }
        }
    }
    Ok(outcome)
}
