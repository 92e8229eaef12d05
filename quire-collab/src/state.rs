//! Local document state of one editor session.
//!
//! Holds the working document, the last document the server is known to
//! have (the *confirmed* document), the tracked server version, and the
//! local steps the server has not confirmed yet.

use std::sync::Arc;

use quire_core::{rebase_steps, Document, Mapping, Rebaseable, Schema, Step, Transform};

use crate::error::CollabError;

/// Effect of remote steps on the working document.
#[derive(Debug, Clone, Default)]
pub struct Received {
    /// Maps positions in the previous working document to the new one.
    pub mapping: Mapping,
    /// Local steps that no longer apply on top of the remote steps.
    pub dropped: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct CollabState {
    schema: Arc<Schema>,
    doc: Document,
    confirmed: Option<Document>,
    version: u64,
    unconfirmed: Vec<Rebaseable>,
    client_id: u64,
}

impl CollabState {
    pub fn new(schema: Arc<Schema>, client_id: u64) -> Self {
        Self {
            schema,
            doc: Document::empty(),
            confirmed: None,
            version: 0,
            unconfirmed: Vec::new(),
            client_id,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn confirmed(&self) -> Option<&Document> {
        self.confirmed.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.confirmed.is_some()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn unconfirmed(&self) -> &[Rebaseable] {
        &self.unconfirmed
    }

    pub fn has_unconfirmed(&self) -> bool {
        !self.unconfirmed.is_empty()
    }

    /// Steps to send in the next diff.
    pub fn sendable_steps(&self) -> Vec<Step> {
        self.unconfirmed.iter().map(|r| r.step.clone()).collect()
    }

    /// Replace all state with a server document.
    pub fn load(&mut self, doc: Document, version: u64) {
        self.confirmed = Some(doc.clone());
        self.doc = doc;
        self.version = version;
        self.unconfirmed.clear();
    }

    /// Record a local transform. It must start at the current document.
    pub fn apply_transform(&mut self, tr: &Transform) -> Result<(), CollabError> {
        if !self.is_loaded() {
            return Err(CollabError::NoDocument);
        }
        if tr.before() != &self.doc {
            return Err(CollabError::Transform(quire_core::TransformError::Mismatch));
        }
        for (step, before) in tr.steps().iter().zip(tr.docs()) {
            self.unconfirmed
                .push(Rebaseable::new(step.clone(), step.invert(before)));
        }
        self.doc = tr.doc().clone();
        Ok(())
    }

    /// The server accepted the first `count` unconfirmed steps; `doc` is the
    /// working document as it was when they were sent.
    pub fn confirm(&mut self, count: usize, doc: Document) {
        let count = count.min(self.unconfirmed.len());
        self.unconfirmed.drain(..count);
        self.confirmed = Some(doc);
        self.version += 1;
    }

    /// Apply a batch of steps the server accepted from another client,
    /// rebasing unconfirmed local steps over it.
    pub fn receive(&mut self, steps: &[Step]) -> Result<Received, CollabError> {
        let confirmed = self.confirmed.as_ref().ok_or(CollabError::NoDocument)?;
        let mut new_confirmed = confirmed.clone();
        for step in steps {
            new_confirmed = step.apply(&new_confirmed, &self.schema)?;
        }

        let mut tr = Transform::new(self.schema.clone(), self.doc.clone());
        let mut dropped = Vec::new();
        if self.unconfirmed.is_empty() {
            for step in steps {
                tr.step(step.clone())?;
            }
        } else {
            let outcome = rebase_steps(&self.unconfirmed, steps, &mut tr)?;
            self.unconfirmed = outcome.rebased;
            dropped = outcome.dropped;
        }

        self.doc = tr.doc().clone();
        self.confirmed = Some(new_confirmed);
        self.version += 1;
        Ok(Received {
            mapping: tr.mapping().clone(),
            dropped,
        })
    }

    /// Apply a batch of this client's own steps found in a server log
    /// without a matching tracked diff: they are confirmed, not reapplied.
    pub fn receive_own(&mut self, steps: &[Step]) -> Result<(), CollabError> {
        let confirmed = self.confirmed.as_ref().ok_or(CollabError::NoDocument)?;
        let mut new_confirmed = confirmed.clone();
        for step in steps {
            new_confirmed = step.apply(&new_confirmed, &self.schema)?;
        }
        let count = steps.len().min(self.unconfirmed.len());
        self.unconfirmed.drain(..count);
        self.confirmed = Some(new_confirmed);
        self.version += 1;
        Ok(())
    }

    /// Take over the result of an automatic merge.
    pub fn adopt_merge(
        &mut self,
        remote: Document,
        merged: Document,
        rebased: Vec<Rebaseable>,
        version: u64,
    ) {
        self.confirmed = Some(remote);
        self.doc = merged;
        self.unconfirmed = rebased;
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(text: &str) -> CollabState {
        let mut state = CollabState::new(Arc::new(Schema::default()), 1);
        state.load(Document::from_paragraphs(&[text]), 5);
        state
    }

    fn edit(state: &mut CollabState, f: impl FnOnce(&mut Transform)) {
        let mut tr = Transform::new(state.schema().clone(), state.doc().clone());
        f(&mut tr);
        state.apply_transform(&tr).unwrap();
    }

    #[test]
    fn test_apply_requires_loaded_document() {
        let mut state = CollabState::new(Arc::new(Schema::default()), 1);
        let tr = Transform::new(state.schema().clone(), state.doc().clone());
        assert!(matches!(
            state.apply_transform(&tr),
            Err(CollabError::NoDocument)
        ));
    }

    #[test]
    fn test_local_edits_become_unconfirmed() {
        let mut state = loaded("abc");
        edit(&mut state, |tr| {
            tr.insert_text(1, "x").unwrap();
            tr.insert_text(2, "y").unwrap();
        });
        assert_eq!(state.sendable_steps().len(), 2);
        assert_eq!(state.doc().text_content(), "xyabc");
        assert_eq!(state.confirmed().unwrap().text_content(), "abc");
    }

    #[test]
    fn test_confirm_advances_version_and_confirmed_doc() {
        let mut state = loaded("abc");
        edit(&mut state, |tr| {
            tr.insert_text(1, "x").unwrap();
        });
        let sent = state.doc().clone();
        edit(&mut state, |tr| {
            tr.insert_text(2, "y").unwrap();
        });
        state.confirm(1, sent.clone());
        assert_eq!(state.version(), 6);
        assert_eq!(state.confirmed(), Some(&sent));
        assert_eq!(state.unconfirmed().len(), 1);
    }

    #[test]
    fn test_receive_without_local_changes() {
        let mut state = loaded("abc");
        let received = state.receive(&[Step::delete(1, 2)]).unwrap();
        assert_eq!(state.doc().text_content(), "bc");
        assert_eq!(state.confirmed(), Some(state.doc()));
        assert_eq!(state.version(), 6);
        assert!(received.dropped.is_empty());
    }

    #[test]
    fn test_receive_rebases_local_changes() {
        let mut state = loaded("abc");
        edit(&mut state, |tr| {
            tr.insert_text(4, "!").unwrap();
        });
        let received = state.receive(&[Step::delete(1, 2)]).unwrap();
        assert_eq!(state.doc().text_content(), "bc!");
        assert_eq!(state.confirmed().unwrap().text_content(), "bc");
        assert_eq!(state.sendable_steps(), vec![Step::insert(3, quire_core::Slice::text("!"))]);
        assert!(received.dropped.is_empty());
    }

    #[test]
    fn test_receive_own_pops_confirmed_steps() {
        let mut state = loaded("abc");
        edit(&mut state, |tr| {
            tr.insert_text(1, "x").unwrap();
        });
        let steps = state.sendable_steps();
        state.receive_own(&steps).unwrap();
        assert!(!state.has_unconfirmed());
        assert_eq!(state.confirmed(), Some(state.doc()));
        assert_eq!(state.version(), 6);
    }
}
