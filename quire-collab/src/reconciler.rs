//! Version reconciler: chooses how an incoming snapshot is brought in line
//! with the local state.

use quire_core::Document;

use crate::conflict::Conflict;
use crate::failure::OfflineExport;
use crate::state::CollabState;

/// What the session is doing with remote data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Synced,
    /// Applying remote steps.
    Receiving,
    /// Merging offline edits into a newer server document.
    Reconciling,
}

/// How a snapshot is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePath {
    /// Take the snapshot as is: first document of the session, or a newer
    /// document while nothing local is pending.
    Load,
    /// Rebase unconfirmed local steps onto the newer server document.
    Merge,
    /// Apply the attached message log as server fixes.
    ReplayLog,
    /// Nothing to do; the snapshot matches the local state.
    UpToDate,
    /// The server has lost data; discard local state and load.
    Reset,
}

/// Decide the path for a snapshot of `content` at version `v`, with or
/// without a message log.
pub fn plan(state: &CollabState, v: u64, content: &Document, has_log: bool) -> ReconcilePath {
    let Some(confirmed) = state.confirmed() else {
        return ReconcilePath::Load;
    };
    let local = state.version();
    if local < v && state.has_unconfirmed() {
        return ReconcilePath::Merge;
    }
    if has_log {
        return ReconcilePath::ReplayLog;
    }
    if local == v && (content == confirmed || content == state.doc()) {
        return ReconcilePath::UpToDate;
    }
    if local < v {
        return ReconcilePath::Load;
    }
    ReconcilePath::Reset
}

/// Result of handling a snapshot.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Loaded,
    UpToDate,
    Replayed {
        applied: usize,
        skipped: usize,
    },
    Merged {
        /// Local steps that could not be rebased.
        dropped: usize,
    },
    /// Local and remote edits overlap. The server document was kept and
    /// the offline document exported.
    Conflicted {
        conflicts: Vec<Conflict>,
        export: Box<OfflineExport>,
    },
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{Schema, Transform};
    use std::sync::Arc;

    fn state(version: u64, pending: bool) -> CollabState {
        let mut state = CollabState::new(Arc::new(Schema::default()), 1);
        state.load(Document::from_paragraphs(&["base"]), version);
        if pending {
            let mut tr = Transform::new(state.schema().clone(), state.doc().clone());
            tr.insert_text(1, "x").unwrap();
            state.apply_transform(&tr).unwrap();
        }
        state
    }

    #[test]
    fn test_first_document_loads() {
        let fresh = CollabState::new(Arc::new(Schema::default()), 1);
        let doc = Document::from_paragraphs(&["any"]);
        assert_eq!(plan(&fresh, 3, &doc, true), ReconcilePath::Load);
    }

    #[test]
    fn test_newer_snapshot_with_pending_steps_merges() {
        let doc = Document::from_paragraphs(&["other"]);
        assert_eq!(plan(&state(5, true), 6, &doc, false), ReconcilePath::Merge);
        assert_eq!(plan(&state(5, true), 6, &doc, true), ReconcilePath::Merge);
    }

    #[test]
    fn test_log_is_replayed_without_pending_steps() {
        let doc = Document::from_paragraphs(&["other"]);
        assert_eq!(plan(&state(5, false), 7, &doc, true), ReconcilePath::ReplayLog);
    }

    #[test]
    fn test_same_snapshot_is_up_to_date() {
        let base = Document::from_paragraphs(&["base"]);
        assert_eq!(plan(&state(5, false), 5, &base, false), ReconcilePath::UpToDate);
        assert_eq!(plan(&state(5, true), 5, &base, false), ReconcilePath::UpToDate);
    }

    #[test]
    fn test_newer_snapshot_without_pending_loads() {
        let doc = Document::from_paragraphs(&["other"]);
        assert_eq!(plan(&state(5, false), 8, &doc, false), ReconcilePath::Load);
    }

    #[test]
    fn test_data_loss_resets() {
        let doc = Document::from_paragraphs(&["other"]);
        assert_eq!(plan(&state(5, false), 5, &doc, false), ReconcilePath::Reset);
        assert_eq!(plan(&state(5, true), 3, &doc, false), ReconcilePath::Reset);
    }
}
