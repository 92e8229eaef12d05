//! Diff tracker: decides when a diff may be sent and remembers the diffs
//! the server has not answered yet.
//!
//! At most one diff is in flight. Sending stays disabled until the server
//! confirms or rejects it, a version check completes, or the resend
//! deadline passes.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, warn};
use quire_core::Document;
use uuid::Uuid;

use crate::protocol::{ClientDiffMessage, ClientMessage, ClientSelectionMessage};
use crate::state::CollabState;

/// A diff sent to the server and not yet confirmed.
#[derive(Debug, Clone)]
pub struct UnconfirmedDiff {
    pub rid: u64,
    /// Version the diff was based on.
    pub v: u64,
    /// Number of unconfirmed steps the diff carried.
    pub step_count: usize,
    /// Working document at send time.
    pub doc: Document,
}

/// Conditions outside the tracker that block sending.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendGate {
    pub connected: bool,
    pub loading: bool,
    pub receiving: bool,
    pub halted: bool,
}

impl SendGate {
    fn is_open(&self) -> bool {
        self.connected && !self.loading && !self.receiving && !self.halted
    }
}

/// Identity and caret of the local session, for selection messages.
#[derive(Debug, Clone, Copy)]
pub struct LocalSelection {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub anchor: usize,
    pub head: usize,
}

#[derive(Debug)]
pub struct DiffTracker {
    unconfirmed: BTreeMap<u64, UnconfirmedDiff>,
    next_rid: u64,
    awaiting: bool,
    in_flight: Option<u64>,
    resend_deadline: Option<Instant>,
    resend_timeout: Duration,
    last_selection: Option<(usize, usize)>,
}

impl DiffTracker {
    pub fn new(resend_timeout: Duration) -> Self {
        Self {
            unconfirmed: BTreeMap::new(),
            next_rid: 0,
            awaiting: false,
            in_flight: None,
            resend_deadline: None,
            resend_timeout,
            last_selection: None,
        }
    }

    pub fn is_awaiting(&self) -> bool {
        self.awaiting
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// Diffs sent and not yet confirmed, rejected or reset.
    pub fn unconfirmed(&self) -> impl Iterator<Item = &UnconfirmedDiff> {
        self.unconfirmed.values()
    }

    pub fn has_unconfirmed(&self, rid: u64) -> bool {
        self.unconfirmed.contains_key(&rid)
    }

    /// Produce the next message to send, if any. Pending steps take
    /// priority over a changed selection.
    pub fn try_send(
        &mut self,
        gate: SendGate,
        state: &CollabState,
        selection: Option<LocalSelection>,
        now: Instant,
    ) -> Option<ClientMessage> {
        if self.awaiting || !gate.is_open() {
            return None;
        }

        if state.has_unconfirmed() {
            let rid = self.next_rid;
            self.next_rid += 1;
            let ds = state.sendable_steps();
            self.unconfirmed.insert(
                rid,
                UnconfirmedDiff {
                    rid,
                    v: state.version(),
                    step_count: ds.len(),
                    doc: state.doc().clone(),
                },
            );
            self.disable(now);
            self.in_flight = Some(rid);
            debug!("Sending diff rid={} v={} steps={}", rid, state.version(), ds.len());
            return Some(ClientMessage::Diff(ClientDiffMessage {
                v: state.version(),
                ds,
                rid,
                cid: Some(state.client_id()),
                server_fix: false,
            }));
        }

        let selection = selection?;
        let caret = (selection.anchor, selection.head);
        if self.last_selection == Some(caret) {
            return None;
        }
        self.last_selection = Some(caret);
        Some(ClientMessage::SelectionChange(ClientSelectionMessage {
            id: selection.user_id,
            v: state.version(),
            session_id: selection.session_id,
            anchor: selection.anchor,
            head: selection.head,
        }))
    }

    /// The server accepted diff `rid`. Returns the record so the caller can
    /// advance its confirmed state; unknown ids are ignored.
    pub fn on_ack(&mut self, rid: u64) -> Option<UnconfirmedDiff> {
        let diff = self.unconfirmed.remove(&rid);
        if diff.is_none() {
            debug!("Ignoring confirmation of unknown diff rid={}", rid);
            return None;
        }
        if self.in_flight == Some(rid) {
            self.enable();
        }
        diff
    }

    /// The server refused diff `rid`. Its steps stay pending locally.
    pub fn on_reject(&mut self, rid: u64) -> bool {
        if self.unconfirmed.remove(&rid).is_none() {
            debug!("Ignoring rejection of unknown diff rid={}", rid);
            return false;
        }
        warn!("Server rejected diff rid={}", rid);
        if self.in_flight == Some(rid) {
            self.enable();
        }
        true
    }

    /// Check the resend deadline. Returns true when it expired and sending
    /// was re-enabled; diffs already sent are kept, so a late confirmation
    /// is still matched.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match self.resend_deadline {
            Some(deadline) if self.awaiting && now >= deadline => {
                warn!(
                    "No response from server for diff {:?}, resending",
                    self.in_flight
                );
                self.enable();
                true
            }
            _ => false,
        }
    }

    /// Forget diffs based on a version older than `version`. The server
    /// only accepts a diff at its current version, so once another diff
    /// took that version these can never be confirmed.
    pub fn drop_stale(&mut self, version: u64) -> usize {
        let before = self.unconfirmed.len();
        self.unconfirmed.retain(|_, diff| diff.v >= version);
        let dropped = before - self.unconfirmed.len();
        if dropped > 0 {
            debug!("Dropped {} stale diffs below version {}", dropped, version);
        }
        dropped
    }

    pub fn resend_deadline(&self) -> Option<Instant> {
        self.resend_deadline
    }

    /// Block sending until a response arrives or the deadline passes.
    pub fn disable(&mut self, now: Instant) {
        self.awaiting = true;
        self.resend_deadline = Some(now + self.resend_timeout);
    }

    /// Allow sending again.
    pub fn enable(&mut self) {
        self.awaiting = false;
        self.in_flight = None;
        self.resend_deadline = None;
    }

    /// Forget every sent diff, after the document was replaced.
    pub fn reset(&mut self) {
        self.unconfirmed.clear();
        self.enable();
    }
}
