//! One editor session: the client side of the sync protocol.
//!
//! ```text
//!   edit() ──► CollabState ──► DiffTracker::try_send() ──► poll() ──► transport
//!                  ▲
//!                  │ receive / confirm / merge
//!                  │
//! transport ──► handle_message()
//!                  │ doc_data
//!                  ▼
//!            reconciler::plan()
//!     Load │ UpToDate │ ReplayLog │ Merge │ Reset
//!                                    │
//!                          find_conflicts ─► auto_merge
//!                                    │ error
//!                                    ▼
//!                             FailureHandler (halt)
//! ```
//!
//! The session never blocks and owns no timers: every deadline is checked
//! against the `now` passed to [`CollabSession::poll`] and
//! [`CollabSession::handle_message`]. Outgoing messages are only ever
//! returned from `poll`, the caller performs the send.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use log::{debug, error, info, warn};
use quire_core::{
    recreate_transform, Assoc, Document, Mappable, Mapping, Schema, Step, Transform,
    TransformError,
};
use uuid::Uuid;

use crate::conflict::find_conflicts;
use crate::error::CollabError;
use crate::failure::FailureHandler;
use crate::merge::auto_merge;
use crate::participants::{ParticipantChanges, Participants, Selection};
use crate::protocol::{
    random_client_id, ClientDiffMessage, ClientMessage, ClientSelectionMessage, DocInfo,
    ServerDocDataMessage, ServerMessage,
};
use crate::reconciler::{plan, ReconcileOutcome, ReconcilePath, ReconcilerState};
use crate::state::CollabState;
use crate::tracker::{DiffTracker, LocalSelection, SendGate};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a diff response before sending again.
    pub resend_timeout: Duration,
    /// Minimum spacing of version checks.
    pub check_version_timeout: Duration,
    /// Where offline documents are written when a merge fails.
    pub export_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resend_timeout: Duration::from_secs(8),
            check_version_timeout: Duration::from_secs(1),
            export_dir: None,
        }
    }
}

/// Something the application may want to react to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Welcome { session_id: Uuid },
    Subscribed,
    Document(ReconcileOutcome),
    /// Steps from another client were applied.
    RemoteChange { mapping: Mapping, dropped: Vec<Step> },
    DiffConfirmed { rid: u64, version: u64 },
    DiffRejected { rid: u64 },
    VersionConfirmed { v: u64 },
    ParticipantsChanged(ParticipantChanges),
    SelectionChanged { session_id: Uuid },
    /// The server could not apply our steps and is resetting the document.
    PatchError,
    ServerError { message: String },
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

pub struct CollabSession {
    doc_id: Uuid,
    user_id: Uuid,
    user_name: String,
    session_id: Option<Uuid>,
    config: SessionConfig,

    state: CollabState,
    tracker: DiffTracker,
    reconciler: ReconcilerState,
    participants: Participants,
    failure: FailureHandler,

    outbox: VecDeque<ClientMessage>,
    connected: bool,
    /// Subscriptions sent so far, across reconnects.
    connections: u32,
    loading: bool,
    halted: bool,
    resubscribed: bool,
    /// Set when local state is known to be out of sync; the next document
    /// replaces it.
    reset_pending: bool,
    checking_version_until: Option<Instant>,
    selection: Option<Selection>,
    doc_info: Option<DocInfo>,
    server_time_offset: Option<TimeDelta>,
}

impl CollabSession {
    pub fn new(
        doc_id: Uuid,
        user_id: Uuid,
        user_name: impl Into<String>,
        schema: Arc<Schema>,
        config: SessionConfig,
    ) -> Self {
        let client_id = random_client_id();
        Self {
            doc_id,
            user_id,
            user_name: user_name.into(),
            session_id: None,
            tracker: DiffTracker::new(config.resend_timeout),
            failure: FailureHandler::new(config.export_dir.clone()),
            config,
            state: CollabState::new(schema, client_id),
            reconciler: ReconcilerState::Synced,
            participants: Participants::new(Uuid::nil()),
            outbox: VecDeque::new(),
            connected: false,
            connections: 0,
            loading: true,
            halted: false,
            resubscribed: false,
            reset_pending: false,
            checking_version_until: None,
            selection: None,
            doc_info: None,
            server_time_offset: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn client_id(&self) -> u64 {
        self.state.client_id()
    }

    pub fn doc(&self) -> &Document {
        self.state.doc()
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    pub fn state(&self) -> &CollabState {
        &self.state
    }

    pub fn tracker(&self) -> &DiffTracker {
        &self.tracker
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    pub fn reconciler_state(&self) -> ReconcilerState {
        self.reconciler
    }

    pub fn doc_info(&self) -> Option<&DocInfo> {
        self.doc_info.as_ref()
    }

    /// Local clock minus server clock, from the last document received.
    pub fn server_time_offset(&self) -> Option<TimeDelta> {
        self.server_time_offset
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Subscriptions sent so far.
    pub fn connection_count(&self) -> u32 {
        self.connections
    }

    pub fn is_checking_version(&self) -> bool {
        self.checking_version_until.is_some()
    }

    // ── Connection ───────────────────────────────────────────────

    /// The subscription to send right after the socket opens. On a
    /// reconnect, diff sending stays blocked until the version is checked.
    pub fn subscribe_message(&mut self, now: Instant) -> ClientMessage {
        let connection = self.connections;
        self.connections += 1;
        if connection > 0 {
            self.tracker.disable(now);
            self.resubscribed = true;
        }
        ClientMessage::Subscribe {
            doc_id: self.doc_id,
            id: self.user_id,
            name: self.user_name.clone(),
            connection,
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        if connected {
            info!("Session for document {} connected", self.doc_id);
        } else {
            info!(
                "Session for document {} disconnected at version {}",
                self.doc_id,
                self.state.version()
            );
            self.outbox.clear();
            self.checking_version_until = None;
        }
    }

    // ── Outgoing ─────────────────────────────────────────────────

    /// Next message to send, if any. Call whenever the document or the
    /// selection changed, after every incoming message, and periodically
    /// so timeouts fire.
    pub fn poll(&mut self, now: Instant) -> Option<ClientMessage> {
        if self.halted || !self.connected {
            return None;
        }
        if self.checking_version_until.is_some_and(|until| now >= until) {
            self.checking_version_until = None;
        }
        self.tracker.poll_timeout(now);

        if let Some(msg) = self.outbox.pop_front() {
            return Some(msg);
        }

        let gate = SendGate {
            connected: self.connected,
            loading: self.loading,
            receiving: self.reconciler != ReconcilerState::Synced,
            halted: self.halted,
        };
        let selection = match (self.session_id, self.selection) {
            (Some(session_id), Some(selection)) => Some(LocalSelection {
                user_id: self.user_id,
                session_id,
                anchor: selection.anchor,
                head: selection.head,
            }),
            _ => None,
        };
        self.tracker.try_send(gate, &self.state, selection, now)
    }

    /// Ask the server whether our version is current. At most one check
    /// per `check_version_timeout`; blocks diff sending until answered.
    pub fn check_version(&mut self, now: Instant) {
        if !self.state.is_loaded() {
            return;
        }
        if self.checking_version_until.is_some_and(|until| now < until) {
            return;
        }
        self.checking_version_until = Some(now + self.config.check_version_timeout);
        if self.connected {
            self.tracker.disable(now);
        }
        debug!("Checking version {} of document {}", self.state.version(), self.doc_id);
        self.outbox.push_back(ClientMessage::CheckVersion {
            v: self.state.version(),
        });
    }

    // ── Local changes ────────────────────────────────────────────

    /// Apply a local edit. The closure receives a transform starting at
    /// the current document.
    pub fn edit<F>(&mut self, f: F) -> Result<(), CollabError>
    where
        F: FnOnce(&mut Transform) -> Result<(), TransformError>,
    {
        if self.halted {
            return Err(CollabError::Halted);
        }
        if !self.state.is_loaded() {
            return Err(CollabError::NoDocument);
        }
        let mut tr = Transform::new(self.state.schema().clone(), self.state.doc().clone());
        f(&mut tr)?;
        if !tr.doc_changed() {
            return Ok(());
        }
        self.state.apply_transform(&tr)?;
        self.map_selections(tr.mapping());
        Ok(())
    }

    /// Move the local caret or selection. Positions are clamped to the
    /// document.
    pub fn set_selection(&mut self, anchor: usize, head: usize) {
        let size = self.state.doc().size();
        self.selection = Some(Selection {
            anchor: anchor.min(size),
            head: head.min(size),
        });
    }

    // ── Incoming ─────────────────────────────────────────────────

    pub fn handle_message(
        &mut self,
        msg: ServerMessage,
        now: Instant,
    ) -> Result<Option<SessionEvent>, CollabError> {
        if self.halted {
            return Err(CollabError::Halted);
        }

        match msg {
            ServerMessage::Welcome { session_id } => {
                debug!("Welcomed as session {}", session_id);
                self.session_id = Some(session_id);
                self.participants.set_local_session(session_id);
                Ok(Some(SessionEvent::Welcome { session_id }))
            }

            ServerMessage::Subscribed => Ok(Some(SessionEvent::Subscribed)),

            ServerMessage::Connections { participant_list } => {
                let changes = self.participants.update(&participant_list);
                if self.resubscribed {
                    self.resubscribed = false;
                    self.check_version(now);
                }
                Ok(Some(SessionEvent::ParticipantsChanged(changes)))
            }

            ServerMessage::DocData(data) => {
                let outcome = self.receive_document(data)?;
                Ok(Some(SessionEvent::Document(outcome)))
            }

            ServerMessage::ConfirmVersion { v } => {
                self.checking_version_until = None;
                if v != self.state.version() {
                    self.check_version(now);
                    return Ok(None);
                }
                self.tracker.enable();
                Ok(Some(SessionEvent::VersionConfirmed { v }))
            }

            ServerMessage::Diff(diff) => Ok(self.receive_diff(diff, now)),

            ServerMessage::ConfirmDiff { rid } => Ok(self.confirm_rid(rid)),

            ServerMessage::RejectDiff { rid } => {
                if self.tracker.on_reject(rid) {
                    Ok(Some(SessionEvent::DiffRejected { rid }))
                } else {
                    Ok(None)
                }
            }

            ServerMessage::SelectionChange(selection) => {
                Ok(self.receive_selection(selection, now))
            }

            ServerMessage::PatchError => {
                warn!(
                    "Document {} was out of sync with the server and is being reset",
                    self.doc_id
                );
                self.reset_pending = true;
                Ok(Some(SessionEvent::PatchError))
            }

            ServerMessage::Error { message } => {
                warn!("Server error for document {}: {}", self.doc_id, message);
                Ok(Some(SessionEvent::ServerError { message }))
            }
        }
    }

    /// Treat diff `rid` as accepted by the server.
    fn confirm_rid(&mut self, rid: u64) -> Option<SessionEvent> {
        let record = self.tracker.on_ack(rid)?;
        self.state.confirm(record.step_count, record.doc);
        self.tracker.drop_stale(self.state.version());
        debug!("Diff rid={} confirmed, now at version {}", rid, self.state.version());
        Some(SessionEvent::DiffConfirmed {
            rid,
            version: self.state.version(),
        })
    }

    fn receive_diff(&mut self, diff: ClientDiffMessage, now: Instant) -> Option<SessionEvent> {
        if diff.cid == Some(self.state.client_id()) {
            if diff.server_fix {
                self.tracker.enable();
            }
            return self.confirm_rid(diff.rid);
        }
        if diff.v != self.state.version() {
            debug!(
                "Diff for version {} while at version {}, checking version",
                diff.v,
                self.state.version()
            );
            self.check_version(now);
            return None;
        }

        self.reconciler = ReconcilerState::Receiving;
        let result = self.state.receive(&diff.ds);
        self.reconciler = ReconcilerState::Synced;
        match result {
            Ok(received) => {
                if !received.dropped.is_empty() {
                    warn!(
                        "{} local steps no longer apply after a remote change and were dropped",
                        received.dropped.len()
                    );
                }
                self.map_selections(&received.mapping);
                self.tracker.drop_stale(self.state.version());
                if diff.server_fix {
                    self.checking_version_until = None;
                    self.tracker.enable();
                }
                Some(SessionEvent::RemoteChange {
                    mapping: received.mapping,
                    dropped: received.dropped,
                })
            }
            Err(e) => {
                warn!("Could not apply remote diff, requesting the document: {}", e);
                self.loading = true;
                self.reset_pending = true;
                self.outbox.push_back(ClientMessage::GetDocument);
                None
            }
        }
    }

    fn receive_selection(
        &mut self,
        msg: ClientSelectionMessage,
        now: Instant,
    ) -> Option<SessionEvent> {
        self.checking_version_until = None;
        if msg.v != self.state.version() {
            self.check_version(now);
            return None;
        }
        if self.participants.set_selection(&msg) {
            Some(SessionEvent::SelectionChanged {
                session_id: msg.session_id,
            })
        } else {
            None
        }
    }

    fn map_selections(&mut self, mapping: &Mapping) {
        let size = self.state.doc().size();
        self.participants.map_through(mapping, size);
        if let Some(selection) = self.selection {
            self.selection = Some(Selection {
                anchor: mapping.map(selection.anchor, Assoc::After).min(size),
                head: mapping.map(selection.head, Assoc::After).min(size),
            });
        }
    }

    // ── Documents ────────────────────────────────────────────────

    fn receive_document(&mut self, data: ServerDocDataMessage) -> Result<ReconcileOutcome, CollabError> {
        self.checking_version_until = None;
        let content = Document::from_json(self.state.schema(), &data.doc.content)?;
        let v = data.doc.v;
        self.server_time_offset = Some(Utc::now() - data.time);
        self.doc_info = Some(data.doc_info);

        if let Some(log) = data.m.as_deref() {
            if !self.reset_pending && self.state.has_unconfirmed() {
                self.absorb_own_diffs(log);
            }
        }

        let path = if self.reset_pending && self.state.is_loaded() {
            ReconcilePath::Reset
        } else {
            plan(&self.state, v, &content, data.m.is_some())
        };
        self.reset_pending = false;
        debug!(
            "Document {} at version {} (local {}): {:?}",
            self.doc_id,
            v,
            self.state.version(),
            path
        );

        let outcome = match path {
            ReconcilePath::Load => {
                self.load(content, v);
                Ok(ReconcileOutcome::Loaded)
            }
            ReconcilePath::UpToDate => {
                self.tracker.enable();
                Ok(ReconcileOutcome::UpToDate)
            }
            ReconcilePath::ReplayLog => {
                let log = data.m.unwrap_or_default();
                Ok(self.replay_log(content, v, &log))
            }
            ReconcilePath::Merge => self.merge(content, v, data.m.as_deref()),
            ReconcilePath::Reset => {
                error!(
                    "Server has lost data for document {}: local version {}, server version {}; resetting",
                    self.doc_id,
                    self.state.version(),
                    v
                );
                self.load(content, v);
                Ok(ReconcileOutcome::Reset)
            }
        };
        self.loading = false;
        self.reconciler = ReconcilerState::Synced;
        outcome
    }

    /// Confirm our own diffs at the head of a snapshot log. They were
    /// accepted while their confirmation was lost with the connection, so
    /// they must not be merged as remote changes.
    fn absorb_own_diffs(&mut self, log: &[ClientDiffMessage]) {
        let own = Some(self.state.client_id());
        for msg in log {
            let local = self.state.version();
            if msg.v < local {
                continue;
            }
            if msg.v > local || msg.cid != own {
                break;
            }
            if self.tracker.has_unconfirmed(msg.rid) {
                self.confirm_rid(msg.rid);
            } else if let Err(e) = self.state.receive_own(&msg.ds) {
                warn!("Could not replay own diff rid={}: {}", msg.rid, e);
                self.reset_pending = true;
                return;
            }
            debug!("Own diff rid={} found in log, now at version {}", msg.rid, local + 1);
        }
    }

    fn load(&mut self, content: Document, v: u64) {
        self.state.load(content, v);
        self.tracker.reset();
        self.participants.clear_selections();
        self.selection = None;
    }

    /// Apply the missed diffs attached to a snapshot. Diffs older than
    /// the local version were already applied and are skipped, so the
    /// same snapshot can arrive twice.
    fn replay_log(&mut self, content: Document, v: u64, log: &[ClientDiffMessage]) -> ReconcileOutcome {
        self.reconciler = ReconcilerState::Receiving;
        let mut applied = 0;
        let mut skipped = 0;

        for msg in log {
            let local = self.state.version();
            if msg.v < local {
                skipped += 1;
                continue;
            }
            if msg.v > local {
                warn!("Missing diffs between versions {} and {}", local, msg.v);
                return self.reset_to(content, v);
            }

            if msg.cid == Some(self.state.client_id()) {
                if self.tracker.has_unconfirmed(msg.rid) {
                    self.confirm_rid(msg.rid);
                } else if let Err(e) = self.state.receive_own(&msg.ds) {
                    warn!("Could not replay own diff rid={}: {}", msg.rid, e);
                    return self.reset_to(content, v);
                }
            } else {
                match self.state.receive(&msg.ds) {
                    Ok(received) => self.map_selections(&received.mapping),
                    Err(e) => {
                        warn!("Could not replay diff for version {}: {}", msg.v, e);
                        return self.reset_to(content, v);
                    }
                }
            }
            applied += 1;
        }

        if self.state.version() != v || self.state.confirmed() != Some(&content) {
            return self.reset_to(content, v);
        }
        self.tracker.drop_stale(v);
        self.tracker.enable();
        debug!("Replayed {} diffs ({} already applied)", applied, skipped);
        ReconcileOutcome::Replayed { applied, skipped }
    }

    fn reset_to(&mut self, content: Document, v: u64) -> ReconcileOutcome {
        error!(
            "Server has lost data for document {}: local version {}, server version {}; resetting",
            self.doc_id,
            self.state.version(),
            v
        );
        self.load(content, v);
        ReconcileOutcome::Reset
    }

    /// Bring unconfirmed local steps onto a newer server document.
    fn merge(
        &mut self,
        content: Document,
        v: u64,
        log: Option<&[ClientDiffMessage]>,
    ) -> Result<ReconcileOutcome, CollabError> {
        self.reconciler = ReconcilerState::Reconciling;
        let offline = self.state.doc().clone();
        info!(
            "Merging {} offline steps of document {} from version {} into version {}",
            self.state.unconfirmed().len(),
            self.doc_id,
            self.state.version(),
            v
        );
        match self.try_merge(content, v, log) {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.halt(&offline, e.to_string())),
        }
    }

    fn try_merge(
        &mut self,
        content: Document,
        v: u64,
        log: Option<&[ClientDiffMessage]>,
    ) -> Result<ReconcileOutcome, CollabError> {
        let schema = self.state.schema().clone();
        let confirmed = self.state.confirmed().ok_or(CollabError::NoDocument)?.clone();

        let lost = self.lost_transform(&confirmed, &content, log)?;
        let mut local = Transform::new(schema.clone(), confirmed);
        for rebaseable in self.state.unconfirmed() {
            local.step(rebaseable.step.clone())?;
        }

        let conflicts = find_conflicts(&local, &lost);
        if !conflicts.is_empty() {
            let export = self.failure.conflict(
                self.doc_id,
                self.state.doc(),
                self.state.version(),
                conflicts.len(),
            );
            self.load(content, v);
            return Ok(ReconcileOutcome::Conflicted {
                conflicts,
                export: Box::new(export),
            });
        }

        let report = auto_merge(schema, &local, &lost)?;
        let dropped = report.dropped.len();
        self.state
            .adopt_merge(content, report.transform.doc().clone(), report.rebased, v);
        self.tracker.reset();
        self.participants.clear_selections();
        self.selection = None;
        Ok(ReconcileOutcome::Merged { dropped })
    }

    /// The remote changes since the confirmed document, from the log when
    /// it reproduces the snapshot, rebuilt from the two documents otherwise.
    fn lost_transform(
        &self,
        confirmed: &Document,
        content: &Document,
        log: Option<&[ClientDiffMessage]>,
    ) -> Result<Transform, CollabError> {
        let schema = self.state.schema().clone();
        if let Some(log) = log {
            let mut tr = Transform::new(schema.clone(), confirmed.clone());
            let remote = log.iter().filter(|msg| {
                msg.cid != Some(self.state.client_id()) && msg.v >= self.state.version()
            });
            for msg in remote {
                for step in &msg.ds {
                    if let Err(e) = tr.maybe_step(step.clone()) {
                        debug!("Logged step does not apply: {}", e);
                    }
                }
            }
            if tr.doc() == content {
                return Ok(tr);
            }
            debug!("Diff log does not reproduce the server document, recreating steps");
        }
        Ok(recreate_transform(schema, confirmed, content)?)
    }

    /// Stop synchronizing after a failed merge. The offline document is
    /// exported and attached to the returned error.
    fn halt(&mut self, offline: &Document, reason: String) -> CollabError {
        let export = self
            .failure
            .merge_failed(self.doc_id, offline, self.state.version(), &reason);
        self.halted = true;
        self.outbox.clear();
        CollabError::MergeFailed {
            reason,
            export: Box::new(export),
        }
    }
}
