//! Authoritative document room.
//!
//! The room owns the server copy of one document, its version, and the
//! most recent accepted diffs. It does no I/O: every handler returns the
//! messages to deliver and who should get them.
//!
//! ```text
//! diff { v, ds, rid }
//!   v == version ── apply ── ok ──► confirm_diff → sender, diff → others
//!                     │
//!                     └── fails ──► patch_error → sender, doc_data → all
//!   v <  version ── gap in history ──► missed diffs (server_fix) → sender
//!                └─ gap too large ───► doc_data → sender
//!   v >  version ──► reject_diff → sender
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use quire_core::{Document, Schema};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{
    ClientDiffMessage, ClientMessage, ClientSelectionMessage, DocData, DocInfo, Participant,
    ServerDocDataMessage, ServerMessage,
};

const MAX_TITLE_CHARS: usize = 255;

/// Who a message is delivered to, relative to the session being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Sender,
    Others,
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: Recipient,
    pub message: ServerMessage,
}

impl Outgoing {
    fn sender(message: ServerMessage) -> Self {
        Self {
            to: Recipient::Sender,
            message,
        }
    }

    fn others(message: ServerMessage) -> Self {
        Self {
            to: Recipient::Others,
            message,
        }
    }

    fn all(message: ServerMessage) -> Self {
        Self {
            to: Recipient::All,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("Document is full ({0} sessions)")]
    Full(usize),
    #[error("Session {0} is already subscribed")]
    AlreadyJoined(Uuid),
}

pub struct DocumentRoom {
    id: Uuid,
    schema: Arc<Schema>,
    doc: Document,
    version: u64,
    /// Accepted diffs, oldest first; the last one moved the document to
    /// `version`.
    history: VecDeque<ClientDiffMessage>,
    history_length: usize,
    max_participants: usize,
    participants: Vec<Participant>,
    updated: DateTime<Utc>,
}

impl DocumentRoom {
    pub fn new(id: Uuid, schema: Arc<Schema>, history_length: usize, max_participants: usize) -> Self {
        Self::with_document(id, schema, Document::empty(), 0, history_length, max_participants)
    }

    /// A room starting from an existing document.
    pub fn with_document(
        id: Uuid,
        schema: Arc<Schema>,
        doc: Document,
        version: u64,
        history_length: usize,
        max_participants: usize,
    ) -> Self {
        Self {
            id,
            schema,
            doc,
            version,
            history: VecDeque::new(),
            history_length,
            max_participants,
            participants: Vec::new(),
            updated: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    // ── Membership ───────────────────────────────────────────────

    /// Add a session. The document is only sent on its first connection;
    /// a reconnecting client checks its version instead.
    pub fn join(&mut self, participant: Participant, connection: u32) -> Result<Vec<Outgoing>, RoomError> {
        if self
            .participants
            .iter()
            .any(|p| p.session_id == participant.session_id)
        {
            return Err(RoomError::AlreadyJoined(participant.session_id));
        }
        if self.participants.len() >= self.max_participants {
            return Err(RoomError::Full(self.max_participants));
        }
        info!(
            "{} joined document {} (connection {})",
            participant.name, self.id, connection
        );
        self.participants.push(participant);

        let mut out = vec![Outgoing::sender(ServerMessage::Subscribed)];
        if connection < 1 {
            out.push(Outgoing::sender(self.doc_data(None)));
        }
        out.push(self.connections());
        Ok(out)
    }

    pub fn leave(&mut self, session_id: Uuid) -> Vec<Outgoing> {
        let before = self.participants.len();
        self.participants.retain(|p| p.session_id != session_id);
        if self.participants.len() == before {
            return Vec::new();
        }
        debug!("Session {} left document {}", session_id, self.id);
        vec![self.connections()]
    }

    fn connections(&self) -> Outgoing {
        Outgoing::all(ServerMessage::Connections {
            participant_list: self.participants.clone(),
        })
    }

    // ── Messages ─────────────────────────────────────────────────

    pub fn handle_message(&mut self, msg: ClientMessage) -> Vec<Outgoing> {
        match msg {
            ClientMessage::Subscribe { .. } => vec![Outgoing::sender(ServerMessage::Error {
                message: "Already subscribed".into(),
            })],
            ClientMessage::GetDocument => vec![Outgoing::sender(self.doc_data(None))],
            ClientMessage::CheckVersion { v } => self.check_version(v),
            ClientMessage::Diff(diff) => self.handle_diff(diff),
            ClientMessage::SelectionChange(selection) => self.handle_selection(selection),
        }
    }

    pub fn handle_diff(&mut self, diff: ClientDiffMessage) -> Vec<Outgoing> {
        if diff.v > self.version {
            debug!(
                "Rejecting diff rid={} for future version {} (at {})",
                diff.rid, diff.v, self.version
            );
            return self.reject(diff.rid);
        }

        if diff.v < self.version {
            return match self.missed_since(diff.v) {
                Some(missed) => {
                    debug!(
                        "Client at version {} is behind, resending {} diffs",
                        diff.v,
                        missed.len()
                    );
                    missed
                        .into_iter()
                        .map(|mut m| {
                            m.server_fix = true;
                            Outgoing::sender(ServerMessage::Diff(m))
                        })
                        .collect()
                }
                None => {
                    debug!("Client at version {} is too far behind, resending document", diff.v);
                    vec![Outgoing::sender(self.doc_data(None))]
                }
            };
        }

        let applied = diff.validate(&self.schema).map_err(|e| e.to_string()).and_then(|_| {
            diff.ds.iter().try_fold(self.doc.clone(), |doc, step| {
                step.apply(&doc, &self.schema).map_err(|e| e.to_string())
            })
        });
        let doc = match applied {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "Diff rid={} does not apply to document {} at version {}: {}",
                    diff.rid, self.id, self.version, e
                );
                return vec![
                    Outgoing::sender(ServerMessage::PatchError),
                    Outgoing::all(self.doc_data(None)),
                ];
            }
        };

        self.doc = doc;
        self.version += 1;
        self.updated = Utc::now();
        self.history.push_back(diff.clone());
        while self.history.len() > self.history_length {
            self.history.pop_front();
        }

        vec![
            Outgoing::sender(ServerMessage::ConfirmDiff { rid: diff.rid }),
            Outgoing::others(ServerMessage::Diff(diff)),
        ]
    }

    /// Refuse a diff, also used for frames whose steps did not decode.
    pub fn reject(&self, rid: u64) -> Vec<Outgoing> {
        vec![Outgoing::sender(ServerMessage::RejectDiff { rid })]
    }

    pub fn check_version(&self, v: u64) -> Vec<Outgoing> {
        if v == self.version {
            return vec![Outgoing::sender(ServerMessage::ConfirmVersion { v })];
        }
        let missed = if v < self.version { self.missed_since(v) } else { None };
        if missed.is_none() {
            debug!("Client on version {} of document {} gets the full document", v, self.id);
        }
        vec![Outgoing::sender(self.doc_data(missed))]
    }

    /// Selections are only meaningful against the current version.
    pub fn handle_selection(&self, selection: ClientSelectionMessage) -> Vec<Outgoing> {
        if selection.v != self.version {
            return Vec::new();
        }
        vec![Outgoing::others(ServerMessage::SelectionChange(selection))]
    }

    /// Diffs accepted after version `v`, if all of them are still kept.
    fn missed_since(&self, v: u64) -> Option<Vec<ClientDiffMessage>> {
        let gap = usize::try_from(self.version.checked_sub(v)?).ok()?;
        if gap > self.history.len() {
            return None;
        }
        Some(self.history.iter().skip(self.history.len() - gap).cloned().collect())
    }

    pub fn doc_data(&self, m: Option<Vec<ClientDiffMessage>>) -> ServerMessage {
        ServerMessage::DocData(ServerDocDataMessage {
            doc: DocData {
                v: self.version,
                content: self.doc.to_json(),
            },
            time: Utc::now(),
            doc_info: DocInfo {
                id: self.id,
                title: self.doc.first_block_text().chars().take(MAX_TITLE_CHARS).collect(),
                updated: self.updated,
            },
            m,
        })
    }
}
