//! Collaborators connected to the same document and their selections.
//!
//! ```text
//! connections { participant_list }     selection_change { .. }
//!            │                                   │
//!            ▼                                   ▼
//! Participants::update()            Participants::set_selection()
//!   (join / leave)                    (known sessions only)
//!            │                                   │
//!            └────────────┬──────────────────────┘
//!                         ▼
//!         Participants::map_through()  on every document change
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;
use quire_core::{Assoc, Mappable, Mapping};
use uuid::Uuid;

use crate::protocol::{ClientSelectionMessage, Participant};

/// A selection in document positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn caret(pos: usize) -> Self {
        Self {
            anchor: pos,
            head: pos,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.anchor == self.head
    }

    fn map(&self, mapping: &Mapping, doc_size: usize) -> Self {
        Self {
            anchor: mapping.map(self.anchor, Assoc::After).min(doc_size),
            head: mapping.map(self.head, Assoc::After).min(doc_size),
        }
    }
}

/// A remote session as seen locally.
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    pub participant: Participant,
    pub selection: Option<Selection>,
    last_update: Instant,
}

impl RemoteParticipant {
    fn new(participant: Participant) -> Self {
        Self {
            participant,
            selection: None,
            last_update: Instant::now(),
        }
    }

    /// Time since the last selection update.
    pub fn time_since_update(&self) -> Duration {
        self.last_update.elapsed()
    }
}

/// Who else is editing, keyed by session id.
#[derive(Debug, Clone)]
pub struct Participants {
    local_session_id: Uuid,
    peers: HashMap<Uuid, RemoteParticipant>,
}

/// Sessions that joined or left with a `connections` update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantChanges {
    pub joined: Vec<Uuid>,
    pub left: Vec<Uuid>,
}

impl ParticipantChanges {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

impl Participants {
    pub fn new(local_session_id: Uuid) -> Self {
        Self {
            local_session_id,
            peers: HashMap::new(),
        }
    }

    /// Replace the known participants with the server's list. Our own
    /// session is skipped; departed sessions are removed with their
    /// selections.
    pub fn update(&mut self, list: &[Participant]) -> ParticipantChanges {
        let mut changes = ParticipantChanges::default();

        self.peers.retain(|session_id, _| {
            let present = list.iter().any(|p| p.session_id == *session_id);
            if !present {
                changes.left.push(*session_id);
            }
            present
        });

        for participant in list {
            if participant.session_id == self.local_session_id {
                continue;
            }
            match self.peers.get_mut(&participant.session_id) {
                Some(peer) => peer.participant = participant.clone(),
                None => {
                    changes.joined.push(participant.session_id);
                    self.peers
                        .insert(participant.session_id, RemoteParticipant::new(participant.clone()));
                }
            }
        }

        if !changes.is_empty() {
            debug!(
                "Participants changed: {} joined, {} left, {} connected",
                changes.joined.len(),
                changes.left.len(),
                self.peers.len()
            );
        }
        changes
    }

    /// Record a remote selection. Returns false for our own session or a
    /// session we do not know.
    pub fn set_selection(&mut self, msg: &ClientSelectionMessage) -> bool {
        if msg.session_id == self.local_session_id {
            return false;
        }
        let Some(peer) = self.peers.get_mut(&msg.session_id) else {
            debug!("Ignoring selection of unknown session {}", msg.session_id);
            return false;
        };
        peer.selection = Some(Selection {
            anchor: msg.anchor,
            head: msg.head,
        });
        peer.last_update = Instant::now();
        true
    }

    /// Move every remote selection through a document change.
    pub fn map_through(&mut self, mapping: &Mapping, doc_size: usize) {
        for peer in self.peers.values_mut() {
            if let Some(selection) = peer.selection {
                peer.selection = Some(selection.map(mapping, doc_size));
            }
        }
    }

    /// Drop every selection, after the document was replaced.
    pub fn clear_selections(&mut self) {
        for peer in self.peers.values_mut() {
            peer.selection = None;
        }
    }

    pub fn peer(&self, session_id: &Uuid) -> Option<&RemoteParticipant> {
        self.peers.get(session_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemoteParticipant> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The server assigned our session id.
    pub fn set_local_session(&mut self, session_id: Uuid) {
        self.local_session_id = session_id;
        self.peers.remove(&session_id);
    }

    pub fn local_session_id(&self) -> Uuid {
        self.local_session_id
    }
}
