//! JSON wire protocol between editor sessions and the sync server.
//!
//! Every WebSocket text frame carries one message, tagged by `type`:
//! ```text
//! client → server                      server → client
//! ───────────────                      ───────────────
//! subscribe { doc_id, id, name, .. }   welcome { session_id }
//! get_document                         subscribed
//! check_version { v }                  doc_data { doc, time, docInfo, m? }
//! diff { v, ds, rid, cid? }            confirm_diff { rid } / reject_diff { rid }
//! selection_change { .. }              confirm_version { v }
//!                                      diff { .., server_fix? }   (relayed)
//!                                      selection_change { .. }    (relayed)
//!                                      connections { participant_list }
//!                                      patch_error / error { message }
//! ```
//!
//! Steps travel in their own JSON form (`stepType`-tagged) and are checked
//! against the schema by whoever applies them.

use chrono::{DateTime, Utc};
use quire_core::{Schema, Step, StepError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Largest integer a JSON number carries without loss in every client.
const CLIENT_ID_MASK: u128 = (1 << 53) - 1;

/// Derive a random numeric client id, used as `cid` on outgoing diffs.
pub fn random_client_id() -> u64 {
    (Uuid::new_v4().as_u128() & CLIENT_ID_MASK) as u64
}

/// A collaborator connected to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    pub session_id: Uuid,
}

impl Participant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            session_id: Uuid::new_v4(),
        }
    }
}

/// A batch of steps based on version `v`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDiffMessage {
    pub v: u64,
    pub ds: Vec<Step>,
    pub rid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
    /// Set on diffs the server resends to a client that fell behind.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub server_fix: bool,
}

impl ClientDiffMessage {
    /// Check every step against the schema.
    pub fn validate(&self, schema: &Schema) -> Result<(), StepError> {
        self.ds.iter().try_for_each(|step| step.validate(schema))
    }
}

/// Caret or selection of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSelectionMessage {
    pub id: Uuid,
    pub v: u64,
    pub session_id: Uuid,
    pub anchor: usize,
    pub head: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocData {
    pub v: u64,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocInfo {
    pub id: Uuid,
    pub title: String,
    pub updated: DateTime<Utc>,
}

/// Full document snapshot, optionally with the diffs a client missed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDocDataMessage {
    pub doc: DocData,
    pub time: DateTime<Utc>,
    #[serde(rename = "docInfo")]
    pub doc_info: DocInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Vec<ClientDiffMessage>>,
}

/// Messages sent by editor sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a document room. `connection` counts earlier connections of
    /// the same session; the document is only sent on the first one.
    Subscribe {
        doc_id: Uuid,
        id: Uuid,
        name: String,
        connection: u32,
    },
    GetDocument,
    CheckVersion {
        v: u64,
    },
    Diff(ClientDiffMessage),
    SelectionChange(ClientSelectionMessage),
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { session_id: Uuid },
    Subscribed,
    DocData(ServerDocDataMessage),
    ConfirmDiff { rid: u64 },
    RejectDiff { rid: u64 },
    ConfirmVersion { v: u64 },
    Diff(ClientDiffMessage),
    SelectionChange(ClientSelectionMessage),
    Connections { participant_list: Vec<Participant> },
    PatchError,
    Error { message: String },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Pull the request id out of a diff frame that failed to decode, so the
/// sender can be told its diff was rejected.
pub fn salvage_rid(text: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "diff" {
        return None;
    }
    value.get("rid")?.as_u64()
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
