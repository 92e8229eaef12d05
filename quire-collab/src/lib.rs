//! # quire-collab: Real-time collaboration layer for Quire
//!
//! Central-authority sync of [`quire_core`] documents over WebSocket. The
//! server holds the authoritative version of each document and accepts one
//! diff at a time per version; clients rebase their unconfirmed steps over
//! whatever the server accepted first.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient   │ ◄─────────────────► │ SyncServer   │
//! │ (per user)   │     JSON messages   │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ CollabSession│                     │ DocumentRoom │
//! │ tracker      │                     │ (authority)  │
//! │ reconciler   │                     └──────┬───────┘
//! │ merge        │                            │
//! └──────────────┘                    ┌───────┴───────┐
//!                                     │ BroadcastGroup│
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`state`]: confirmed document, version and unconfirmed steps
//! - [`tracker`]: one diff in flight, acks, rejects and resend timeout
//! - [`reconciler`]: what to do with a document snapshot from the server
//! - [`conflict`] / [`merge`]: offline edits against missed remote edits
//! - [`failure`]: offline export when a merge cannot be completed
//! - [`participants`]: remote sessions and their selections
//! - [`session`]: the client state machine, free of I/O
//! - [`room`] / [`broadcast`] / [`server`]: the server side
//! - [`client`]: WebSocket client driving a session

pub mod broadcast;
pub mod client;
pub mod config;
pub mod conflict;
pub mod error;
pub mod failure;
pub mod merge;
pub mod participants;
pub mod protocol;
pub mod reconciler;
pub mod room;
pub mod server;
pub mod session;
pub mod state;
pub mod tracker;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use conflict::{find_conflicts, Conflict};
pub use error::CollabError;
pub use failure::{FailureHandler, OfflineExport};
pub use merge::{auto_merge, MergeError, MergeReport};
pub use participants::{ParticipantChanges, Participants, RemoteParticipant, Selection};
pub use protocol::{
    ClientDiffMessage, ClientMessage, ClientSelectionMessage, DocData, DocInfo, Participant,
    ProtocolError, ServerDocDataMessage, ServerMessage,
};
pub use reconciler::{plan, ReconcileOutcome, ReconcilePath, ReconcilerState};
pub use room::{DocumentRoom, Outgoing, Recipient, RoomError};
pub use server::{ServerStats, SyncServer};
pub use session::{CollabSession, SessionConfig, SessionEvent};
pub use state::{CollabState, Received};
pub use tracker::{DiffTracker, LocalSelection, SendGate, UnconfirmedDiff};
