use crate::failure::OfflineExport;
use crate::merge::MergeError;
use crate::protocol::ProtocolError;
use quire_core::{SchemaError, StepError, TransformError};
use thiserror::Error;

/// Errors surfaced by a collaboration session.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Step error: {0}")]
    Step(#[from] StepError),
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),
    /// Merging offline edits failed. The session is halted; the offline
    /// document is attached so it can be saved by the user.
    #[error("Merge failed: {reason}")]
    MergeFailed {
        reason: String,
        export: Box<OfflineExport>,
    },
    #[error("Session halted after a failed merge; reload the document")]
    Halted,
    #[error("No document loaded")]
    NoDocument,
}
