//! # quire-core
//!
//! Rich-text document model for collaborative editing.
//!
//! ```text
//!  Schema ──validates──► Document ◄──apply── Step ──get_map──► StepMap
//!                           │                  │                  │
//!                           ▼                  ▼                  ▼
//!                       Transform ─────── steps + docs ──────► Mapping
//!                           │                                 (mirrors)
//!              ┌────────────┼─────────────┐
//!              ▼            ▼             ▼
//!         rebase_steps   ChangeSet   recreate_transform
//! ```
//!
//! Documents are immutable; every change is a [`Step`] that can be
//! inverted, mapped through later changes, and applied to a document under
//! a [`Schema`]. The collaboration layer builds its rebase, conflict
//! detection and merge logic on these pieces.

pub mod changeset;
pub mod mapping;
pub mod node;
pub mod recreate;
pub mod schema;
pub mod step;
pub mod transform;

pub use changeset::{Change, ChangeKind, ChangeSet};
pub use mapping::{Assoc, MapResult, Mappable, Mapping, StepMap};
pub use node::{Document, Slice, Token};
pub use recreate::recreate_transform;
pub use schema::{BlockType, Mark, MarkType, Schema, SchemaError};
pub use step::{Step, StepError};
pub use transform::{rebase_steps, RebaseOutcome, Rebaseable, Transform, TransformError};
