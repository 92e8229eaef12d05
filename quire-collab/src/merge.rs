//! Automatic merge of unconfirmed local steps onto a newer server document.
//!
//! The mapping used to move each local step is built as
//! ```text
//!   inv(L[n-1]) … inv(L[0])  R[0] … R[m-1]  L'[0] … L'[k-1]
//!   └──── n inverted ─────┘  └── remote ──┘  └─ rebased ─┘
//! ```
//! Local step `i` is mapped through everything after `inv(L[i])`. Each
//! rebased step is appended and mirrored to the inverse of its original, so
//! a later local step that sits inside content an earlier one inserted
//! keeps its exact position.

use std::sync::Arc;

use log::{debug, warn};
use quire_core::{Mapping, Rebaseable, Schema, Step, Transform};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("Local and remote transforms start from different documents")]
    BaseMismatch,
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    /// Rebased local steps, applied on top of the remote document.
    pub transform: Transform,
    pub rebased: Vec<Rebaseable>,
    /// Local steps that could not be mapped or applied.
    pub dropped: Vec<Step>,
}

/// Rebase the steps of `local` onto the result of `remote`.
pub fn auto_merge(
    schema: Arc<Schema>,
    local: &Transform,
    remote: &Transform,
) -> Result<MergeReport, MergeError> {
    if local.before() != remote.before() {
        return Err(MergeError::BaseMismatch);
    }

    let n = local.steps().len();
    let m = remote.steps().len();
    let mut maps = Mapping::new();
    for map in local.mapping().maps().iter().rev() {
        maps.append_map(map.invert(), None);
    }
    for map in remote.mapping().maps() {
        maps.append_map(map.clone(), None);
    }

    let mut rebased_tr = Transform::new(schema, remote.doc().clone());
    let mut rebased = Vec::new();
    let mut dropped = Vec::new();
    for (i, step) in local.steps().iter().enumerate() {
        let Some(mapped) = step.map(&maps.slice(n - i)) else {
            warn!("Dropping local step {} during merge: its range was deleted remotely", i);
            dropped.push(step.clone());
            continue;
        };
        let before = rebased_tr.doc().clone();
        match rebased_tr.maybe_step(mapped.clone()) {
            Ok(()) => {
                maps.append_map(mapped.get_map(), None);
                maps.set_mirror(n - i - 1, n + m + rebased_tr.steps().len() - 1);
                rebased.push(Rebaseable::new(mapped.clone(), mapped.invert(&before)));
            }
            Err(e) => {
                warn!("Dropping local step {} during merge: {}", i, e);
                dropped.push(step.clone());
            }
        }
    }

    debug!(
        "Merged {} of {} local steps over {} remote steps",
        rebased.len(),
        n,
        m
    );
    Ok(MergeReport {
        transform: rebased_tr,
        rebased,
        dropped,
    })
}
