//! Conflict detection between unconfirmed local steps and the remote steps
//! that arrived while they were pending. Both transforms must start at the
//! same confirmed document.

use log::debug;
use quire_core::{Change, ChangeSet, Transform};

/// A local change overlapping a remote one, in confirmed-document positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub local: Change,
    pub remote: Change,
}

/// Every overlapping pair of local and remote changes. Any overlap counts,
/// including an insertion touching the edge of a deleted range.
pub fn find_conflicts(unconfirmed: &Transform, lost: &Transform) -> Vec<Conflict> {
    let remote = ChangeSet::from_transform(&lost.simplify());
    let local = ChangeSet::from_transform(unconfirmed);
    let conflicts: Vec<Conflict> = local
        .find_conflicts(&remote)
        .into_iter()
        .map(|(local, remote)| Conflict { local, remote })
        .collect();
    debug!(
        "Conflict check: {} local changes, {} remote changes, {} conflicts",
        local.changes().len(),
        remote.changes().len(),
        conflicts.len()
    );
    conflicts
}
