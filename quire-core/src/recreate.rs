//! Derive a step sequence between two arbitrary documents.
//!
//! Used when the steps that produced a document are unavailable. The
//! result is one replace over the region where the mark-free token streams
//! differ, followed by mark steps for the unchanged text around it.

use crate::node::{Document, Slice, Token};
use crate::schema::Schema;
use crate::step::Step;
use crate::transform::{coalesce, Transform, TransformError};
use std::sync::Arc;

/// Build a transform from `from` whose resulting document equals `to`.
pub fn recreate_transform(
    schema: Arc<Schema>,
    from: &Document,
    to: &Document,
) -> Result<Transform, TransformError> {
    let mut tr = Transform::new(schema, from.clone());
    let a = from.tokens();
    let b = to.tokens();

    let prefix = a
        .iter()
        .zip(b)
        .take_while(|(x, y)| x.same_markup_free(y))
        .count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x.same_markup_free(y))
        .count();

    let a_end = a.len() - suffix;
    let b_end = b.len() - suffix;
    if prefix < a_end || prefix < b_end {
        tr.replace(prefix, a_end, Slice::new(b[prefix..b_end].to_vec()))?;
    }

    let mut removed = Vec::new();
    let mut added = Vec::new();
    for (pos, (current, target)) in tr.doc().tokens().iter().zip(b).enumerate() {
        let (Token::Char(_, have), Token::Char(_, want)) = (current, target) else {
            continue;
        };
        for mark in have.iter().filter(|m| !want.contains(m)) {
            coalesce(
                &mut removed,
                Step::RemoveMark {
                    from: pos,
                    to: pos + 1,
                    mark: mark.clone(),
                },
            );
        }
        for mark in want.iter().filter(|m| !have.contains(m)) {
            coalesce(
                &mut added,
                Step::AddMark {
                    from: pos,
                    to: pos + 1,
                    mark: mark.clone(),
                },
            );
        }
    }
    for step in removed.into_iter().chain(added) {
        tr.step(step)?;
    }

    if tr.doc() != to {
        return Err(TransformError::Mismatch);
    }
    Ok(tr)
}
