//! Document steps: the atomic, invertible, mappable unit of change.

use crate::mapping::{Assoc, Mappable, StepMap};
use crate::node::{Document, Slice, Token};
use crate::schema::{Mark, Schema, SchemaError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("Range {from}..{to} out of bounds for document of size {size}")]
    OutOfRange { from: usize, to: usize, size: usize },
    #[error("Schema check failed: {0}")]
    Schema(#[from] SchemaError),
    #[error("Invalid step JSON: {0}")]
    Json(String),
}

/// A single document change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "camelCase")]
pub enum Step {
    /// Replace `from..to` with the slice.
    Replace {
        from: usize,
        to: usize,
        #[serde(default)]
        slice: Slice,
    },
    AddMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    RemoveMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
}

impl Step {
    pub fn insert(pos: usize, slice: Slice) -> Self {
        Step::Replace {
            from: pos,
            to: pos,
            slice,
        }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Step::Replace {
            from,
            to,
            slice: Slice::empty(),
        }
    }

    /// Decode a step from JSON and validate its content against the schema.
    pub fn from_json(schema: &Schema, value: &Value) -> Result<Self, StepError> {
        let step: Step =
            serde_json::from_value(value.clone()).map_err(|e| StepError::Json(e.to_string()))?;
        step.validate(schema)?;
        Ok(step)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Check the step's range ordering and its content against the schema.
    pub fn validate(&self, schema: &Schema) -> Result<(), StepError> {
        let (from, to) = self.range();
        if from > to {
            return Err(StepError::OutOfRange { from, to, size: to });
        }
        match self {
            Step::Replace { slice, .. } => slice.check(schema)?,
            Step::AddMark { mark, .. } | Step::RemoveMark { mark, .. } => schema.check_mark(mark)?,
        }
        Ok(())
    }

    pub fn range(&self) -> (usize, usize) {
        match self {
            Step::Replace { from, to, .. }
            | Step::AddMark { from, to, .. }
            | Step::RemoveMark { from, to, .. } => (*from, *to),
        }
    }

    /// Apply to a document. Fails if the range is out of bounds or the
    /// result does not satisfy the schema.
    pub fn apply(&self, doc: &Document, schema: &Schema) -> Result<Document, StepError> {
        let (from, to) = self.range();
        if from > to || to > doc.size() {
            return Err(StepError::OutOfRange {
                from,
                to,
                size: doc.size(),
            });
        }
        let tokens = doc.tokens();
        let result = match self {
            Step::Replace { slice, .. } => {
                let mut out = Vec::with_capacity(tokens.len() - (to - from) + slice.size());
                out.extend_from_slice(&tokens[..from]);
                out.extend_from_slice(slice.tokens());
                out.extend_from_slice(&tokens[to..]);
                out
            }
            Step::AddMark { mark, .. } => {
                schema.check_mark(mark)?;
                map_marks(doc, schema, from, to, |marks| mark.add_to_set(marks))
            }
            Step::RemoveMark { mark, .. } => {
                map_marks(doc, schema, from, to, |marks| mark.remove_from_set(marks))
            }
        };
        Ok(Document::from_tokens(schema, result)?)
    }

    /// The step that undoes this one, given the document it was applied to.
    pub fn invert(&self, doc: &Document) -> Step {
        match self {
            Step::Replace { from, to, slice } => Step::Replace {
                from: *from,
                to: from + slice.size(),
                slice: doc.slice(*from, *to),
            },
            Step::AddMark { from, to, mark } => Step::RemoveMark {
                from: *from,
                to: *to,
                mark: mark.clone(),
            },
            Step::RemoveMark { from, to, mark } => Step::AddMark {
                from: *from,
                to: *to,
                mark: mark.clone(),
            },
        }
    }

    pub fn get_map(&self) -> StepMap {
        match self {
            Step::Replace { from, to, slice } => StepMap::new(&[(*from, to - from, slice.size())]),
            Step::AddMark { .. } | Step::RemoveMark { .. } => StepMap::empty(),
        }
    }

    /// Map the step through a mapping. Returns `None` when the content the
    /// step applied to has been deleted.
    pub fn map(&self, mapping: &impl Mappable) -> Option<Step> {
        let (from, to) = self.range();
        let from = mapping.map_result(from, Assoc::After);
        let to = mapping.map_result(to, Assoc::Before);
        match self {
            Step::Replace { slice, .. } => {
                if from.deleted_across() && to.deleted_across() {
                    return None;
                }
                Some(Step::Replace {
                    from: from.pos,
                    to: from.pos.max(to.pos),
                    slice: slice.clone(),
                })
            }
            Step::AddMark { mark, .. } | Step::RemoveMark { mark, .. } => {
                if (from.deleted() && to.deleted()) || from.pos >= to.pos {
                    return None;
                }
                let mark = mark.clone();
                Some(if matches!(self, Step::AddMark { .. }) {
                    Step::AddMark {
                        from: from.pos,
                        to: to.pos,
                        mark,
                    }
                } else {
                    Step::RemoveMark {
                        from: from.pos,
                        to: to.pos,
                        mark,
                    }
                })
            }
        }
    }

    /// Combine with a step applied directly after this one, if the two
    /// can be expressed as a single step.
    pub fn merge(&self, other: &Step) -> Option<Step> {
        match (self, other) {
            (
                Step::Replace { from, to, slice },
                Step::Replace {
                    from: o_from,
                    to: o_to,
                    slice: o_slice,
                },
            ) => {
                if from + slice.size() == *o_from {
                    Some(Step::Replace {
                        from: *from,
                        to: to + (o_to - o_from),
                        slice: slice.append(o_slice),
                    })
                } else if *o_to == *from {
                    Some(Step::Replace {
                        from: *o_from,
                        to: *to,
                        slice: o_slice.append(slice),
                    })
                } else {
                    None
                }
            }
            (
                Step::AddMark { from, to, mark },
                Step::AddMark {
                    from: o_from,
                    to: o_to,
                    mark: o_mark,
                },
            ) if mark == o_mark && from <= o_to && to >= o_from => Some(Step::AddMark {
                from: *from.min(o_from),
                to: *to.max(o_to),
                mark: mark.clone(),
            }),
            (
                Step::RemoveMark { from, to, mark },
                Step::RemoveMark {
                    from: o_from,
                    to: o_to,
                    mark: o_mark,
                },
            ) if mark == o_mark && from <= o_to && to >= o_from => Some(Step::RemoveMark {
                from: *from.min(o_from),
                to: *to.max(o_to),
                mark: mark.clone(),
            }),
            _ => None,
        }
    }

    /// A replace that both deletes and inserts content.
    pub fn is_compound(&self) -> bool {
        matches!(self, Step::Replace { from, to, slice } if from < to && !slice.is_empty())
    }

    /// Split a compound replace into a deletion followed by an insertion.
    /// Other steps are returned unchanged.
    pub fn split(&self) -> Vec<Step> {
        match self {
            Step::Replace { from, slice, .. } if self.is_compound() => vec![
                Step::delete(*from, self.range().1),
                Step::insert(*from, slice.clone()),
            ],
            _ => vec![self.clone()],
        }
    }
}

fn map_marks(
    doc: &Document,
    schema: &Schema,
    from: usize,
    to: usize,
    f: impl Fn(&[Mark]) -> Vec<Mark>,
) -> Vec<Token> {
    let mut block = None;
    doc.tokens()
        .iter()
        .enumerate()
        .map(|(pos, token)| match token {
            Token::Open(b) => {
                block = Some(*b);
                token.clone()
            }
            Token::Close => {
                block = None;
                token.clone()
            }
            Token::Char(c, marks)
                if pos >= from
                    && pos < to
                    && block.is_some_and(|b| schema.block_allows_marks(&b)) =>
            {
                Token::Char(*c, f(marks))
            }
            Token::Char(..) => token.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Mapping;
    use crate::schema::{BlockType, MarkType};
    use serde_json::json;

    fn doc(text: &str) -> Document {
        Document::from_paragraphs(&[text])
    }

    #[test]
    fn test_replace_apply_and_invert() {
        let schema = Schema::default();
        let before = doc("hello");
        let step = Step::Replace {
            from: 1,
            to: 3,
            slice: Slice::text("J"),
        };
        let after = step.apply(&before, &schema).unwrap();
        assert_eq!(after.text_content(), "Jllo");
        let undone = step.invert(&before).apply(&after, &schema).unwrap();
        assert_eq!(undone, before);
    }

    #[test]
    fn test_apply_rejects_out_of_range_and_invalid_result() {
        let schema = Schema::default();
        let d = doc("ab");
        assert!(matches!(
            Step::delete(1, 10).apply(&d, &schema),
            Err(StepError::OutOfRange { .. })
        ));
        // removing the closing token leaves an unbalanced document
        assert!(matches!(
            Step::delete(3, 4).apply(&d, &schema),
            Err(StepError::Schema(_))
        ));
    }

    #[test]
    fn test_add_mark_skips_code_blocks() {
        let schema = Schema::default();
        let d = Document::from_tokens(
            &schema,
            vec![
                Token::Open(BlockType::Paragraph),
                Token::text('a'),
                Token::Close,
                Token::Open(BlockType::CodeBlock),
                Token::text('b'),
                Token::Close,
            ],
        )
        .unwrap();
        let step = Step::AddMark {
            from: 0,
            to: 6,
            mark: Mark::Strong,
        };
        let after = step.apply(&d, &schema).unwrap();
        assert_eq!(after.tokens()[1].marks(), &[Mark::Strong]);
        assert!(after.tokens()[4].marks().is_empty());
    }

    #[test]
    fn test_mark_not_in_schema_fails() {
        let schema = Schema::with_marks([MarkType::Em]);
        let step = Step::AddMark {
            from: 1,
            to: 2,
            mark: Mark::Strong,
        };
        assert!(step.apply(&doc("ab"), &schema).is_err());
        assert!(Step::from_json(&schema, &step.to_json()).is_err());
    }

    #[test]
    fn test_step_json_shape() {
        let schema = Schema::default();
        let step = Step::Replace {
            from: 3,
            to: 3,
            slice: Slice::text("x"),
        };
        let value = step.to_json();
        assert_eq!(
            value,
            json!({"stepType": "replace", "from": 3, "to": 3, "slice": [{"type": "text", "text": "x"}]})
        );
        assert_eq!(Step::from_json(&schema, &value).unwrap(), step);

        let mark = json!({"stepType": "addMark", "from": 1, "to": 2, "mark": {"type": "em"}});
        assert!(matches!(
            Step::from_json(&schema, &mark).unwrap(),
            Step::AddMark { mark: Mark::Em, .. }
        ));
        assert!(Step::from_json(&schema, &json!({"stepType": "bogus"})).is_err());
    }

    #[test]
    fn test_map_deleted_replace_is_dropped() {
        let step = Step::delete(3, 5);
        let mapping = Mapping::from_maps(vec![StepMap::new(&[(2, 4, 0)])]);
        assert_eq!(step.map(&mapping), None);

        let insert = Step::insert(8, Slice::text("z"));
        assert_eq!(
            insert.map(&mapping),
            Some(Step::insert(4, Slice::text("z")))
        );
    }

    #[test]
    fn test_map_mark_collapsed_is_dropped() {
        let step = Step::AddMark {
            from: 3,
            to: 5,
            mark: Mark::Em,
        };
        let mapping = Mapping::from_maps(vec![StepMap::new(&[(2, 4, 0)])]);
        assert_eq!(step.map(&mapping), None);
    }

    #[test]
    fn test_merge_adjacent_typing() {
        let a = Step::insert(1, Slice::text("a"));
        let b = Step::insert(2, Slice::text("b"));
        assert_eq!(a.merge(&b), Some(Step::insert(1, Slice::text("ab"))));

        let backspace1 = Step::delete(4, 5);
        let backspace2 = Step::delete(3, 4);
        assert_eq!(backspace1.merge(&backspace2), Some(Step::delete(3, 5)));

        assert_eq!(a.merge(&Step::insert(7, Slice::text("c"))), None);
    }

    #[test]
    fn test_split_compound_replace() {
        let schema = Schema::default();
        let step = Step::Replace {
            from: 2,
            to: 4,
            slice: Slice::text("XY"),
        };
        assert!(step.is_compound());
        let parts = step.split();
        assert_eq!(parts.len(), 2);
        let d = doc("hello");
        let mut split_doc = d.clone();
        for part in &parts {
            split_doc = part.apply(&split_doc, &schema).unwrap();
        }
        assert_eq!(split_doc, step.apply(&d, &schema).unwrap());
        assert!(!Step::delete(1, 2).is_compound());
    }
}
