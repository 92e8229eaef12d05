//! Document schema: which block types and marks a document may contain.
//!
//! Every document, slice and step is validated against a [`Schema`] before
//! it is accepted. A step whose result fails the schema check fails as a
//! whole, which is what lets the collaboration layer treat "could not apply"
//! uniformly for local, remote and rebased steps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Block-level node types. Blocks are the only children of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockType {
    Paragraph,
    Heading { level: u8 },
    CodeBlock,
}

impl BlockType {
    /// Node type name used in document JSON.
    pub fn name(&self) -> &'static str {
        match self {
            BlockType::Paragraph => "paragraph",
            BlockType::Heading { .. } => "heading",
            BlockType::CodeBlock => "code_block",
        }
    }
}

/// Mark kinds, without attributes. Used for schema membership and for the
/// "one mark of each kind" rule inside a mark set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkType {
    Strong,
    Em,
    Code,
    Strike,
    Link,
}

/// Attributes carried by a link mark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkAttrs {
    pub href: String,
}

/// An inline mark applied to text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mark {
    Strong,
    Em,
    Code,
    Strike,
    Link { attrs: LinkAttrs },
}

impl Mark {
    pub fn link(href: impl Into<String>) -> Self {
        Mark::Link {
            attrs: LinkAttrs { href: href.into() },
        }
    }

    pub fn mark_type(&self) -> MarkType {
        match self {
            Mark::Strong => MarkType::Strong,
            Mark::Em => MarkType::Em,
            Mark::Code => MarkType::Code,
            Mark::Strike => MarkType::Strike,
            Mark::Link { .. } => MarkType::Link,
        }
    }

    /// Add this mark to a set, replacing any mark of the same type.
    /// The set is kept ordered by mark type.
    pub fn add_to_set(&self, set: &[Mark]) -> Vec<Mark> {
        let mut result: Vec<Mark> = set
            .iter()
            .filter(|m| m.mark_type() != self.mark_type())
            .cloned()
            .collect();
        let index = result
            .iter()
            .position(|m| m.mark_type() > self.mark_type())
            .unwrap_or(result.len());
        result.insert(index, self.clone());
        result
    }

    /// Remove exactly this mark from a set.
    pub fn remove_from_set(&self, set: &[Mark]) -> Vec<Mark> {
        set.iter().filter(|m| *m != self).cloned().collect()
    }

    pub fn is_in_set(&self, set: &[Mark]) -> bool {
        set.contains(self)
    }
}

/// Schema violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Document must contain at least one block")]
    EmptyDocument,
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),
    #[error("Mark not allowed by schema: {0:?}")]
    MarkNotAllowed(MarkType),
    #[error("Marks are not allowed inside code blocks (position {0})")]
    MarkInCodeBlock(usize),
    #[error("Code blocks are not allowed by schema")]
    CodeBlockNotAllowed,
    #[error("Heading level {0} outside 1..={1}")]
    HeadingLevel(u8, u8),
    #[error("Block opened inside another block at position {0}")]
    NestedBlock(usize),
    #[error("Text outside of a block at position {0}")]
    TextOutsideBlock(usize),
    #[error("Unbalanced block structure at position {0}")]
    Unbalanced(usize),
    #[error("Invalid document JSON: {0}")]
    InvalidJson(String),
}

/// The set of node and mark types documents may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    marks: BTreeSet<MarkType>,
    max_heading_level: u8,
    code_blocks: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            marks: [
                MarkType::Strong,
                MarkType::Em,
                MarkType::Code,
                MarkType::Strike,
                MarkType::Link,
            ]
            .into_iter()
            .collect(),
            max_heading_level: 6,
            code_blocks: true,
        }
    }
}

impl Schema {
    /// Create a schema that only allows the given marks.
    pub fn with_marks(marks: impl IntoIterator<Item = MarkType>) -> Self {
        Self {
            marks: marks.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn max_heading_level(mut self, level: u8) -> Self {
        self.max_heading_level = level;
        self
    }

    pub fn without_code_blocks(mut self) -> Self {
        self.code_blocks = false;
        self
    }

    pub fn allows_mark(&self, mark_type: MarkType) -> bool {
        self.marks.contains(&mark_type)
    }

    pub fn check_mark(&self, mark: &Mark) -> Result<(), SchemaError> {
        if self.allows_mark(mark.mark_type()) {
            Ok(())
        } else {
            Err(SchemaError::MarkNotAllowed(mark.mark_type()))
        }
    }

    pub fn check_block(&self, block: &BlockType) -> Result<(), SchemaError> {
        match block {
            BlockType::Paragraph => Ok(()),
            BlockType::Heading { level } => {
                if *level >= 1 && *level <= self.max_heading_level {
                    Ok(())
                } else {
                    Err(SchemaError::HeadingLevel(*level, self.max_heading_level))
                }
            }
            BlockType::CodeBlock => {
                if self.code_blocks {
                    Ok(())
                } else {
                    Err(SchemaError::CodeBlockNotAllowed)
                }
            }
        }
    }

    /// Whether text inside the given block may carry marks.
    pub fn block_allows_marks(&self, block: &BlockType) -> bool {
        !matches!(block, BlockType::CodeBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_to_set_replaces_same_type() {
        let set = vec![Mark::Strong, Mark::link("a")];
        let updated = Mark::link("b").add_to_set(&set);
        assert_eq!(updated, vec![Mark::Strong, Mark::link("b")]);
    }

    #[test]
    fn test_add_to_set_keeps_type_order() {
        let set = vec![Mark::Code];
        let updated = Mark::Strong.add_to_set(&set);
        assert_eq!(updated, vec![Mark::Strong, Mark::Code]);
    }

    #[test]
    fn test_remove_from_set_is_exact() {
        let set = vec![Mark::Em, Mark::link("a")];
        assert_eq!(Mark::link("b").remove_from_set(&set), set);
        assert_eq!(Mark::link("a").remove_from_set(&set), vec![Mark::Em]);
    }

    #[test]
    fn test_schema_rejects_disabled_mark() {
        let schema = Schema::with_marks([MarkType::Strong]);
        assert!(schema.check_mark(&Mark::Strong).is_ok());
        assert_eq!(
            schema.check_mark(&Mark::Em),
            Err(SchemaError::MarkNotAllowed(MarkType::Em))
        );
    }

    #[test]
    fn test_heading_level_bounds() {
        let schema = Schema::default().max_heading_level(3);
        assert!(schema.check_block(&BlockType::Heading { level: 3 }).is_ok());
        assert!(schema.check_block(&BlockType::Heading { level: 4 }).is_err());
        assert!(schema.check_block(&BlockType::Heading { level: 0 }).is_err());
    }

    #[test]
    fn test_mark_json_shape() {
        let json = serde_json::to_value(Mark::link("https://example.com")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "link", "attrs": {"href": "https://example.com"}})
        );
        let strong: Mark = serde_json::from_value(serde_json::json!({"type": "strong"})).unwrap();
        assert_eq!(strong, Mark::Strong);
    }
}
