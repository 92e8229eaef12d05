//! Document and slice representation.
//!
//! A document is the tree `doc > block* > text*`, stored as a flat token
//! sequence. Opening and closing a block each take one position, every
//! character takes one position, so positions range over `0..=size` and
//! position `p` is the gap in front of token `p`:
//!
//! ```text
//!   <p> H i </p> <h1> O k </h1>
//!  0   1 2 3    4    5 6 7     8
//! ```

use crate::schema::{BlockType, Mark, Schema, SchemaError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single position-occupying element of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Token {
    Open(BlockType),
    Close,
    Char(char, Vec<Mark>),
}

impl Token {
    pub fn text(c: char) -> Self {
        Token::Char(c, Vec::new())
    }

    /// Equality ignoring marks.
    pub fn same_markup_free(&self, other: &Token) -> bool {
        match (self, other) {
            (Token::Open(a), Token::Open(b)) => a == b,
            (Token::Close, Token::Close) => true,
            (Token::Char(a, _), Token::Char(b, _)) => a == b,
            _ => false,
        }
    }

    pub fn marks(&self) -> &[Mark] {
        match self {
            Token::Char(_, marks) => marks,
            _ => &[],
        }
    }
}

/// An immutable, schema-checked document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Document {
    tokens: Vec<Token>,
}

impl Document {
    /// Build a document from tokens, checking it against the schema.
    pub fn from_tokens(schema: &Schema, tokens: Vec<Token>) -> Result<Self, SchemaError> {
        let doc = Self { tokens };
        doc.check(schema)?;
        Ok(doc)
    }

    /// A document of plain paragraphs.
    pub fn from_paragraphs<S: AsRef<str>>(paragraphs: &[S]) -> Self {
        let mut tokens = Vec::new();
        for text in paragraphs {
            tokens.push(Token::Open(BlockType::Paragraph));
            tokens.extend(text.as_ref().chars().map(Token::text));
            tokens.push(Token::Close);
        }
        if tokens.is_empty() {
            tokens.push(Token::Open(BlockType::Paragraph));
            tokens.push(Token::Close);
        }
        Self { tokens }
    }

    /// The smallest valid document: one empty paragraph.
    pub fn empty() -> Self {
        Self::from_paragraphs::<&str>(&[])
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }

    /// Validate structure and schema rules.
    pub fn check(&self, schema: &Schema) -> Result<(), SchemaError> {
        let mut current: Option<BlockType> = None;
        let mut blocks = 0usize;
        for (pos, token) in self.tokens.iter().enumerate() {
            match token {
                Token::Open(block) => {
                    if current.is_some() {
                        return Err(SchemaError::NestedBlock(pos));
                    }
                    schema.check_block(block)?;
                    current = Some(*block);
                    blocks += 1;
                }
                Token::Close => {
                    if current.take().is_none() {
                        return Err(SchemaError::Unbalanced(pos));
                    }
                }
                Token::Char(_, marks) => {
                    let Some(block) = current else {
                        return Err(SchemaError::TextOutsideBlock(pos));
                    };
                    if !marks.is_empty() && !schema.block_allows_marks(&block) {
                        return Err(SchemaError::MarkInCodeBlock(pos));
                    }
                    for mark in marks {
                        schema.check_mark(mark)?;
                    }
                }
            }
        }
        if current.is_some() {
            return Err(SchemaError::Unbalanced(self.tokens.len()));
        }
        if blocks == 0 {
            return Err(SchemaError::EmptyDocument);
        }
        Ok(())
    }

    /// Cut the tokens between two positions. Out-of-range positions are clamped.
    pub fn slice(&self, from: usize, to: usize) -> Slice {
        let to = to.min(self.size());
        let from = from.min(to);
        Slice::new(self.tokens[from..to].to_vec())
    }

    /// The block type enclosing a position, if the position is inside a block.
    pub fn block_at(&self, pos: usize) -> Option<BlockType> {
        let mut current = None;
        for token in self.tokens.iter().take(pos) {
            match token {
                Token::Open(block) => current = Some(*block),
                Token::Close => current = None,
                Token::Char(..) => {}
            }
        }
        current
    }

    /// All text, blocks separated by newlines.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        let mut first = true;
        for token in &self.tokens {
            match token {
                Token::Open(_) => {
                    if !first {
                        out.push('\n');
                    }
                    first = false;
                }
                Token::Char(c, _) => out.push(*c),
                Token::Close => {}
            }
        }
        out
    }

    /// Text of the first block.
    pub fn first_block_text(&self) -> String {
        self.tokens
            .iter()
            .skip(1)
            .take_while(|t| !matches!(t, Token::Close))
            .filter_map(|t| match t {
                Token::Char(c, _) => Some(*c),
                _ => None,
            })
            .collect()
    }

    /// Parse the tree JSON form, validating it against the schema.
    pub fn from_json(schema: &Schema, value: &Value) -> Result<Self, SchemaError> {
        let root: NodeJson = serde_json::from_value(value.clone())
            .map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        if root.node_type != "doc" {
            return Err(SchemaError::UnknownNodeType(root.node_type));
        }
        let mut tokens = Vec::new();
        for block in root.content.unwrap_or_default() {
            let block_type = match block.node_type.as_str() {
                "paragraph" => BlockType::Paragraph,
                "code_block" => BlockType::CodeBlock,
                "heading" => {
                    let level = block
                        .attrs
                        .as_ref()
                        .and_then(|a| a.get("level"))
                        .and_then(Value::as_u64)
                        .unwrap_or(1);
                    BlockType::Heading {
                        level: u8::try_from(level).unwrap_or(u8::MAX),
                    }
                }
                other => return Err(SchemaError::UnknownNodeType(other.to_string())),
            };
            tokens.push(Token::Open(block_type));
            for inline in block.content.unwrap_or_default() {
                if inline.node_type != "text" {
                    return Err(SchemaError::UnknownNodeType(inline.node_type));
                }
                let marks = normalize_marks(inline.marks.unwrap_or_default());
                let text = inline.text.unwrap_or_default();
                tokens.extend(text.chars().map(|c| Token::Char(c, marks.clone())));
            }
            tokens.push(Token::Close);
        }
        Self::from_tokens(schema, tokens)
    }

    /// Serialize to the tree JSON form. Adjacent characters with equal
    /// marks become one text node.
    pub fn to_json(&self) -> Value {
        let mut blocks = Vec::new();
        let mut current: Option<(BlockType, Vec<NodeJson>)> = None;
        for token in &self.tokens {
            match token {
                Token::Open(block) => current = Some((*block, Vec::new())),
                Token::Close => {
                    if let Some((block, content)) = current.take() {
                        blocks.push(block_json(block, content));
                    }
                }
                Token::Char(c, marks) => {
                    if let Some((_, content)) = current.as_mut() {
                        push_char(content, *c, marks);
                    }
                }
            }
        }
        let root = NodeJson {
            node_type: "doc".into(),
            content: Some(blocks),
            ..NodeJson::default()
        };
        serde_json::to_value(root).unwrap_or(Value::Null)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

fn normalize_marks(marks: Vec<Mark>) -> Vec<Mark> {
    marks.iter().fold(Vec::new(), |set, m| m.add_to_set(&set))
}

fn push_char(content: &mut Vec<NodeJson>, c: char, marks: &[Mark]) {
    let marks_opt = if marks.is_empty() {
        None
    } else {
        Some(marks.to_vec())
    };
    if let Some(last) = content.last_mut() {
        if last.marks == marks_opt {
            if let Some(text) = last.text.as_mut() {
                text.push(c);
                return;
            }
        }
    }
    content.push(NodeJson {
        node_type: "text".into(),
        text: Some(c.to_string()),
        marks: marks_opt,
        ..NodeJson::default()
    });
}

fn block_json(block: BlockType, content: Vec<NodeJson>) -> NodeJson {
    let attrs = match block {
        BlockType::Heading { level } => Some(serde_json::json!({ "level": level })),
        _ => None,
    };
    NodeJson {
        node_type: block.name().into(),
        attrs,
        content: if content.is_empty() { None } else { Some(content) },
        ..NodeJson::default()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeJson {
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attrs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<Vec<NodeJson>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    marks: Option<Vec<Mark>>,
}

// ─── Slice ──────────────────────────────────────────────────────────────────

/// A run of tokens cut out of a document. Slices may open or close blocks
/// without balancing them; the document a slice is inserted into must be
/// valid afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<SliceItem>", into = "Vec<SliceItem>")]
pub struct Slice {
    content: Vec<Token>,
}

impl Slice {
    pub fn new(content: Vec<Token>) -> Self {
        Self { content }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Plain text without marks.
    pub fn text(text: &str) -> Self {
        Self::new(text.chars().map(Token::text).collect())
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.content
    }

    /// Concatenate two slices.
    pub fn append(&self, other: &Slice) -> Slice {
        let mut content = self.content.clone();
        content.extend(other.content.iter().cloned());
        Slice::new(content)
    }

    /// Check block types and marks against the schema.
    pub fn check(&self, schema: &Schema) -> Result<(), SchemaError> {
        for token in &self.content {
            match token {
                Token::Open(block) => schema.check_block(block)?,
                Token::Char(_, marks) => {
                    for mark in marks {
                        schema.check_mark(mark)?;
                    }
                }
                Token::Close => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SliceItem {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        marks: Vec<Mark>,
    },
    Open {
        block: BlockType,
    },
    Close,
}

impl From<Vec<SliceItem>> for Slice {
    fn from(items: Vec<SliceItem>) -> Self {
        let mut content = Vec::new();
        for item in items {
            match item {
                SliceItem::Text { text, marks } => {
                    let marks = normalize_marks(marks);
                    content.extend(text.chars().map(|c| Token::Char(c, marks.clone())));
                }
                SliceItem::Open { block } => content.push(Token::Open(block)),
                SliceItem::Close => content.push(Token::Close),
            }
        }
        Slice::new(content)
    }
}

impl From<Slice> for Vec<SliceItem> {
    fn from(slice: Slice) -> Self {
        let mut items: Vec<SliceItem> = Vec::new();
        for token in slice.content {
            match token {
                Token::Open(block) => items.push(SliceItem::Open { block }),
                Token::Close => items.push(SliceItem::Close),
                Token::Char(c, marks) => {
                    if let Some(SliceItem::Text { text, marks: last }) = items.last_mut() {
                        if *last == marks {
                            text.push(c);
                            continue;
                        }
                    }
                    items.push(SliceItem::Text {
                        text: c.to_string(),
                        marks,
                    });
                }
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_positions_and_size() {
        let doc = Document::from_paragraphs(&["Hi", "Ok"]);
        assert_eq!(doc.size(), 8);
        assert_eq!(doc.slice(1, 3), Slice::text("Hi"));
        assert_eq!(doc.text_content(), "Hi\nOk");
        assert_eq!(doc.first_block_text(), "Hi");
    }

    #[test]
    fn test_check_rejects_structure_errors() {
        let schema = Schema::default();
        assert_eq!(
            Document::from_tokens(&schema, vec![]),
            Err(SchemaError::EmptyDocument)
        );
        assert_eq!(
            Document::from_tokens(&schema, vec![Token::text('a')]),
            Err(SchemaError::TextOutsideBlock(0))
        );
        assert_eq!(
            Document::from_tokens(
                &schema,
                vec![
                    Token::Open(BlockType::Paragraph),
                    Token::Open(BlockType::Paragraph),
                ]
            ),
            Err(SchemaError::NestedBlock(1))
        );
        assert_eq!(
            Document::from_tokens(&schema, vec![Token::Open(BlockType::Paragraph)]),
            Err(SchemaError::Unbalanced(1))
        );
    }

    #[test]
    fn test_check_rejects_marks_in_code_block() {
        let schema = Schema::default();
        let tokens = vec![
            Token::Open(BlockType::CodeBlock),
            Token::Char('x', vec![Mark::Strong]),
            Token::Close,
        ];
        assert_eq!(
            Document::from_tokens(&schema, tokens),
            Err(SchemaError::MarkInCodeBlock(1))
        );
    }

    #[test]
    fn test_json_round_trip_merges_text_runs() {
        let schema = Schema::default();
        let value = json!({
            "type": "doc",
            "content": [
                { "type": "heading", "attrs": { "level": 2 }, "content": [
                    { "type": "text", "text": "Ti" },
                    { "type": "text", "text": "tle" }
                ]},
                { "type": "paragraph", "content": [
                    { "type": "text", "text": "bold", "marks": [{ "type": "strong" }] },
                    { "type": "text", "text": " plain" }
                ]},
                { "type": "paragraph" }
            ]
        });
        let doc = Document::from_json(&schema, &value).unwrap();
        assert_eq!(doc.first_block_text(), "Title");
        let out = doc.to_json();
        assert_eq!(out["content"][0]["content"][0]["text"], "Title");
        assert_eq!(out["content"][0]["attrs"]["level"], 2);
        assert_eq!(out["content"][1]["content"][0]["marks"][0]["type"], "strong");
        assert!(out["content"][2].get("content").is_none());
        assert_eq!(Document::from_json(&schema, &out).unwrap(), doc);
    }

    #[test]
    fn test_from_json_rejects_unknown_nodes() {
        let schema = Schema::default();
        let value = json!({ "type": "doc", "content": [{ "type": "table" }] });
        assert_eq!(
            Document::from_json(&schema, &value),
            Err(SchemaError::UnknownNodeType("table".into()))
        );
    }

    #[test]
    fn test_slice_json_shape() {
        let slice = Slice::new(vec![
            Token::Close,
            Token::Open(BlockType::Paragraph),
            Token::Char('a', vec![Mark::Em]),
            Token::Char('b', vec![Mark::Em]),
        ]);
        let value = serde_json::to_value(&slice).unwrap();
        assert_eq!(
            value,
            json!([
                { "type": "close" },
                { "type": "open", "block": { "type": "paragraph" } },
                { "type": "text", "text": "ab", "marks": [{ "type": "em" }] }
            ])
        );
        let back: Slice = serde_json::from_value(value).unwrap();
        assert_eq!(back, slice);
    }
}
