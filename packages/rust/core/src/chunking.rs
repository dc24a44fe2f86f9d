//! Input normalization and the default paragraph-boundary chunk preparer.
//!
//! Paragraphs (separated by blank lines) are accumulated into a chunk until
//! the next one would exceed `max_chars`. A paragraph longer than `max_chars`
//! is hard-split at the last newline or space before the limit. At least one
//! chunk is always returned and indices are contiguous from 0.

use serde_json::Value;

use kbforge_shared::{Chunk, Result};

use crate::agents::ChunkPreparer;

/// Render structured JSON input as plain paragraphs.
///
/// - a JSON array becomes one paragraph per element
/// - an object with a `messages` array becomes `author: text` paragraphs
/// - anything else is returned unchanged
pub fn normalize_input(raw: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };

    match value {
        Value::Array(items) => join_paragraphs(items.iter().map(render_item)),
        Value::Object(ref map) => match map.get("messages") {
            Some(Value::Array(messages)) => join_paragraphs(messages.iter().map(render_message)),
            _ => raw.to_string(),
        },
        _ => raw.to_string(),
    }
}

fn join_paragraphs(items: impl Iterator<Item = String>) -> String {
    items
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_item(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_message(message: &Value) -> String {
    let author = ["author", "user", "from"]
        .iter()
        .find_map(|key| message.get(*key).and_then(Value::as_str));
    let text = ["text", "body", "content"]
        .iter()
        .find_map(|key| message.get(*key).and_then(Value::as_str));

    match (author, text) {
        (Some(author), Some(text)) => format!("{author}: {text}"),
        (None, Some(text)) => text.to_string(),
        _ => render_item(message),
    }
}

/// Default [`ChunkPreparer`].
#[derive(Debug, Clone)]
pub struct ParagraphChunker {
    max_chars: usize,
}

impl ParagraphChunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }
}

impl ChunkPreparer for ParagraphChunker {
    fn prepare(&self, content: &str) -> Result<Vec<Chunk>> {
        Ok(chunk_paragraphs(content, self.max_chars)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                text,
                origin: None,
                index,
            })
            .collect())
    }
}

fn chunk_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    let mut buf = String::new();
    // Length of `buf` in chars; the budget is never measured in bytes.
    let mut buf_chars = 0;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_chars = para.chars().count();
        let would_be = if buf.is_empty() {
            para_chars
        } else {
            buf_chars + 2 + para_chars
        };
        if would_be > max_chars && !buf.is_empty() {
            chunks.push(std::mem::take(&mut buf));
            buf_chars = 0;
        }

        if para_chars > max_chars {
            chunks.extend(hard_split(para, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
            buf_chars += 2;
        }
        buf.push_str(para);
        buf_chars += para_chars;
    }

    if !buf.is_empty() {
        chunks.push(buf);
    }
    if chunks.is_empty() {
        chunks.push(text.trim().to_string());
    }
    chunks
}

/// Split at the last newline or space within `max_chars` chars, or exactly at
/// the limit when there is none.
fn hard_split(mut remaining: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    while !remaining.is_empty() {
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let split_at = if limit == remaining.len() {
            limit
        } else {
            remaining[..limit]
                .rfind(['\n', ' '])
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        };

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
    pieces
}
