//! Knowledge unit file format: a `key: value` header block, then the body.
//!
//! Rendered files are fenced with `---` lines. Parsing also accepts an
//! unfenced header that ends at the first blank line. Quoted values support
//! `\"`, `\\` and `\n` escapes; lists use `["a", "b"]`. Unknown keys are ignored.

use std::collections::HashMap;

use kbforge_shared::{KbError, KnowledgeUnit, Result, UnitId, UnitKind};

const FENCE: &str = "---";

/// A file split into raw header values and body text.
#[derive(Debug, Clone, Default)]
pub struct UnitFile {
    fields: HashMap<String, String>,
    pub body: String,
}

impl UnitFile {
    /// Split `content` into header fields and body.
    pub fn parse(content: &str) -> Self {
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        let lines: Vec<&str> = content.lines().collect();

        let (header_lines, body_start) = match lines.first() {
            Some(first) if first.trim() == FENCE => {
                let close = lines[1..]
                    .iter()
                    .position(|l| l.trim() == FENCE)
                    .map(|p| p + 1);
                match close {
                    Some(end) => (&lines[1..end], end + 1),
                    None => (&lines[1..], lines.len()),
                }
            }
            _ => {
                let end = lines
                    .iter()
                    .position(|l| l.trim().is_empty())
                    .unwrap_or(lines.len());
                (&lines[..end], end)
            }
        };

        let fields = header_lines
            .iter()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect();

        let body = lines
            .get(body_start..)
            .map(|rest| rest.join("\n"))
            .unwrap_or_default()
            .trim()
            .to_string();

        Self { fields, body }
    }

    /// Raw, unparsed header value.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Scalar header value with quotes and escapes removed. Empty values are `None`.
    pub fn scalar(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(parse_scalar)
            .filter(|v| !v.is_empty())
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.raw(key).map(parse_list).unwrap_or_default()
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.scalar(key)?.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// Build a unit named `id`. The filename is authoritative for the id.
    pub fn into_unit(self, id: UnitId) -> Result<KnowledgeUnit> {
        let source = self
            .scalar("source")
            .ok_or_else(|| KbError::parse(format!("{id}: header has no 'source' field")))?;

        let answered_by = self
            .list("answered_by")
            .iter()
            .filter_map(|raw| raw.parse::<UnitId>().ok())
            .collect();

        Ok(KnowledgeUnit {
            id,
            author: self.scalar("author").unwrap_or_default(),
            area: self.scalar("area"),
            topics: self.list("topics").into_iter().collect(),
            date: self.scalar("date"),
            answered: id.kind == UnitKind::Question && self.flag("answered").unwrap_or(false),
            answered_by,
            source,
            text: self.body,
        })
    }
}

/// Render a unit as header + blank line + body.
pub fn render_unit(unit: &KnowledgeUnit) -> String {
    let mut out = String::from("---\n");
    out.push_str(&format!("id: {}\n", unit.id));
    out.push_str(&format!("source: {}\n", quote(&unit.source)));
    out.push_str(&format!("author: {}\n", quote(&unit.author)));
    if let Some(area) = &unit.area {
        out.push_str(&format!("area: {}\n", quote(area)));
    }
    out.push_str(&format!("topics: {}\n", render_list(unit.topics.iter())));
    if let Some(date) = &unit.date {
        out.push_str(&format!("date: {}\n", quote(date)));
    }
    if unit.kind() == UnitKind::Question {
        out.push_str(&format!("answered: {}\n", unit.answered));
        let ids: Vec<String> = unit.answered_by.iter().map(UnitId::to_string).collect();
        out.push_str(&format!("answered_by: {}\n", render_list(ids.iter())));
    }
    out.push_str("---\n\n");
    out.push_str(unit.text.trim());
    out.push('\n');
    out
}

fn render_list<'a>(items: impl Iterator<Item = &'a String>) -> String {
    let quoted: Vec<String> = items.map(|s| quote(s)).collect();
    format!("[{}]", quoted.join(", "))
}

fn quote(s: &str) -> String {
    let escaped = s
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{escaped}\"")
}

fn parse_scalar(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        unescape(&raw[1..raw.len() - 1])
    } else {
        raw.to_string()
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parse `[a, "b, c"]`. A bare non-empty scalar is a one-element list.
fn parse_list(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) else {
        let single = parse_scalar(raw);
        return if single.is_empty() { Vec::new() } else { vec![single] };
    };

    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in inner.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                items.push(parse_scalar(&current));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    items.push(parse_scalar(&current));

    items.into_iter().filter(|s| !s.is_empty()).collect()
}
