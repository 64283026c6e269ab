//! Decoding and cleanup of raw document bytes.
//!
//! Plain text and delimited tables are the two understood kinds. Anything else is decoded as
//! best-effort text and rejected only when the result is mostly non-text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_NON_TEXT_RATIO: f64 = 0.10;

/// Document kind inferred from metadata and key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Plain text or markdown.
    Text,
    /// Delimited rows with a header line.
    Delimited {
        /// Field separator.
        delimiter: char,
    },
    /// Unrecognised; decoded as text.
    Unknown,
}

impl DocumentKind {
    /// Short tag describing the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Delimited { delimiter: '\t' } => "tsv",
            Self::Delimited { .. } => "csv",
            Self::Unknown => "unknown",
        }
    }
}

/// Cleaned text ready for chunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDocument {
    /// Normalized text.
    pub text: String,
    /// Kind used for decoding.
    pub kind: DocumentKind,
}

/// Reasons a document cannot be normalized. Both are permanent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// Content is not text even after fallback decoding.
    #[error("unsupported content: {0}")]
    Unsupported(String),
    /// Content decoded but is empty or structurally broken.
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Infer the kind from a `content-type` value, falling back to the key's extension.
pub fn detect_kind(content_type: Option<&str>, key: &str) -> DocumentKind {
    let mime = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.as_str() {
        "text/csv" | "application/csv" => return DocumentKind::Delimited { delimiter: ',' },
        "text/tab-separated-values" => return DocumentKind::Delimited { delimiter: '\t' },
        value if value.starts_with("text/") => return DocumentKind::Text,
        _ => {}
    }

    let extension = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" | "md" | "markdown" | "text" => DocumentKind::Text,
        "csv" => DocumentKind::Delimited { delimiter: ',' },
        "tsv" | "tab" => DocumentKind::Delimited { delimiter: '\t' },
        _ => DocumentKind::Unknown,
    }
}

/// Decode and clean `bytes` according to `kind`.
pub fn normalize(bytes: &[u8], kind: DocumentKind) -> Result<NormalizedDocument, NormalizeError> {
    let decoded = decode(bytes);
    reject_non_text(&decoded)?;
    let cleaned = clean(&decoded);

    let text = match kind {
        DocumentKind::Delimited { delimiter } => render_rows(&cleaned, delimiter)?,
        DocumentKind::Text | DocumentKind::Unknown => dehyphenate(&cleaned),
    };

    if text.trim().is_empty() {
        return Err(NormalizeError::Malformed("document has no text".into()));
    }
    Ok(NormalizedDocument { text, kind })
}

fn decode(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF])
        && let Ok(text) = std::str::from_utf8(rest)
    {
        return text.to_string();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        // Latin-1 maps every byte onto the first 256 code points.
        Err(_) => bytes.iter().map(|&byte| char::from(byte)).collect(),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|result| result.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

fn is_non_text(c: char) -> bool {
    (c.is_control() && !matches!(c, '\n' | '\r' | '\t')) || c == char::REPLACEMENT_CHARACTER
}

fn reject_non_text(decoded: &str) -> Result<(), NormalizeError> {
    let total = decoded.chars().count();
    if total == 0 {
        return Ok(());
    }
    let suspicious = decoded.chars().filter(|&c| is_non_text(c)).count();
    if suspicious as f64 / total as f64 > MAX_NON_TEXT_RATIO {
        return Err(NormalizeError::Unsupported(format!(
            "{suspicious} of {total} characters are not text"
        )));
    }
    Ok(())
}

/// Unify line endings, drop control characters, and turn non-breaking spaces into spaces.
fn clean(decoded: &str) -> String {
    let unified = decoded.replace("\r\n", "\n").replace('\r', "\n");
    unified
        .chars()
        .filter(|&c| !is_non_text(c))
        .map(|c| if c == '\u{00A0}' { ' ' } else { c })
        .collect()
}

/// Join words wrapped as `exam-\nple` into `exam-ple`.
fn dehyphenate(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        let after_word = out
            .chars()
            .rev()
            .nth(1)
            .is_some_and(char::is_alphanumeric);
        if c == '-' && after_word && chars.peek() == Some(&'\n') {
            chars.next();
            while chars.next_if(|next| *next == ' ' || *next == '\t').is_some() {}
        }
    }
    out
}

fn parse_records(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, NormalizeError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                other => field.push(other),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => quoted = true,
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            other => field.push(other),
        }
    }
    if quoted {
        return Err(NormalizeError::Malformed("unterminated quoted field".into()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records.retain(|row| row.iter().any(|value| !value.trim().is_empty()));
    Ok(records)
}

/// Render each data row as `header: value; header: value`.
fn render_rows(text: &str, delimiter: char) -> Result<String, NormalizeError> {
    let mut records = parse_records(text, delimiter)?.into_iter();
    let Some(header) = records.next() else {
        return Err(NormalizeError::Malformed("table has no header".into()));
    };
    let header: Vec<String> = header
        .into_iter()
        .map(|name| name.trim().to_string())
        .collect();

    let lines: Vec<String> = records
        .map(|row| {
            row.iter()
                .enumerate()
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(idx, value)| {
                    let name = header
                        .get(idx)
                        .filter(|name| !name.is_empty())
                        .cloned()
                        .unwrap_or_else(|| format!("column_{}", idx + 1));
                    format!("{name}: {}", value.trim())
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
        .collect();

    if lines.is_empty() {
        return Err(NormalizeError::Malformed("table has no data rows".into()));
    }
    Ok(lines.join("\n"))
}
