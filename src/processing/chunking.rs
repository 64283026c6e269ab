//! Byte-bounded chunking of normalized text.
//!
//! Chunks are exact slices of the input: `text[chunk.start..chunk.end] == chunk.text`. Together
//! they cover every byte, and two neighbours share at most `overlap_bytes` bytes. Boundaries
//! prefer, in order, a paragraph break, a sentence end or line break, and whitespace; a word is
//! only split when a window contains none of these.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chunk size bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingSettings {
    /// Upper bound on a chunk's length in bytes.
    pub max_bytes: usize,
    /// Bytes repeated at the start of a chunk from the end of its predecessor. Clamped to half
    /// of `max_bytes`.
    pub overlap_bytes: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_bytes: 1200,
            overlap_bytes: 120,
        }
    }
}

/// Contiguous slice of a document's normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position within the document, starting at zero.
    pub ordinal: usize,
    /// Byte offset of the first byte.
    pub start: usize,
    /// Byte offset one past the last byte.
    pub end: usize,
    /// The slice itself.
    pub text: String,
}

/// Errors produced while chunking.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkingError {
    /// `max_bytes` was zero.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
}

/// Split `text` into ordinal-indexed chunks. Empty input yields no chunks.
pub fn chunk_text(text: &str, settings: ChunkingSettings) -> Result<Vec<Chunk>, ChunkingError> {
    if settings.max_bytes == 0 {
        return Err(ChunkingError::InvalidChunkSize);
    }
    let overlap = settings.overlap_bytes.min(settings.max_bytes / 2);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let end = if text.len() - start <= settings.max_bytes {
            text.len()
        } else {
            let mut limit = floor_boundary(text, start + settings.max_bytes);
            if limit <= start {
                // A single character wider than the budget.
                limit = ceil_boundary(text, start + 1);
            }
            let window = &text[start..limit];
            start + break_point(window, window.len() / 2)
        };

        chunks.push(Chunk {
            ordinal: chunks.len(),
            start,
            end,
            text: text[start..end].to_string(),
        });
        if end == text.len() {
            break;
        }

        let next = ceil_boundary(text, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }

    Ok(chunks)
}

/// Length of the preferred prefix of `window`, never shorter than `min_len` unless no break
/// exists at all.
fn break_point(window: &str, min_len: usize) -> usize {
    let min_len = min_len.max(1);
    window
        .rfind("\n\n")
        .map(|pos| pos + 2)
        .filter(|&end| end >= min_len)
        .or_else(|| last_sentence_end(window).filter(|&end| end >= min_len))
        .or_else(|| {
            window
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .map(|(idx, c)| idx + c.len_utf8())
                .filter(|&end| end >= min_len)
        })
        .unwrap_or(window.len())
}

fn last_sentence_end(window: &str) -> Option<usize> {
    let mut following: Option<(usize, char)> = None;
    for (idx, c) in window.char_indices().rev() {
        if c == '\n' {
            return Some(idx + 1);
        }
        if let Some((next_idx, next)) = following
            && matches!(c, '.' | '!' | '?')
            && next.is_whitespace()
        {
            return Some(next_idx + next.len_utf8());
        }
        following = Some((idx, c));
    }
    None
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
