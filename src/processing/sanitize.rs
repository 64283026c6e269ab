//! Helpers for normalizing caller-supplied identifiers and labels.

use std::collections::HashSet;

/// Trim an identifier, returning `None` when nothing is left.
pub fn sanitize_identifier(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalize and dedupe tag values, dropping empties. First occurrence order is kept.
pub fn sanitize_tags<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut unique = HashSet::new();
    let mut sanitized = Vec::new();

    for tag in values {
        let trimmed = tag.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_lowercase();
        if unique.insert(lower.clone()) {
            sanitized.push(lower);
        }
    }

    sanitized
}

/// Split a comma-separated tag list, as sent in query strings.
pub fn parse_tag_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| sanitize_tags(value.split(',')))
        .unwrap_or_default()
}
