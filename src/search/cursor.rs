//! Opaque pagination tokens: URL-safe base64 of `{offset, fingerprint}`.

use super::{SearchError, SortBy};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    #[serde(rename = "o")]
    offset: usize,
    #[serde(rename = "f")]
    fingerprint: String,
}

/// Digest of everything that shapes the ranked list. Page size is excluded.
pub fn query_fingerprint(
    tenant_id: &str,
    query: &str,
    doc_id: Option<&str>,
    tags: &[String],
    sort_by: SortBy,
) -> String {
    let mut tags: Vec<&str> = tags.iter().map(String::as_str).collect();
    tags.sort_unstable();

    let mut hasher = Sha256::new();
    for part in [tenant_id, query, doc_id.unwrap_or(""), sort_by.as_str()] {
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    }
    for tag in tags {
        hasher.update(tag.len().to_le_bytes());
        hasher.update(tag.as_bytes());
    }
    hex::encode(&hasher.finalize()[..12])
}

/// Token resuming at `offset` for the query with `fingerprint`.
pub fn encode_cursor(offset: usize, fingerprint: &str) -> String {
    let payload = CursorPayload {
        offset,
        fingerprint: fingerprint.to_string(),
    };
    let json = serde_json::to_vec(&payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Offset stored in `token`, provided it was issued for `fingerprint`.
pub fn decode_cursor(token: &str, fingerprint: &str) -> Result<usize, SearchError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| SearchError::BadCursor("cursor is not valid base64".into()))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|_| SearchError::BadCursor("cursor payload is malformed".into()))?;
    if payload.fingerprint != fingerprint {
        return Err(SearchError::BadCursor(
            "cursor was issued for a different query".into(),
        ));
    }
    Ok(payload.offset)
}
