//! Pure document transforms: decoding, cleanup, chunking, and label sanitation.

pub mod chunking;
pub mod normalize;
pub mod sanitize;

pub use chunking::{Chunk, ChunkingError, ChunkingSettings, chunk_text};
pub use normalize::{DocumentKind, NormalizeError, NormalizedDocument, detect_kind, normalize};

use sha2::{Digest, Sha256};

/// Deterministic SHA-256 hex digest of raw document bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_hex() {
        let first = content_hash(b"Hello world");
        assert_eq!(first, content_hash(b"Hello world"));
        assert_eq!(first.len(), 64);
        assert_ne!(first, content_hash(b"Hello world!"));
    }
}
