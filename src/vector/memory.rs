//! In-process vector store using brute-force cosine similarity.

use super::{
    IndexedEntry, ScoredEntry, SearchFilter, VectorStore, VectorStoreError, compare_ranked,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Default)]
struct Collection {
    dimension: usize,
    entries: HashMap<String, IndexedEntry>,
}

/// Vector store held entirely in memory.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in `collection` belonging to `document_id`.
    pub fn document_entry_count(&self, collection: &str, document_id: &str) -> usize {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections.get(collection).map_or(0, |collection| {
            collection
                .entries
                .values()
                .filter(|entry| entry.payload.document_id == document_id)
                .count()
        })
    }

    /// Total entries in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections
            .get(collection)
            .map_or(0, |collection| collection.entries.len())
    }

    /// Whether `collection` holds no entries.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        dimension: usize,
    ) -> Result<(), VectorStoreError> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let existing = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                dimension,
                entries: HashMap::new(),
            });
        if existing.dimension != dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: existing.dimension,
                actual: dimension,
            });
        }
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        entries: Vec<IndexedEntry>,
    ) -> Result<usize, VectorStoreError> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| VectorStoreError::UnknownCollection(collection.to_string()))?;

        // Validate the whole batch before writing any of it.
        if let Some(bad) = entries
            .iter()
            .find(|entry| entry.vector.len() != target.dimension)
        {
            return Err(VectorStoreError::DimensionMismatch {
                expected: target.dimension,
                actual: bad.vector.len(),
            });
        }

        let written = entries.len();
        for entry in entries {
            target.entries.insert(entry.chunk_id.clone(), entry);
        }
        Ok(written)
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredEntry>, VectorStoreError> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get(collection)
            .ok_or_else(|| VectorStoreError::UnknownCollection(collection.to_string()))?;
        if vector.len() != target.dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: target.dimension,
                actual: vector.len(),
            });
        }

        let mut hits: Vec<ScoredEntry> = target
            .entries
            .values()
            .filter(|entry| filter.matches(&entry.payload))
            .map(|entry| ScoredEntry {
                id: entry.chunk_id.clone(),
                score: cosine(vector, &entry.vector),
                payload: entry.payload.clone(),
            })
            .filter(|hit| score_threshold.is_none_or(|threshold| hit.score >= threshold))
            .collect();
        hits.sort_by(compare_ranked);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_stale(
        &self,
        collection: &str,
        tenant_id: &str,
        bucket: &str,
        document_id: &str,
        keep_below: usize,
    ) -> Result<(), VectorStoreError> {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(target) = collections.get_mut(collection) {
            target.entries.retain(|_, entry| {
                !(entry.payload.tenant_id == tenant_id
                    && entry.payload.bucket == bucket
                    && entry.payload.document_id == document_id
                    && entry.payload.ordinal >= keep_below)
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::entry;
    use super::*;

    fn acme() -> SearchFilter {
        SearchFilter {
            tenant_id: "acme".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_chunk_id() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs", 2).await.expect("collection");

        store
            .upsert("docs", vec![entry("doc-a", 0, vec![1.0, 0.0])])
            .await
            .expect("first upsert");
        store
            .upsert("docs", vec![entry("doc-a", 0, vec![0.0, 1.0])])
            .await
            .expect("second upsert");

        assert_eq!(store.document_entry_count("docs", "doc-a"), 1);
        let hits = store
            .search("docs", &[0.0, 1.0], 10, &acme(), None)
            .await
            .expect("search");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn rejects_vectors_of_the_wrong_dimension() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs", 3).await.expect("collection");

        let result = store
            .upsert(
                "docs",
                vec![
                    entry("doc-a", 0, vec![1.0, 0.0, 0.0]),
                    entry("doc-a", 1, vec![1.0, 0.0]),
                ],
            )
            .await;
        assert!(matches!(
            result,
            Err(VectorStoreError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(store.is_empty("docs"));
        assert!(store.ensure_collection("docs", 4).await.is_err());
    }

    #[tokio::test]
    async fn search_ranks_filters_and_truncates() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs", 2).await.expect("collection");
        let mut other_tenant = entry("doc-z", 0, vec![1.0, 0.0]);
        other_tenant.payload.tenant_id = "globex".into();
        store
            .upsert(
                "docs",
                vec![
                    entry("doc-b", 0, vec![1.0, 0.0]),
                    entry("doc-a", 0, vec![1.0, 0.0]),
                    entry("doc-a", 1, vec![0.0, 1.0]),
                    other_tenant,
                ],
            )
            .await
            .expect("upsert");

        let hits = store
            .search("docs", &[1.0, 0.0], 2, &acme(), None)
            .await
            .expect("search");
        let ids: Vec<_> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-a:0", "doc-b:0"]);

        let thresholded = store
            .search("docs", &[1.0, 0.0], 10, &acme(), Some(0.5))
            .await
            .expect("search");
        assert_eq!(thresholded.len(), 2);
    }

    #[tokio::test]
    async fn delete_stale_keeps_lower_ordinals() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs", 1).await.expect("collection");
        store
            .upsert(
                "docs",
                (0..4).map(|ordinal| entry("doc-a", ordinal, vec![1.0])).collect(),
            )
            .await
            .expect("upsert");

        store
            .delete_stale("docs", "acme", "raw", "doc-a", 2)
            .await
            .expect("delete");
        assert_eq!(store.document_entry_count("docs", "doc-a"), 2);
    }

    #[tokio::test]
    async fn delete_stale_leaves_same_document_id_in_other_buckets() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs", 1).await.expect("collection");
        let archived = (0..3).map(|ordinal| {
            let mut entry = entry("doc-a", ordinal, vec![1.0]);
            entry.chunk_id = format!("archive:{ordinal}");
            entry.payload.bucket = "archive".into();
            entry
        });
        store
            .upsert(
                "docs",
                (0..3)
                    .map(|ordinal| entry("doc-a", ordinal, vec![1.0]))
                    .chain(archived)
                    .collect(),
            )
            .await
            .expect("upsert");

        store
            .delete_stale("docs", "acme", "raw", "doc-a", 0)
            .await
            .expect("delete");
        assert_eq!(store.document_entry_count("docs", "doc-a"), 3);
    }
}
