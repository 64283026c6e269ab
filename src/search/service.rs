use super::{
    SearchError, SearchHit, SearchQuery, SearchResultPage, SearchSettings, SortBy,
    decode_cursor, encode_cursor, query_fingerprint,
};
use crate::embedding::EmbeddingClient;
use crate::gateway::Gateways;
use crate::metrics::PipelineMetrics;
use crate::processing::sanitize::{sanitize_identifier, sanitize_tags};
use crate::vector::{ScoredEntry, SearchFilter, VectorStore, compare_ranked, compare_tie_break};
use std::sync::Arc;

/// Executes search queries against the active collection.
#[derive(Clone)]
pub struct SearchService {
    embedder: Arc<dyn EmbeddingClient>,
    vector_store: Arc<dyn VectorStore>,
    gateways: Gateways,
    settings: SearchSettings,
    metrics: Arc<PipelineMetrics>,
}

impl SearchService {
    /// Create a service querying `vector_store` through the shared gateways.
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        vector_store: Arc<dyn VectorStore>,
        gateways: Gateways,
        settings: SearchSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            embedder,
            vector_store,
            gateways,
            settings,
            metrics,
        }
    }

    /// Active search parameters.
    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Run `query` and return the page selected by its cursor.
    ///
    /// Candidates are fetched from rank 0 on every page and sorted with a total order, so the
    /// same query and cursor always yield the same page. Relevance fetches grow until the
    /// scores straddling the page end are complete; a store may cut equal scores at its limit
    /// in any order.
    pub async fn search(&self, query: SearchQuery) -> Result<SearchResultPage, SearchError> {
        let tenant_id = sanitize_identifier(&query.tenant_id)
            .ok_or_else(|| SearchError::InvalidRequest("tenant_id is required".into()))?;
        let text = query.query.trim();
        if text.is_empty() {
            return Err(SearchError::InvalidRequest("query must not be empty".into()));
        }
        if query.top_k == 0 || query.top_k > self.settings.max_top_k {
            return Err(SearchError::InvalidRequest(format!(
                "top_k must be between 1 and {}",
                self.settings.max_top_k
            )));
        }
        let doc_id = match query.doc_id.as_deref() {
            Some(raw) => Some(sanitize_identifier(raw).ok_or_else(|| {
                SearchError::InvalidRequest("doc_id must not be blank".into())
            })?),
            None => None,
        };
        let tags = sanitize_tags(&query.tags);

        let fingerprint =
            query_fingerprint(&tenant_id, text, doc_id.as_deref(), &tags, query.sort_by);
        let offset = match query.cursor.as_deref().filter(|token| !token.trim().is_empty()) {
            Some(token) => decode_cursor(token, &fingerprint)?,
            None => 0,
        };
        let window = self.settings.max_window;
        if offset >= window {
            return Ok(SearchResultPage {
                results: Vec::new(),
                next_cursor: None,
            });
        }

        let vector = self.embed_query(text).await?;
        let filter = SearchFilter {
            tenant_id,
            document_id: doc_id,
            tags,
        };

        let end = (offset + query.top_k).min(window);
        let mut candidates = match query.sort_by {
            SortBy::Relevance => {
                let limit = (end + 1 + query.top_k).min(window);
                self.fetch_ranked(&vector, &filter, limit, end).await?
            }
            // Recency re-orders the candidate set, so it must be the same on every page.
            SortBy::Recency => self.fetch(&vector, &filter, window).await?,
        };
        sort_candidates(&mut candidates, query.sort_by);
        let collection = self.settings.collection.as_str();

        let next_cursor =
            (candidates.len() > end && end < window).then(|| encode_cursor(end, &fingerprint));
        let results: Vec<SearchHit> = candidates
            .into_iter()
            .skip(offset)
            .take(end - offset)
            .map(into_hit)
            .collect();

        self.metrics.record_search();
        tracing::debug!(
            collection,
            tenant_id = %filter.tenant_id,
            offset,
            hits = results.len(),
            sort_by = query.sort_by.as_str(),
            has_more = next_cursor.is_some(),
            "Search served"
        );
        Ok(SearchResultPage {
            results,
            next_cursor,
        })
    }

    async fn fetch(
        &self,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, SearchError> {
        let store = &self.vector_store;
        let collection = self.settings.collection.as_str();
        let threshold = self.settings.score_threshold;
        let candidates = self
            .gateways
            .vector_store
            .call("search", || {
                store.search(collection, vector, limit, filter, threshold)
            })
            .await?;
        Ok(candidates)
    }

    /// Fetch relevance candidates until every entry ranked up to `end` is known. Doubles the
    /// limit while the last fetched score still ties the entry at `end`.
    async fn fetch_ranked(
        &self,
        vector: &[f32],
        filter: &SearchFilter,
        mut limit: usize,
        end: usize,
    ) -> Result<Vec<ScoredEntry>, SearchError> {
        let window = self.settings.max_window;
        loop {
            let mut candidates = self.fetch(vector, filter, limit).await?;
            candidates.sort_by(compare_ranked);
            if candidates.len() < limit || limit >= window || boundary_settled(&candidates, end) {
                return Ok(candidates);
            }
            tracing::debug!(limit, end, "Equal scores reach the fetch limit; widening");
            limit = limit.saturating_mul(2).min(window);
        }
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let embedder = &self.embedder;
        let mut vectors = self
            .gateways
            .embedding
            .call("embed_query", || embedder.embed(vec![text.to_string()]))
            .await?;
        let vector = vectors
            .pop()
            .filter(|_| vectors.is_empty())
            .ok_or_else(|| SearchError::Upstream("embedding provider returned no vector".into()))?;
        if vector.len() != self.settings.dimension {
            return Err(SearchError::DimensionMismatch(format!(
                "query vector has {} dimensions but collection `{}` expects {}",
                vector.len(),
                self.settings.collection,
                self.settings.dimension
            )));
        }
        Ok(vector)
    }
}

/// Whether the entries through rank `end` are fixed: the last fetched score is strictly below
/// the score at `end`, so no unfetched entry can tie with it.
fn boundary_settled(ranked: &[ScoredEntry], end: usize) -> bool {
    match (ranked.get(end), ranked.last()) {
        (Some(cut), Some(last)) => last.score < cut.score,
        _ => true,
    }
}

fn sort_candidates(candidates: &mut [ScoredEntry], sort_by: SortBy) {
    match sort_by {
        SortBy::Relevance => candidates.sort_by(compare_ranked),
        SortBy::Recency => candidates.sort_by(|a, b| {
            b.payload
                .indexed_at_ms
                .cmp(&a.payload.indexed_at_ms)
                .then_with(|| compare_tie_break(&a.payload, &b.payload))
        }),
    }
}

fn into_hit(entry: ScoredEntry) -> SearchHit {
    SearchHit {
        score: entry.score,
        text: entry.payload.text,
        document_id: entry.payload.document_id,
        ordinal: entry.payload.ordinal,
        tags: entry.payload.tags,
        chunk_id: entry.id,
        source_id: entry.payload.source_id,
    }
}
