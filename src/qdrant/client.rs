//! HTTP client implementing [`VectorStore`] against Qdrant's REST API.

use crate::qdrant::{
    filters::{build_search_filter, build_stale_filter},
    payload::{build_point, parse_payload},
    types::{CollectionInfoResponse, QueryResponse, stringify_point_id},
};
use crate::vector::{
    IndexedEntry, ScoredEntry, SearchFilter, VectorStore, VectorStoreError, compare_ranked,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};

const PAYLOAD_INDEXES: [(&str, &str); 6] = [
    ("tenant_id", "keyword"),
    ("bucket", "keyword"),
    ("document_id", "keyword"),
    ("tags", "keyword"),
    ("ordinal", "integer"),
    ("indexed_at_ms", "integer"),
];

/// Lightweight HTTP client for Qdrant operations.
pub struct QdrantStore {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
}

impl QdrantStore {
    /// Construct a client for the Qdrant instance at `url`.
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self, VectorStoreError> {
        let client = Client::builder().user_agent("rusty-rag/0.1").build()?;
        let base_url = normalize_base_url(url).map_err(VectorStoreError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = api_key.as_deref().is_some_and(|value| !value.is_empty()),
            "Initialized Qdrant HTTP client"
        );
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    async fn collection_dimension(
        &self,
        collection: &str,
    ) -> Result<Option<Option<usize>>, VectorStoreError> {
        let response = self
            .request(Method::GET, &format!("collections/{collection}"))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let info: CollectionInfoResponse = response.json().await?;
                Ok(Some(info.result.vector_size()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = VectorStoreError::UnexpectedStatus {
                    status: status.as_u16(),
                    body,
                };
                tracing::error!(collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn create_collection(
        &self,
        collection: &str,
        dimension: usize,
    ) -> Result<(), VectorStoreError> {
        let body = json!({
            "vectors": {
                "size": dimension,
                "distance": "Cosine"
            }
        });
        let response = self
            .request(Method::PUT, &format!("collections/{collection}"))
            .json(&body)
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::info!(collection, dimension, "Collection created");
        })
        .await
    }

    async fn ensure_payload_indexes(&self, collection: &str) -> Result<(), VectorStoreError> {
        for (field, schema) in PAYLOAD_INDEXES {
            let body = json!({
                "field_name": field,
                "field_schema": schema,
            });

            let response = self
                .request(Method::PUT, &format!("collections/{collection}/index"))
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() || response.status() == StatusCode::CONFLICT {
                tracing::debug!(collection, field, schema, "Payload index ensured");
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = VectorStoreError::UnexpectedStatus {
                    status: status.as_u16(),
                    body,
                };
                tracing::warn!(collection, field, schema, error = %error, "Failed to ensure payload index");
            }
        }
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), VectorStoreError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = VectorStoreError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            };
            tracing::error!(error = %error, "Qdrant request failed");
            Err(error)
        }
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        dimension: usize,
    ) -> Result<(), VectorStoreError> {
        match self.collection_dimension(collection).await? {
            Some(Some(existing)) if existing != dimension => {
                return Err(VectorStoreError::DimensionMismatch {
                    expected: existing,
                    actual: dimension,
                });
            }
            Some(_) => {}
            None => self.create_collection(collection, dimension).await?,
        }
        self.ensure_payload_indexes(collection).await
    }

    async fn upsert(
        &self,
        collection: &str,
        entries: Vec<IndexedEntry>,
    ) -> Result<usize, VectorStoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let points = entries
            .iter()
            .map(build_point)
            .collect::<Result<Vec<_>, _>>()?;
        let count = points.len();

        let response = self
            .request(Method::PUT, &format!("collections/{collection}/points"))
            .query(&[("wait", true)])
            .json(&json!({ "points": points }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection, points = count, "Points upserted");
        })
        .await?;
        Ok(count)
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredEntry>, VectorStoreError> {
        let mut body = json!({
            "query": vector,
            "limit": limit,
            "with_payload": true,
            "filter": build_search_filter(filter),
        });
        if let (Some(threshold), Value::Object(obj)) = (score_threshold, &mut body) {
            obj.insert("score_threshold".into(), Value::from(threshold));
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection}/points/query"),
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = VectorStoreError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            };
            tracing::error!(collection, error = %error, "Qdrant search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let mut hits = payload
            .result
            .into_points()
            .into_iter()
            .map(|point| {
                let id = stringify_point_id(point.id);
                let payload = parse_payload(&id, point.payload)?;
                Ok(ScoredEntry {
                    id,
                    score: point.score,
                    payload,
                })
            })
            .collect::<Result<Vec<_>, VectorStoreError>>()?;
        // Qdrant orders equal scores arbitrarily.
        hits.sort_by(compare_ranked);
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
        let filter = build_stale_filter(tenant_id, bucket, document_id, keep_below);
        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection}/points/delete"),
            )
            .query(&[("wait", true)])
            .json(&json!({ "filter": filter }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection, bucket, document_id, keep_below, "Stale chunks deleted");
        })
        .await
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}
