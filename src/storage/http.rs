//! S3-compatible object store reached over path-style HTTP (`{base}/{bucket}/{key}`).

use super::{ObjectMetadata, ObjectStore, ObjectStoreError, StorageRef};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};

/// HTTP object store client.
pub struct HttpObjectStore {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) token: Option<String>,
}

impl HttpObjectStore {
    /// Build a client for `base_url`, optionally authenticating with a bearer token.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ObjectStoreError> {
        let parsed =
            reqwest::Url::parse(base_url).map_err(|err| ObjectStoreError::InvalidUrl(err.to_string()))?;
        let client = Client::builder().user_agent("rusty-rag/0.1").build()?;
        let base_url = parsed.as_str().trim_end_matches('/').to_string();
        tracing::debug!(url = %base_url, has_token = token.is_some(), "Initialized object store client");
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn request(&self, method: Method, location: &StorageRef) -> RequestBuilder {
        let key = location.key.trim_start_matches('/');
        let url = format!("{}/{}/{}", self.base_url, location.bucket, key);
        let mut req = self.client.request(method, url);
        if let Some(token) = self.token.as_deref().filter(|token| !token.is_empty()) {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn checked(
        &self,
        response: Response,
        location: &StorageRef,
    ) -> Result<Response, ObjectStoreError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ObjectStoreError::Missing(location.clone())),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = ObjectStoreError::UnexpectedStatus {
                    status: status.as_u16(),
                    body,
                };
                tracing::error!(object = %location, error = %error, "Object store request failed");
                Err(error)
            }
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn exists(&self, location: &StorageRef) -> Result<bool, ObjectStoreError> {
        let response = self.request(Method::HEAD, location).send().await?;
        match self.checked(response, location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::Missing(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn metadata(&self, location: &StorageRef) -> Result<ObjectMetadata, ObjectStoreError> {
        let response = self.request(Method::HEAD, location).send().await?;
        let response = self.checked(response, location).await?;
        let metadata = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some((name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        Ok(metadata)
    }

    async fn bytes(&self, location: &StorageRef) -> Result<Vec<u8>, ObjectStoreError> {
        let response = self.request(Method::GET, location).send().await?;
        let response = self.checked(response, location).await?;
        let bytes = response.bytes().await?;
        tracing::debug!(object = %location, bytes = bytes.len(), "Fetched object");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, Method::HEAD, MockServer};

    #[tokio::test]
    async fn fetches_bytes_and_metadata() {
        let server = MockServer::start_async().await;
        let get = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/uploads/docs/doc-1")
                    .header("authorization", "Bearer secret");
                then.status(200).body("hello world");
            })
            .await;
        let head = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/uploads/docs/doc-1");
                then.status(200).header("Content-Type", "text/csv");
            })
            .await;

        let store = HttpObjectStore::new(&server.base_url(), Some("secret".into())).expect("client");
        let location = StorageRef::for_document("uploads", "doc-1");

        let bytes = store.bytes(&location).await.expect("bytes");
        assert_eq!(bytes, b"hello world");
        let metadata = store.metadata(&location).await.expect("metadata");
        assert_eq!(metadata.get("content-type").map(String::as_str), Some("text/csv"));

        get.assert_async().await;
        head.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_is_reported_as_missing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/uploads/docs/absent");
                then.status(404);
            })
            .await;

        let store = HttpObjectStore::new(&server.base_url(), None).expect("client");
        let location = StorageRef::for_document("uploads", "absent");

        assert!(!store.exists(&location).await.expect("exists"));
        let error = store.bytes(&location).await.unwrap_err();
        assert!(matches!(error, ObjectStoreError::Missing(_)));
    }

    #[tokio::test]
    async fn server_errors_surface_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/uploads/docs/doc-2");
                then.status(503).body("busy");
            })
            .await;

        let store = HttpObjectStore::new(&server.base_url(), None).expect("client");
        let error = store
            .bytes(&StorageRef::for_document("uploads", "doc-2"))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ObjectStoreError::UnexpectedStatus { status: 503, .. }
        ));
    }
}
