//! Wire types for the Qdrant REST API.

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Deserialize)]
pub(crate) struct CollectionInfoResponse {
    pub(crate) result: CollectionInfo,
}

#[derive(Deserialize)]
pub(crate) struct CollectionInfo {
    #[serde(default)]
    pub(crate) config: Option<CollectionConfig>,
}

#[derive(Deserialize)]
pub(crate) struct CollectionConfig {
    pub(crate) params: CollectionParams,
}

#[derive(Deserialize)]
pub(crate) struct CollectionParams {
    #[serde(default)]
    pub(crate) vectors: Option<VectorParams>,
}

#[derive(Deserialize)]
pub(crate) struct VectorParams {
    #[serde(default)]
    pub(crate) size: Option<usize>,
}

impl CollectionInfo {
    /// Vector size of the collection's unnamed vector, if reported.
    pub(crate) fn vector_size(&self) -> Option<usize> {
        self.config
            .as_ref()
            .and_then(|config| config.params.vectors.as_ref())
            .and_then(|vectors| vectors.size)
    }
}

#[derive(Deserialize)]
pub(crate) struct QueryResponse {
    pub(crate) result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

impl QueryResponseResult {
    pub(crate) fn into_points(self) -> Vec<QueryPoint> {
        match self {
            Self::Points(points) | Self::Object { points } => points,
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct QueryPoint {
    pub(crate) id: Value,
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
}

/// Render a Qdrant point id (UUID string, integer, or `{ "uuid": .. }`) as text.
pub(crate) fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Object(map) => match map.get("uuid") {
            Some(Value::String(uuid)) => uuid.clone(),
            Some(other) => other.to_string(),
            None => Value::Object(map).to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
