//! Conversion between indexed entries and Qdrant points.

use crate::vector::{EntryPayload, IndexedEntry, VectorStoreError};
use serde_json::{Map, Value, json};

/// Serialize an entry as a Qdrant point; the chunk id is the point id.
pub(crate) fn build_point(entry: &IndexedEntry) -> Result<Value, VectorStoreError> {
    let payload = serde_json::to_value(&entry.payload)
        .map_err(|err| VectorStoreError::InvalidResponse(err.to_string()))?;
    Ok(json!({
        "id": entry.chunk_id,
        "vector": entry.vector,
        "payload": payload,
    }))
}

/// Decode a stored payload map.
pub(crate) fn parse_payload(
    id: &str,
    payload: Option<Map<String, Value>>,
) -> Result<EntryPayload, VectorStoreError> {
    let map = payload
        .ok_or_else(|| VectorStoreError::InvalidResponse(format!("point {id} has no payload")))?;
    serde_json::from_value(Value::Object(map))
        .map_err(|err| VectorStoreError::InvalidResponse(format!("point {id}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::test_support::entry;

    #[test]
    fn point_carries_payload_fields() {
        let mut indexed = entry("doc-1", 2, vec![0.5, 0.5]);
        indexed.payload.tags = vec!["alpha".into()];
        let point = build_point(&indexed).expect("point");

        assert_eq!(point["id"], "doc-1:2");
        assert_eq!(point["payload"]["tenant_id"], "acme");
        assert_eq!(point["payload"]["ordinal"], 2);
        assert_eq!(point["payload"]["tags"], json!(["alpha"]));
    }

    #[test]
    fn payload_round_trips_and_rejects_missing_fields() {
        let indexed = entry("doc-1", 0, vec![1.0]);
        let point = build_point(&indexed).expect("point");
        let map = point["payload"].as_object().cloned();
        assert_eq!(parse_payload("p", map).expect("payload"), indexed.payload);

        let mut partial = Map::new();
        partial.insert("text".into(), Value::String("orphan".into()));
        assert!(matches!(
            parse_payload("p", Some(partial)),
            Err(VectorStoreError::InvalidResponse(_))
        ));
        assert!(parse_payload("p", None).is_err());
    }
}
