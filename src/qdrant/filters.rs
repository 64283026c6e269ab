//! Qdrant filter construction for tenant-scoped search and stale-chunk deletion.

use crate::vector::SearchFilter;
use serde_json::{Value, json};

fn match_value(key: &str, value: &str) -> Value {
    json!({
        "key": key,
        "match": { "value": value }
    })
}

/// Compose the filter for a search. Each tag becomes its own `must` clause, so all tags are
/// required.
pub fn build_search_filter(filter: &SearchFilter) -> Value {
    let mut must = vec![match_value("tenant_id", &filter.tenant_id)];

    if let Some(document_id) = filter
        .document_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        must.push(match_value("document_id", document_id));
    }

    for tag in filter
        .tags
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
    {
        must.push(match_value("tags", tag));
    }

    json!({ "must": must })
}

/// Select a document's chunks at or beyond `keep_below`.
pub fn build_stale_filter(
    tenant_id: &str,
    bucket: &str,
    document_id: &str,
    keep_below: usize,
) -> Value {
    json!({
        "must": [
            match_value("tenant_id", tenant_id),
            match_value("bucket", bucket),
            match_value("document_id", document_id),
            {
                "key": "ordinal",
                "range": { "gte": keep_below }
            }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_filter_always_scopes_tenant() {
        let filter = build_search_filter(&SearchFilter {
            tenant_id: "acme".into(),
            ..Default::default()
        });
        assert_eq!(
            filter,
            json!({
                "must": [
                    { "key": "tenant_id", "match": { "value": "acme" } }
                ]
            })
        );
    }

    #[test]
    fn tags_are_combined_with_and() {
        let filter = build_search_filter(&SearchFilter {
            tenant_id: "acme".into(),
            document_id: Some("doc-1".into()),
            tags: vec!["alpha".into(), " ".into(), "beta".into()],
        });
        assert_eq!(
            filter,
            json!({
                "must": [
                    { "key": "tenant_id", "match": { "value": "acme" } },
                    { "key": "document_id", "match": { "value": "doc-1" } },
                    { "key": "tags", "match": { "value": "alpha" } },
                    { "key": "tags", "match": { "value": "beta" } }
                ]
            })
        );
    }

    #[test]
    fn stale_filter_uses_ordinal_range() {
        let filter = build_stale_filter("acme", "raw", "doc-1", 3);
        assert_eq!(filter["must"][3]["range"]["gte"], 3);
        assert_eq!(filter["must"][1]["match"]["value"], "raw");
        assert_eq!(filter["must"][2]["match"]["value"], "doc-1");
    }
}
