//! Bulk request encoding and response interpretation for Elasticsearch.

use elasticsearch::http::request::JsonBody;
use serde_json::{json, Value};

use crate::search::{BulkOutcome, IndexDocument, RejectedDocument};

/// Build the NDJSON bulk body: one `index` action line plus the source per
/// document. Using the document id as `_id` makes replays overwrite.
pub fn bulk_body(docs: &[IndexDocument]) -> Vec<JsonBody<Value>> {
    let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(docs.len() * 2);

    for doc in docs {
        // Action line
        body.push(json!({ "index": { "_id": &doc.id } }).into());
        // Document line
        body.push(doc.body.clone().into());
    }

    body
}

/// Interpret a bulk response body for the documents that were sent.
///
/// When the top-level `errors` flag is false every item was accepted.
/// Otherwise an item is rejected if its action object carries an `error`
/// object or a status of 300 or above. A flagged response that names no
/// failed item rejects every document, since none can be trusted.
pub fn parse_bulk_response(body: &Value, docs: &[IndexDocument]) -> BulkOutcome {
    if !body["errors"].as_bool().unwrap_or(false) {
        return BulkOutcome {
            indexed: docs.len(),
            rejected: Vec::new(),
        };
    }

    let mut rejected = Vec::new();
    if let Some(items) = body["items"].as_array() {
        for item in items {
            // Each item is keyed by its action name ("index", "create", ...)
            let Some(action) = item.as_object().and_then(|o| o.values().next()) else {
                continue;
            };
            let status = action["status"].as_u64().unwrap_or(200);
            if action["error"].is_object() || status >= 300 {
                rejected.push(RejectedDocument {
                    id: action["_id"].as_str().unwrap_or_default().to_string(),
                    reason: error_reason(&action["error"], status),
                });
            }
        }
    }

    if rejected.is_empty() {
        rejected = docs
            .iter()
            .map(|doc| RejectedDocument {
                id: doc.id.clone(),
                reason: "bulk response flagged errors without failed items".to_string(),
            })
            .collect();
    }

    BulkOutcome {
        indexed: docs.len().saturating_sub(rejected.len()),
        rejected,
    }
}

fn error_reason(error: &Value, status: u64) -> String {
    match (error["type"].as_str(), error["reason"].as_str()) {
        (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
        (Some(kind), None) => kind.to_string(),
        _ => format!("status {}", status),
    }
}
