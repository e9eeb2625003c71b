//! Elasticsearch client wrapper.

use async_trait::async_trait;
use elasticsearch::{
    cluster::ClusterHealthParts,
    http::response::Response,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::{
        IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesGetAliasParts,
        IndicesRefreshParts,
    },
    BulkParts, CountParts, DeleteParts, Elasticsearch,
};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::bulk::{bulk_body, parse_bulk_response};
use crate::error::{IndexError, Result};
use crate::search::{BulkOutcome, IndexDocument, SearchBackend};

/// Elasticsearch client wrapper with connection configuration
#[derive(Clone)]
pub struct EsClient {
    client: Elasticsearch,
}

impl EsClient {
    /// Create a new Elasticsearch client
    pub fn new(es_url: &str) -> Result<Self> {
        let url = Url::parse(es_url)
            .map_err(|e| IndexError::Config(format!("Invalid Elasticsearch URL: {}", e)))?;
        let conn_pool = SingleNodeConnectionPool::new(url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .build()
            .map_err(|e| IndexError::Transport(e.to_string()))?;

        Ok(Self {
            client: Elasticsearch::new(transport),
        })
    }

    /// Get the underlying Elasticsearch client
    pub fn client(&self) -> &Elasticsearch {
        &self.client
    }
}

/// Turn a non-success response into a backend error carrying its body
async fn check(response: Response) -> Result<Response> {
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IndexError::Backend {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SearchBackend for EsClient {
    /// Check if cluster is healthy
    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .cluster()
            .health(ClusterHealthParts::None)
            .send()
            .await?;

        Ok(response.status_code().is_success())
    }

    async fn bulk_index(&self, index: &str, docs: &[IndexDocument]) -> Result<BulkOutcome> {
        debug!("Sending {} documents to {}", docs.len(), index);

        let response = self
            .client
            .bulk(BulkParts::Index(index))
            .body(bulk_body(docs))
            .send()
            .await?;
        let response_body = check(response).await?.json::<Value>().await?;

        Ok(parse_bulk_response(&response_body, docs))
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<bool> {
        let response = self
            .client
            .delete(DeleteParts::IndexId(index, id))
            .send()
            .await?;

        if response.status_code().as_u16() == 404 {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(body.clone())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&[index]))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[index]))
            .send()
            .await?;

        Ok(response.status_code().is_success())
    }

    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .indices()
            .get_alias(IndicesGetAliasParts::Name(&[alias]))
            .send()
            .await?;

        if response.status_code().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let body = check(response).await?.json::<Value>().await?;

        // {"feedback-20240101000000": {"aliases": {"feedback": {}}}}
        let mut targets: Vec<String> = body
            .as_object()
            .map(|indices| indices.keys().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        Ok(targets)
    }

    async fn swap_alias(&self, alias: &str, remove: &[String], add: &str) -> Result<()> {
        let mut actions: Vec<Value> = remove
            .iter()
            .map(|index| json!({ "remove": { "index": index, "alias": alias } }))
            .collect();
        actions.push(json!({ "add": { "index": add, "alias": alias } }));

        // One request, so readers never observe the alias detached
        let response = self
            .client
            .indices()
            .update_aliases()
            .body(json!({ "actions": actions }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let response = self
            .client
            .indices()
            .refresh(IndicesRefreshParts::Index(&[index]))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Get document count in index
    async fn count(&self, index: &str) -> Result<u64> {
        let response = self
            .client
            .count(CountParts::Index(&[index]))
            .send()
            .await?;

        let body = check(response).await?.json::<Value>().await?;
        Ok(body["count"].as_u64().unwrap_or(0))
    }
}
