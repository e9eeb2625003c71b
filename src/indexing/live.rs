//! Live indexing: keep the index in step with single saves and deletes.

use std::sync::Arc;

use tracing::debug;

use super::lifecycle::IndexLifecycle;
use super::mapping::MappingRegistry;
use super::writer::IndexWriter;
use crate::error::Result;
use crate::search::SearchBackend;

pub struct LiveIndexer {
    backend: Arc<dyn SearchBackend>,
    writer: IndexWriter,
    registry: Arc<MappingRegistry>,
    alias: String,
    enabled: bool,
}

impl LiveIndexer {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        registry: Arc<MappingRegistry>,
        alias: &str,
        enabled: bool,
    ) -> Self {
        Self {
            writer: IndexWriter::new(backend.clone()),
            backend,
            registry,
            alias: alias.to_string(),
            enabled,
        }
    }

    /// Make sure the alias has a generation behind it, so the first live
    /// write on a fresh cluster has somewhere to go
    pub async fn ensure_ready(&self, lifecycle: &IndexLifecycle) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let index = lifecycle.ensure_alias(&self.alias).await?;
        debug!("Live indexing into {} via {}", index, self.alias);
        Ok(())
    }

    /// Index one object right after it was saved
    pub async fn index_item(&self, mapping: &str, id: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mapping = self.registry.get(mapping)?;
        let report = self
            .writer
            .index_chunk(mapping.as_ref(), &self.alias, &[id])
            .await?;
        debug!(id, indexed = report.indexed, "Live indexed {}", mapping.name());
        Ok(())
    }

    /// Remove one object's document right after it was deleted
    pub async fn unindex_item(&self, mapping: &str, id: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mapping = self.registry.get(mapping)?;
        let removed = self
            .backend
            .delete_document(&self.alias, &mapping.document_id(id))
            .await?;
        debug!(id, removed, "Live unindexed {}", mapping.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::responses::ResponseMapping;
    use crate::models::Response;
    use crate::search::MemoryBackend;
    use crate::store::{ResponseStore, Store};
    use serde_json::json;

    async fn setup(enabled: bool) -> (MemoryBackend, ResponseStore, LiveIndexer) {
        let backend = MemoryBackend::new();
        backend.create_index("feedback-1", &json!({})).await.unwrap();
        backend.swap_alias("feedback", &[], "feedback-1").await.unwrap();

        let responses = Store::temporary().unwrap().responses().unwrap();
        let mut registry = MappingRegistry::new();
        registry.register(ResponseMapping::new(responses.clone()));

        let live = LiveIndexer::new(
            Arc::new(backend.clone()),
            Arc::new(registry),
            "feedback",
            enabled,
        );
        (backend, responses, live)
    }

    #[tokio::test]
    async fn test_save_then_delete() {
        let (backend, responses, live) = setup(true).await;
        let mut response = Response::new(true, "love it", "firefox", "1.0");
        let id = responses.save(&mut response).unwrap();

        live.index_item("response", id).await.unwrap();
        assert_eq!(backend.count("feedback").await.unwrap(), 1);

        responses.delete(id).unwrap();
        live.unindex_item("response", id).await.unwrap();
        assert_eq!(backend.count("feedback").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_first_write_on_fresh_backend() {
        use crate::indexing::queue::{InlineQueue, RetryPolicy};
        use crate::indexing::tasks::{ChunkWorker, Dispatcher};
        use std::time::Duration;

        let store = Store::temporary().unwrap();
        let responses = store.responses().unwrap();
        let records = store.records().unwrap();
        let backend = MemoryBackend::new();
        let search: Arc<dyn SearchBackend> = Arc::new(backend.clone());

        let mut registry = MappingRegistry::new();
        registry.register(ResponseMapping::new(responses.clone()));
        let registry = Arc::new(registry);

        let worker = ChunkWorker::new(
            IndexWriter::new(search.clone()),
            registry.clone(),
            records.clone(),
        );
        let queue = InlineQueue::new(
            Arc::new(worker),
            RetryPolicy::new(1, Duration::from_millis(1)),
        );
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(queue), records, 10));
        let lifecycle = IndexLifecycle::new(
            search.clone(),
            registry.clone(),
            dispatcher,
            Duration::from_secs(1),
        );
        let live = LiveIndexer::new(search, registry, "feedback", true);

        let mut response = Response::new(true, "first!", "firefox", "1.0");
        let id = responses.save(&mut response).unwrap();
        assert!(live.index_item("response", id).await.is_err());

        live.ensure_ready(&lifecycle).await.unwrap();
        live.ensure_ready(&lifecycle).await.unwrap();
        live.index_item("response", id).await.unwrap();
        assert_eq!(backend.count("feedback").await.unwrap(), 1);
        assert_eq!(backend.indices().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let (backend, responses, live) = setup(false).await;
        let mut response = Response::new(false, "meh", "firefox", "1.0");
        let id = responses.save(&mut response).unwrap();

        live.index_item("response", id).await.unwrap();
        assert_eq!(backend.count("feedback").await.unwrap(), 0);
        assert_eq!(backend.bulk_calls(), 0);
    }
}
