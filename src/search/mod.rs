//! Search engine boundary.
//!
//! Everything the indexing pipeline needs from the engine goes through
//! [`SearchBackend`], implemented by the Elasticsearch client and by an
//! in-memory engine used in tests.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

pub use memory::MemoryBackend;

/// A document ready to be written, keyed by the source object's stable id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    pub id: String,
    pub body: Value,
}

impl IndexDocument {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

/// Document the engine refused during a bulk write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDocument {
    pub id: String,
    pub reason: String,
}

/// Per-document result of one bulk round trip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub indexed: usize,
    pub rejected: Vec<RejectedDocument>,
}

impl BulkOutcome {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn health_check(&self) -> Result<bool>;

    /// Write every document in a single round trip. Documents with an id
    /// already present are overwritten.
    async fn bulk_index(&self, index: &str, docs: &[IndexDocument]) -> Result<BulkOutcome>;

    /// Returns false when the document was not there
    async fn delete_document(&self, index: &str, id: &str) -> Result<bool>;

    async fn create_index(&self, index: &str, body: &Value) -> Result<()>;

    async fn delete_index(&self, index: &str) -> Result<()>;

    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Concrete indices the alias currently points at (empty if none)
    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>>;

    /// Atomically detach `alias` from `remove` and attach it to `add`
    async fn swap_alias(&self, alias: &str, remove: &[String], add: &str) -> Result<()>;

    async fn refresh(&self, index: &str) -> Result<()>;

    async fn count(&self, index: &str) -> Result<u64>;
}
