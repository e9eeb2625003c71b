//! Mapping types: how each kind of domain object is fetched and turned into
//! index documents.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{IndexError, Result};
use crate::search::IndexDocument;

/// One indexed entity kind.
#[async_trait]
pub trait MappingType: Send + Sync {
    type Object: Send + Sync;

    /// Name carried in chunk payloads, e.g. "response"
    fn name(&self) -> &str;

    /// Load live objects for `ids`. Ids that no longer resolve are omitted.
    async fn fetch(&self, ids: &[u64]) -> Result<Vec<Self::Object>>;

    fn to_document(&self, object: &Self::Object) -> Result<IndexDocument>;

    /// Every id a full rebuild should index
    async fn all_ids(&self) -> Result<Vec<u64>>;

    /// Field mappings this kind contributes to the index body
    fn properties(&self) -> Value;

    /// Document id for an object id; must match what `to_document` emits
    fn document_id(&self, id: u64) -> String {
        id.to_string()
    }
}

/// Object-safe view of a [`MappingType`], so kinds can be looked up by name
/// from a chunk payload.
#[async_trait]
pub trait DynMapping: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_documents(&self, ids: &[u64]) -> Result<Vec<IndexDocument>>;

    async fn all_ids(&self) -> Result<Vec<u64>>;

    fn properties(&self) -> Value;

    fn document_id(&self, id: u64) -> String;
}

#[async_trait]
impl<M> DynMapping for M
where
    M: MappingType,
{
    fn name(&self) -> &str {
        MappingType::name(self)
    }

    async fn fetch_documents(&self, ids: &[u64]) -> Result<Vec<IndexDocument>> {
        let objects = self.fetch(ids).await?;
        objects.iter().map(|object| self.to_document(object)).collect()
    }

    async fn all_ids(&self) -> Result<Vec<u64>> {
        MappingType::all_ids(self).await
    }

    fn properties(&self) -> Value {
        MappingType::properties(self)
    }

    fn document_id(&self, id: u64) -> String {
        MappingType::document_id(self, id)
    }
}

/// Registered mapping types keyed by name
#[derive(Clone, Default)]
pub struct MappingRegistry {
    types: BTreeMap<String, Arc<dyn DynMapping>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M>(&mut self, mapping: M) -> &mut Self
    where
        M: MappingType + 'static,
    {
        let name = MappingType::name(&mapping).to_string();
        self.types.insert(name, Arc::new(mapping));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DynMapping>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| IndexError::UnknownMapping(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DynMapping>> {
        self.types.values()
    }

    /// Field mappings of every registered kind
    pub fn properties(&self) -> Vec<Value> {
        self.types.values().map(|m| m.properties()).collect()
    }
}
