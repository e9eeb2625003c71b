//! Storage for submitted feedback responses.

use tracing::debug;

use crate::error::Result;
use crate::models::Response;

#[derive(Clone)]
pub struct ResponseStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl ResponseStore {
    pub(super) fn new(db: sled::Db, tree: sled::Tree) -> Self {
        Self { db, tree }
    }

    /// Persist a response, assigning an id on first save
    pub fn save(&self, response: &mut Response) -> Result<u64> {
        if response.id == 0 {
            // sled ids start at zero, which we reserve for "unsaved"
            response.id = self.db.generate_id()? + 1;
        }
        self.tree
            .insert(response.id.to_be_bytes(), serde_json::to_vec(response)?)?;
        debug!(response_id = response.id, "Saved response");
        Ok(response.id)
    }

    pub fn get(&self, id: u64) -> Result<Option<Response>> {
        match self.tree.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch responses in id order; ids that no longer exist are omitted
    pub fn get_many(&self, ids: &[u64]) -> Result<Vec<Response>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(response) = self.get(*id)? {
                found.push(response);
            }
        }
        Ok(found)
    }

    pub fn delete(&self, id: u64) -> Result<bool> {
        Ok(self.tree.remove(id.to_be_bytes())?.is_some())
    }

    /// Every stored id in ascending order
    pub fn ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::with_capacity(self.tree.len());
        for key in self.tree.iter().keys() {
            let key = key?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&key);
            ids.push(u64::from_be_bytes(bytes));
        }
        Ok(ids)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
