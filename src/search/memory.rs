//! In-process search engine with Elasticsearch-like index and alias
//! semantics, plus fault injection for exercising failure paths.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use serde_json::Value;

use super::{BulkOutcome, IndexDocument, RejectedDocument, SearchBackend};
use crate::error::{IndexError, Result};

#[derive(Default)]
struct State {
    indices: HashMap<String, HashMap<String, Value>>,
    aliases: HashMap<String, Vec<String>>,
    bulk_calls: usize,
    /// Document ids every bulk write rejects
    reject_ids: HashSet<String>,
    /// Number of upcoming bulk calls that fail with a 503
    transient_bulk_failures: usize,
    /// Number of upcoming bulk calls that stall before answering
    slow_bulk_calls: usize,
    bulk_delay: Duration,
    fail_alias_swap: bool,
    fail_create: bool,
}

impl State {
    fn resolve(&self, name: &str) -> Vec<String> {
        match self.aliases.get(name) {
            Some(targets) => targets.clone(),
            None => vec![name.to_string()],
        }
    }

    /// Writes through an alias need exactly one target, as in Elasticsearch
    fn write_target(&self, name: &str) -> Result<String> {
        let targets = self.resolve(name);
        if targets.len() != 1 || !self.indices.contains_key(&targets[0]) {
            return Err(IndexError::Backend {
                status: 404,
                body: format!("no such index [{}]", name),
            });
        }
        Ok(targets[0].clone())
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not poison every later assertion
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reject `id` on every subsequent bulk write
    pub fn reject_document(&self, id: &str) {
        self.state().reject_ids.insert(id.to_string());
    }

    pub fn fail_next_bulk_calls(&self, n: usize) {
        self.state().transient_bulk_failures = n;
    }

    /// Stall the next `n` bulk calls for `delay` before they are applied
    pub fn slow_next_bulk_calls(&self, n: usize, delay: Duration) {
        let mut state = self.state();
        state.slow_bulk_calls = n;
        state.bulk_delay = delay;
    }

    pub fn fail_alias_swap(&self, fail: bool) {
        self.state().fail_alias_swap = fail;
    }

    pub fn fail_index_creation(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn bulk_calls(&self) -> usize {
        self.state().bulk_calls
    }

    pub fn indices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().indices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stored document by index (or alias) and id
    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        let state = self.state();
        state
            .resolve(index)
            .iter()
            .find_map(|name| state.indices.get(name).and_then(|docs| docs.get(id)).cloned())
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn bulk_index(&self, index: &str, docs: &[IndexDocument]) -> Result<BulkOutcome> {
        let stall = {
            let mut state = self.state();
            state.bulk_calls += 1;
            if state.slow_bulk_calls > 0 {
                state.slow_bulk_calls -= 1;
                Some(state.bulk_delay)
            } else {
                None
            }
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();

        if state.transient_bulk_failures > 0 {
            state.transient_bulk_failures -= 1;
            return Err(IndexError::Backend {
                status: 503,
                body: "unavailable_shards_exception".to_string(),
            });
        }

        let target = state.write_target(index)?;
        let mut outcome = BulkOutcome::default();
        let mut accepted = Vec::with_capacity(docs.len());
        for doc in docs {
            if state.reject_ids.contains(&doc.id) {
                outcome.rejected.push(RejectedDocument {
                    id: doc.id.clone(),
                    reason: "mapper_parsing_exception".to_string(),
                });
            } else {
                accepted.push((doc.id.clone(), doc.body.clone()));
            }
        }

        outcome.indexed = accepted.len();
        if let Some(docs) = state.indices.get_mut(&target) {
            docs.extend(accepted);
        }
        Ok(outcome)
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<bool> {
        let mut state = self.state();
        let target = state.write_target(index)?;
        Ok(state
            .indices
            .get_mut(&target)
            .map(|docs| docs.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn create_index(&self, index: &str, _body: &Value) -> Result<()> {
        let mut state = self.state();
        if state.fail_create {
            return Err(IndexError::Backend {
                status: 500,
                body: "index creation failed".to_string(),
            });
        }
        if state.indices.contains_key(index) || state.aliases.contains_key(index) {
            return Err(IndexError::Backend {
                status: 400,
                body: format!("resource_already_exists_exception [{}]", index),
            });
        }
        state.indices.insert(index.to_string(), HashMap::new());
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let mut state = self.state();
        if state.indices.remove(index).is_none() {
            return Err(IndexError::Backend {
                status: 404,
                body: format!("no such index [{}]", index),
            });
        }
        for targets in state.aliases.values_mut() {
            targets.retain(|t| t != index);
        }
        state.aliases.retain(|_, targets| !targets.is_empty());
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let state = self.state();
        Ok(state.indices.contains_key(index) || state.aliases.contains_key(index))
    }

    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>> {
        let mut targets = self.state().aliases.get(alias).cloned().unwrap_or_default();
        targets.sort();
        Ok(targets)
    }

    async fn swap_alias(&self, alias: &str, remove: &[String], add: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_alias_swap {
            return Err(IndexError::Backend {
                status: 500,
                body: "alias update failed".to_string(),
            });
        }
        if !state.indices.contains_key(add) {
            return Err(IndexError::Backend {
                status: 404,
                body: format!("no such index [{}]", add),
            });
        }

        let targets = state.aliases.entry(alias.to_string()).or_default();
        targets.retain(|t| !remove.contains(t));
        if !targets.iter().any(|t| t == add) {
            targets.push(add.to_string());
        }
        Ok(())
    }

    async fn refresh(&self, _index: &str) -> Result<()> {
        Ok(())
    }

    async fn count(&self, index: &str) -> Result<u64> {
        let state = self.state();
        let total = state
            .resolve(index)
            .iter()
            .filter_map(|name| state.indices.get(name))
            .map(|docs| docs.len() as u64)
            .sum();
        Ok(total)
    }
}
