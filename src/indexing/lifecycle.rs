//! Index generations behind a stable alias.
//!
//! A rebuild creates a new generation, fills it through the dispatcher,
//! waits for the batch to settle and only then repoints the alias. Until the
//! swap succeeds readers keep using the previous generation; on any failure
//! the new generation is dropped and the alias is left alone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use super::mapping::MappingRegistry;
use super::tasks::{new_batch_id, Dispatcher};
use crate::elasticsearch::index_body;
use crate::error::{IndexError, Result};
use crate::models::{BatchStatus, BatchSummary};
use crate::search::SearchBackend;

/// Result of a successful rebuild
#[derive(Debug, Clone)]
pub struct RebuildReport {
    pub index: String,
    pub batch_id: String,
    pub previous: Vec<String>,
    pub summary: BatchSummary,
}

pub struct IndexLifecycle {
    backend: Arc<dyn SearchBackend>,
    registry: Arc<MappingRegistry>,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
    timeout: Duration,
}

/// "{alias}-{timestamp}" with millisecond resolution
pub fn generation_name(alias: &str) -> String {
    format!("{}-{}", alias, Utc::now().format("%Y%m%d%H%M%S%3f"))
}

impl IndexLifecycle {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        registry: Arc<MappingRegistry>,
        dispatcher: Arc<Dispatcher>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            dispatcher,
            poll_interval: Duration::from_millis(500),
            timeout,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Concrete index currently behind `alias`
    pub async fn resolve(&self, alias: &str) -> Result<String> {
        let mut targets = self.backend.alias_targets(alias).await?;
        if targets.len() == 1 {
            return Ok(targets.remove(0));
        }
        if targets.len() > 1 {
            return Err(IndexError::Lifecycle(format!(
                "alias [{}] points at {} indices",
                alias,
                targets.len()
            )));
        }
        if self.backend.index_exists(alias).await? {
            return Ok(alias.to_string());
        }
        Err(IndexError::Lifecycle(format!(
            "alias [{}] does not exist",
            alias
        )))
    }

    /// Create the first generation if the alias does not exist yet
    pub async fn ensure_alias(&self, alias: &str) -> Result<String> {
        if self.backend.index_exists(alias).await? {
            return self.resolve(alias).await;
        }
        let index = self.create_generation(alias).await?;
        self.backend.swap_alias(alias, &[], &index).await?;
        info!("Created {} behind alias {}", index, alias);
        Ok(index)
    }

    /// Replace whatever is behind `alias` with one empty generation
    pub async fn recreate_empty(&self, alias: &str) -> Result<String> {
        let previous = self.backend.alias_targets(alias).await?;
        if previous.is_empty() && self.backend.index_exists(alias).await? {
            // A concrete index squatting on the alias name
            info!("Deleting existing index: {}", alias);
            self.backend.delete_index(alias).await?;
        }

        let index = self.create_generation(alias).await?;
        if let Err(err) = self.backend.swap_alias(alias, &previous, &index).await {
            self.discard(&index).await;
            return Err(err);
        }
        self.drop_generations(&previous).await;

        info!("Recreated {} as empty index {}", alias, index);
        Ok(index)
    }

    /// Build a fresh generation from every registered mapping type and swap
    /// the alias over to it.
    pub async fn rebuild(&self, alias: &str) -> Result<RebuildReport> {
        let previous = self.backend.alias_targets(alias).await?;
        if previous.is_empty() && self.backend.index_exists(alias).await? {
            return Err(IndexError::Lifecycle(format!(
                "[{}] is a concrete index, not an alias; recreate it first",
                alias
            )));
        }

        let index = self.create_generation(alias).await?;
        let batch_id = new_batch_id();
        info!(batch_id = %batch_id, "Rebuilding {} into {}", alias, index);

        let summary = match self.populate(&index, &batch_id).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!("Rebuild of {} failed, keeping {:?}: {}", alias, previous, err);
                self.abandon_batch(&batch_id, &err);
                self.discard(&index).await;
                return Err(err);
            }
        };

        if let Err(err) = self.backend.swap_alias(alias, &previous, &index).await {
            warn!("Alias swap for {} failed, keeping {:?}: {}", alias, previous, err);
            self.discard(&index).await;
            return Err(IndexError::Lifecycle(format!(
                "alias swap to {} failed: {}",
                index, err
            )));
        }
        self.drop_generations(&previous).await;

        info!(
            "Alias {} now points at {} ({} chunks)",
            alias,
            index,
            summary.total()
        );
        Ok(RebuildReport {
            index,
            batch_id,
            previous,
            summary,
        })
    }

    /// Reindex into the live generation without swapping. `percent` limits
    /// each mapping type to the first share of its ids.
    pub async fn reindex(&self, alias: &str, mappings: &[String], percent: u8) -> Result<String> {
        // Resolved once; every chunk of the batch writes to this generation
        let index = self.resolve(alias).await?;
        let batch_id = new_batch_id();

        for name in mappings {
            let mapping = self.registry.get(name)?;
            let ids = mapping.all_ids().await?;
            let take = ids.len() * usize::from(percent.min(100)) / 100;
            self.dispatcher
                .schedule_batch(&index, &batch_id, name, &ids[..take])
                .await?;
        }
        Ok(batch_id)
    }

    /// Poll the record store until the batch settles or the timeout passes
    pub async fn wait_for_batch(&self, batch_id: &str) -> Result<BatchSummary> {
        let started = Instant::now();
        loop {
            let summary = self.dispatcher.records().batch_summary(batch_id)?;
            if summary.status() != BatchStatus::Pending {
                return Ok(summary);
            }
            if started.elapsed() >= self.timeout {
                return Err(IndexError::Timeout(format!(
                    "batch {} still has {} pending chunks",
                    batch_id, summary.pending
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Settle whatever is still pending in a batch nobody waits for any
    /// more. Queued chunks of the batch then skip their write.
    pub fn abandon_batch(&self, batch_id: &str, cause: &IndexError) {
        let message = format!("batch abandoned: {}", cause);
        match self.dispatcher.records().fail_pending(batch_id, &message) {
            Ok(0) => {}
            Ok(n) => warn!(batch_id, "Marked {} pending chunks failed", n),
            Err(err) => warn!(batch_id, "Could not settle abandoned batch: {}", err),
        }
    }

    async fn populate(&self, index: &str, batch_id: &str) -> Result<BatchSummary> {
        for mapping in self.registry.iter() {
            let ids = mapping.all_ids().await?;
            self.dispatcher
                .schedule_batch(index, batch_id, mapping.name(), &ids)
                .await?;
        }

        let summary = self.wait_for_batch(batch_id).await?;
        if summary.status() == BatchStatus::Failure {
            return Err(IndexError::Lifecycle(format!(
                "{} of {} chunks failed in batch {}",
                summary.failure,
                summary.total(),
                batch_id
            )));
        }

        self.backend.refresh(index).await?;
        Ok(summary)
    }

    async fn create_generation(&self, alias: &str) -> Result<String> {
        let mut index = generation_name(alias);
        while self.backend.index_exists(&index).await? {
            // Two generations within the same millisecond
            tokio::time::sleep(Duration::from_millis(1)).await;
            index = generation_name(alias);
        }
        let body = index_body(self.registry.properties())?;

        info!("Creating index: {}", index);
        if let Err(err) = self.backend.create_index(&index, &body).await {
            // Creation may have half-happened; make sure nothing is left over
            if self.backend.index_exists(&index).await.unwrap_or(false) {
                self.discard(&index).await;
            }
            return Err(IndexError::Lifecycle(format!(
                "failed to create {}: {}",
                index, err
            )));
        }
        Ok(index)
    }

    async fn discard(&self, index: &str) {
        if let Err(err) = self.backend.delete_index(index).await {
            warn!("Failed to delete abandoned index {}: {}", index, err);
        }
    }

    async fn drop_generations(&self, indices: &[String]) {
        for old in indices {
            info!("Deleting previous generation {}", old);
            self.discard(old).await;
        }
    }
}
