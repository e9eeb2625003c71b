//! Chunk tasks: scheduling one unit of work per chunk and turning each
//! chunk's outcome into its record's status.

use std::sync::Arc;

use async_trait::async_trait;
use indicatif::ProgressBar;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::chunker::{chunked, Chunk};
use super::mapping::MappingRegistry;
use super::queue::{Attempt, ChunkTask, TaskHandler, TaskQueue};
use super::writer::IndexWriter;
use crate::error::{IndexError, Result};
use crate::store::{RecordStore, Transition};

/// Fresh batch identifier
pub fn new_batch_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Executes chunk tasks: the only place chunk outcomes reach the record store
pub struct ChunkWorker {
    writer: IndexWriter,
    registry: Arc<MappingRegistry>,
    records: RecordStore,
}

impl ChunkWorker {
    pub fn new(writer: IndexWriter, registry: Arc<MappingRegistry>, records: RecordStore) -> Self {
        Self {
            writer,
            registry,
            records,
        }
    }

    async fn write(&self, task: &ChunkTask, attempt: Attempt) -> Result<()> {
        let mapping = self.registry.get(&task.chunk.mapping)?;
        let write = self
            .writer
            .index_chunk(mapping.as_ref(), &task.index, &task.chunk.ids);

        let report = match attempt.timeout {
            Some(limit) => tokio::time::timeout(limit, write).await.map_err(|_| {
                IndexError::Timeout(format!("chunk {} after {:?}", task.chunk.label(), limit))
            })??,
            None => write.await?,
        };

        debug!(
            record_id = task.record_id,
            indexed = report.indexed,
            skipped = report.skipped,
            "Indexed {} into {}",
            task.chunk.label(),
            task.index
        );
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ChunkWorker {
    async fn run(&self, task: &ChunkTask, attempt: Attempt) -> Result<()> {
        match self.records.mark_started(task.record_id) {
            Ok(Transition::Applied) => {}
            Ok(Transition::AlreadySettled(status)) => {
                // Settled by an earlier delivery or by an abandoned rebuild;
                // its target index may be gone
                info!(
                    record_id = task.record_id,
                    batch_id = %task.batch_id,
                    "Record already {}, skipping chunk {}",
                    status,
                    task.chunk.label()
                );
                return Ok(());
            }
            Err(err) => {
                self.settle_failure(task, &err);
                return Err(err);
            }
        }

        let result = match self.write(task, attempt).await {
            Ok(()) => self.records.mark_success(task.record_id).map(|_| ()),
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            // Transient errors only settle the record once the queue has no
            // retry left
            if !err.is_transient() || attempt.is_final() {
                self.settle_failure(task, &err);
            }
            return Err(err);
        }
        Ok(())
    }
}

impl ChunkWorker {
    /// Best effort: a record that cannot be marked stays PENDING
    fn settle_failure(&self, task: &ChunkTask, err: &IndexError) {
        error!(
            record_id = task.record_id,
            batch_id = %task.batch_id,
            "Chunk {} failed: {}",
            task.chunk.label(),
            err
        );
        if let Err(store_err) = self.records.mark_failure(task.record_id, &err.to_string()) {
            error!(
                record_id = task.record_id,
                batch_id = %task.batch_id,
                "Could not mark record failed, it stays pending: {}",
                store_err
            );
        }
    }
}

/// Schedules chunk tasks on an injected queue
pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    records: RecordStore,
    chunk_size: usize,
    progress: Option<ProgressBar>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>, records: RecordStore, chunk_size: usize) -> Self {
        Self {
            queue,
            records,
            chunk_size,
            progress: None,
        }
    }

    /// Advance `progress` by each chunk's size as it is scheduled
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Enqueue one chunk whose record already exists
    pub async fn schedule(
        &self,
        index: &str,
        batch_id: &str,
        record_id: u64,
        chunk: Chunk,
    ) -> Result<()> {
        let size = chunk.len() as u64;
        self.queue
            .enqueue(ChunkTask {
                index: index.to_string(),
                batch_id: batch_id.to_string(),
                record_id,
                chunk,
            })
            .await?;

        if let Some(pb) = &self.progress {
            pb.inc(size);
        }
        Ok(())
    }

    /// Chunk `ids`, create one PENDING record per chunk and schedule each.
    /// Returns the record ids in chunk order.
    pub async fn schedule_batch(
        &self,
        index: &str,
        batch_id: &str,
        mapping: &str,
        ids: &[u64],
    ) -> Result<Vec<u64>> {
        info!(
            batch_id,
            index,
            "Scheduling {} {} ids in chunks of {}",
            ids.len(),
            mapping,
            self.chunk_size
        );

        let mut record_ids = Vec::new();
        for chunk in chunked(mapping, ids, self.chunk_size) {
            let record_id = self.records.create(batch_id, &chunk.label())?;
            record_ids.push(record_id);

            if let Err(err) = self.schedule(index, batch_id, record_id, chunk).await {
                // Never reached a worker, so nobody else will settle it
                warn!(record_id, "Failed to enqueue chunk: {}", err);
                self.records.mark_failure(record_id, &err.to_string())?;
                return Err(err);
            }
        }

        Ok(record_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::queue::{InlineQueue, RetryPolicy, WorkerPool};
    use crate::indexing::responses::ResponseMapping;
    use crate::models::{BatchStatus, RecordStatus, Response};
    use crate::search::{MemoryBackend, SearchBackend};
    use crate::store::{ResponseStore, Store};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        backend: MemoryBackend,
        responses: ResponseStore,
        records: RecordStore,
        queue: Arc<InlineQueue>,
        dispatcher: Dispatcher,
    }

    async fn harness(chunk_size: usize) -> Harness {
        let store = Store::temporary().unwrap();
        let responses = store.responses().unwrap();
        let records = store.records().unwrap();

        let backend = MemoryBackend::new();
        backend.create_index("feedback-1", &json!({})).await.unwrap();

        let mut registry = MappingRegistry::new();
        registry.register(ResponseMapping::new(responses.clone()));

        let worker = ChunkWorker::new(
            IndexWriter::new(Arc::new(backend.clone())),
            Arc::new(registry),
            records.clone(),
        );
        let policy = RetryPolicy::new(3, Duration::from_millis(1))
            .with_timeout(Duration::from_millis(100));
        let queue = Arc::new(InlineQueue::new(Arc::new(worker), policy));
        let dispatcher = Dispatcher::new(queue.clone(), records.clone(), chunk_size);

        Harness {
            backend,
            responses,
            records,
            queue,
            dispatcher,
        }
    }

    fn seed(responses: &ResponseStore, n: usize) -> Vec<u64> {
        (0..n)
            .map(|i| {
                let mut r = Response::new(true, &format!("response {}", i), "firefox", "1.0");
                responses.save(&mut r).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_chunk_indexes_everything() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 10);

        let record_id = h.records.create("b1", "response chunk").unwrap();
        h.dispatcher
            .schedule("feedback-1", "b1", record_id, Chunk::new("response", ids))
            .await
            .unwrap();

        h.backend.refresh("feedback-1").await.unwrap();
        assert_eq!(h.backend.count("feedback-1").await.unwrap(), 10);
        assert_eq!(h.records.status(record_id).unwrap(), RecordStatus::Success);
    }

    #[tokio::test]
    async fn test_deleted_object_is_not_a_failure() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 10);
        h.responses.delete(ids[3]).unwrap();

        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b1", "response", &ids)
            .await
            .unwrap();

        assert_eq!(h.backend.count("feedback-1").await.unwrap(), 9);
        assert_eq!(record_ids.len(), 1);
        assert_eq!(h.records.status(record_ids[0]).unwrap(), RecordStatus::Success);
    }

    #[tokio::test]
    async fn test_batch_success_across_chunks() {
        let h = harness(4).await;
        let ids = seed(&h.responses, 10);

        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b2", "response", &ids)
            .await
            .unwrap();

        assert_eq!(record_ids.len(), 3);
        assert_eq!(h.records.batch_status("b2").unwrap(), BatchStatus::Success);
        assert_eq!(h.backend.count("feedback-1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_one_rejected_chunk_fails_batch() {
        let h = harness(4).await;
        let ids = seed(&h.responses, 10);
        h.backend.reject_document(&ids[5].to_string());

        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b3", "response", &ids)
            .await
            .unwrap();

        let statuses: Vec<RecordStatus> = record_ids
            .iter()
            .map(|id| h.records.status(*id).unwrap())
            .collect();
        assert_eq!(
            statuses,
            vec![
                RecordStatus::Success,
                RecordStatus::Failure,
                RecordStatus::Success
            ]
        );
        assert_eq!(h.records.batch_status("b3").unwrap(), BatchStatus::Failure);

        // Rejections are permanent: one attempt, then dead-lettered
        let dead = h.queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(dead[0].task.record_id, record_ids[1]);
        assert!(h.records.get(record_ids[1]).unwrap().message.is_some());
    }

    #[tokio::test]
    async fn test_redelivered_chunk_does_not_duplicate() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 10);
        let chunk = Chunk::new("response", ids);

        // The same chunk delivered twice before either delivery settled
        let first = h.records.create("b4", "delivery 1").unwrap();
        let second = h.records.create("b4", "delivery 2").unwrap();
        h.dispatcher
            .schedule("feedback-1", "b4", first, chunk.clone())
            .await
            .unwrap();
        h.dispatcher
            .schedule("feedback-1", "b4", second, chunk)
            .await
            .unwrap();

        assert_eq!(h.backend.bulk_calls(), 2);
        assert_eq!(h.backend.count("feedback-1").await.unwrap(), 10);
        assert_eq!(h.records.batch_status("b4").unwrap(), BatchStatus::Success);
    }

    #[tokio::test]
    async fn test_settled_record_is_not_written_again() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 1);
        let record_id = h.records.create("b9", "abandoned").unwrap();
        h.records.mark_failure(record_id, "rebuild abandoned").unwrap();

        h.dispatcher
            .schedule("feedback-1", "b9", record_id, Chunk::new("response", ids))
            .await
            .unwrap();

        assert_eq!(h.backend.bulk_calls(), 0);
        assert_eq!(h.backend.count("feedback-1").await.unwrap(), 0);
        let record = h.records.get(record_id).unwrap();
        assert_eq!(record.status, RecordStatus::Failure);
        assert_eq!(record.message.as_deref(), Some("rebuild abandoned"));
        assert!(h.queue.dead_letters().is_empty());

        // A successful chunk replayed later is skipped too
        let done = h.records.create("b9", "done").unwrap();
        let chunk = Chunk::new("response", h.responses.ids().unwrap());
        h.dispatcher
            .schedule("feedback-1", "b9", done, chunk.clone())
            .await
            .unwrap();
        h.dispatcher
            .schedule("feedback-1", "b9", done, chunk)
            .await
            .unwrap();
        assert_eq!(h.backend.bulk_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_record_is_dead_lettered() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 2);

        h.dispatcher
            .schedule("feedback-1", "b10", 9999, Chunk::new("response", ids))
            .await
            .unwrap();

        assert_eq!(h.backend.bulk_calls(), 0);
        let dead = h.queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert!(dead[0].error.contains("9999"));
    }

    #[tokio::test]
    async fn test_timed_out_attempt_is_retried() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 3);
        h.backend
            .slow_next_bulk_calls(1, Duration::from_millis(500));

        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b11", "response", &ids)
            .await
            .unwrap();

        assert_eq!(h.backend.bulk_calls(), 2);
        assert_eq!(h.records.status(record_ids[0]).unwrap(), RecordStatus::Success);
        assert_eq!(h.backend.count("feedback-1").await.unwrap(), 3);
        assert!(h.queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_on_final_attempt_marks_failure() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 3);
        h.backend
            .slow_next_bulk_calls(10, Duration::from_millis(500));

        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b12", "response", &ids)
            .await
            .unwrap();

        assert_eq!(h.backend.bulk_calls(), 3);
        let record = h.records.get(record_ids[0]).unwrap();
        assert_eq!(record.status, RecordStatus::Failure);
        assert!(record.message.unwrap().contains("Timed out"));
        assert_eq!(h.queue.dead_letters()[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_worker_pool_settles_every_chunk() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 25);

        let mut registry = MappingRegistry::new();
        registry.register(ResponseMapping::new(h.responses.clone()));
        let worker = ChunkWorker::new(
            IndexWriter::new(Arc::new(h.backend.clone())),
            Arc::new(registry),
            h.records.clone(),
        );
        let pool = Arc::new(WorkerPool::start(
            Arc::new(worker),
            RetryPolicy::new(3, Duration::from_millis(1)),
            4,
            2,
        ));
        let dispatcher = Dispatcher::new(pool.clone(), h.records.clone(), 3);
        h.backend.fail_next_bulk_calls(2);

        let record_ids = dispatcher
            .schedule_batch("feedback-1", "b13", "response", &ids)
            .await
            .unwrap();
        pool.shutdown().await;

        assert_eq!(record_ids.len(), 9);
        assert_eq!(h.records.batch_status("b13").unwrap(), BatchStatus::Success);
        assert_eq!(h.backend.count("feedback-1").await.unwrap(), 25);
        assert!(pool.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_before_settling() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 3);
        h.backend.fail_next_bulk_calls(2);

        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b5", "response", &ids)
            .await
            .unwrap();

        assert_eq!(h.backend.bulk_calls(), 3);
        assert_eq!(h.records.status(record_ids[0]).unwrap(), RecordStatus::Success);
        assert!(h.queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failure() {
        let h = harness(1000).await;
        let ids = seed(&h.responses, 3);
        h.backend.fail_next_bulk_calls(10);

        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b6", "response", &ids)
            .await
            .unwrap();

        assert_eq!(h.backend.bulk_calls(), 3);
        assert_eq!(h.records.status(record_ids[0]).unwrap(), RecordStatus::Failure);
        assert_eq!(h.queue.dead_letters()[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_unknown_mapping_fails_record() {
        let h = harness(1000).await;
        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b7", "survey", &[1, 2])
            .await
            .unwrap();

        let record = h.records.get(record_ids[0]).unwrap();
        assert_eq!(record.status, RecordStatus::Failure);
        assert!(record.message.unwrap().contains("survey"));
    }

    #[tokio::test]
    async fn test_empty_batch_schedules_nothing() {
        let h = harness(10).await;
        let record_ids = h
            .dispatcher
            .schedule_batch("feedback-1", "b8", "response", &[])
            .await
            .unwrap();

        assert!(record_ids.is_empty());
        assert_eq!(h.records.batch_status("b8").unwrap(), BatchStatus::Empty);
        assert_eq!(h.backend.bulk_calls(), 0);
    }

    #[test]
    fn test_batch_ids_unique() {
        assert_ne!(new_batch_id(), new_batch_id());
        assert_eq!(new_batch_id().len(), 32);
    }
}
