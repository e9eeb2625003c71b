//! Task queue infrastructure: at-least-once execution of chunk tasks with
//! retries and a dead-letter list.
//!
//! Two queues ship: [`InlineQueue`] runs each task as it is enqueued, which
//! keeps tests deterministic, and [`WorkerPool`] feeds a bounded channel
//! into a fixed set of tokio workers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::chunker::Chunk;
use crate::config::QueueConfig;
use crate::error::{IndexError, Result};

/// Payload of one unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTask {
    /// Concrete index name, resolved once for the whole batch
    pub index: String,
    pub batch_id: String,
    pub record_id: u64,
    pub chunk: Chunk,
}

/// Which try this is, and the limits the queue imposes on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
    pub timeout: Option<Duration>,
}

impl Attempt {
    /// No retry follows this attempt
    pub fn is_final(&self) -> bool {
        self.number >= self.max
    }
}

/// Executes one task attempt
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &ChunkTask, attempt: Attempt) -> Result<()>;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: ChunkTask) -> Result<()>;
}

/// Attempt limit and delays between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the first retry
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Randomization factor applied to each delay, 0.0 for none
    pub jitter: f64,
    pub timeout: Option<Duration>,
}

/// Jitter used for configured policies
const RETRY_JITTER: f64 = 0.25;

impl RetryPolicy {
    /// Doubling delays from `backoff`, capped at 30s, no jitter or timeout
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            max_backoff: Duration::from_secs(30).max(backoff),
            jitter: 0.0,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.backoff);
        self
    }

    /// Fresh delay schedule for one task. Attempts are bounded by
    /// `max_attempts`, not by elapsed time.
    fn schedule(&self) -> ExponentialBackoff {
        let mut schedule = ExponentialBackoff {
            current_interval: self.backoff,
            initial_interval: self.backoff,
            randomization_factor: self.jitter,
            multiplier: 2.0,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        };
        schedule.reset();
        schedule
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(
                config.retry_max_backoff_ms.max(config.retry_backoff_ms),
            ),
            jitter: RETRY_JITTER,
            timeout: (config.task_timeout_secs > 0)
                .then(|| Duration::from_secs(config.task_timeout_secs)),
        }
    }
}

/// A task the queue gave up on
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub task: ChunkTask,
    pub attempts: u32,
    pub error: String,
}

/// Run `task` until it succeeds, fails permanently or runs out of attempts
async fn execute(
    handler: &dyn TaskHandler,
    task: &ChunkTask,
    policy: &RetryPolicy,
) -> std::result::Result<(), DeadLetter> {
    let mut delays = policy.schedule();
    let mut number = 1;
    loop {
        let attempt = Attempt {
            number,
            max: policy.max_attempts,
            timeout: policy.timeout,
        };
        match handler.run(task, attempt).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && !attempt.is_final() => {
                let delay = delays.next_backoff().unwrap_or(policy.max_backoff);
                warn!(
                    record_id = task.record_id,
                    attempt = number,
                    "Chunk failed ({}), retrying in {:?}",
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                number += 1;
            }
            Err(err) => {
                error!(
                    record_id = task.record_id,
                    batch_id = %task.batch_id,
                    attempts = number,
                    "Chunk {} dead-lettered: {}",
                    task.chunk.label(),
                    err
                );
                return Err(DeadLetter {
                    task: task.clone(),
                    attempts: number,
                    error: err.to_string(),
                });
            }
        }
    }
}

#[derive(Clone, Default)]
struct DeadLetters(Arc<Mutex<Vec<DeadLetter>>>);

impl DeadLetters {
    fn lock(&self) -> MutexGuard<'_, Vec<DeadLetter>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, letter: DeadLetter) {
        self.lock().push(letter);
    }

    fn snapshot(&self) -> Vec<DeadLetter> {
        self.lock().clone()
    }
}

/// Runs each task to completion inside `enqueue`
pub struct InlineQueue {
    handler: Arc<dyn TaskHandler>,
    policy: RetryPolicy,
    dead: DeadLetters,
}

impl InlineQueue {
    pub fn new(handler: Arc<dyn TaskHandler>, policy: RetryPolicy) -> Self {
        Self {
            handler,
            policy,
            dead: DeadLetters::default(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.snapshot()
    }
}

#[async_trait]
impl TaskQueue for InlineQueue {
    /// Task failures end up in the dead-letter list, not in the result:
    /// enqueueing itself succeeded.
    async fn enqueue(&self, task: ChunkTask) -> Result<()> {
        if let Err(letter) = execute(self.handler.as_ref(), &task, &self.policy).await {
            self.dead.push(letter);
        }
        Ok(())
    }
}

/// Bounded channel drained by a fixed set of tokio workers
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<ChunkTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dead: DeadLetters,
}

impl WorkerPool {
    /// Spawn `workers` tasks on the current runtime
    pub fn start(
        handler: Arc<dyn TaskHandler>,
        policy: RetryPolicy,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<ChunkTask>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let dead = DeadLetters::default();

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let handler = handler.clone();
                let dead = dead.clone();
                tokio::spawn(async move {
                    loop {
                        // Lock only long enough to take one task
                        let next = rx.lock().await.recv().await;
                        let Some(task) = next else {
                            break;
                        };
                        debug!(worker, record_id = task.record_id, "Picked up chunk");
                        if let Err(letter) = execute(handler.as_ref(), &task, &policy).await {
                            dead.push(letter);
                        }
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();

        info!("Started {} indexing workers", workers.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            dead,
        }
    }

    pub fn from_config(handler: Arc<dyn TaskHandler>, config: &QueueConfig) -> Self {
        Self::start(
            handler,
            RetryPolicy::from(config),
            config.workers,
            config.capacity,
        )
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.snapshot()
    }

    /// Stop accepting tasks, let workers drain what is queued and wait for them
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(sender);

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Indexing worker panicked: {}", e);
            }
        }
    }
}

#[async_trait]
impl TaskQueue for WorkerPool {
    async fn enqueue(&self, task: ChunkTask) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(IndexError::QueueClosed)?;
        sender.send(task).await.map_err(|_| IndexError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails transiently `failures` times per task, then succeeds
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        permanent: bool,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn run(&self, _task: &ChunkTask, attempt: Attempt) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(IndexError::UnknownMapping("nope".into()));
            }
            if attempt.number <= self.failures {
                return Err(IndexError::Transport("connection refused".into()));
            }
            Ok(())
        }
    }

    fn task(record_id: u64) -> ChunkTask {
        ChunkTask {
            index: "feedback-1".into(),
            batch_id: "b1".into(),
            record_id,
            chunk: Chunk::new("response", vec![1, 2, 3]),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    fn flaky(failures: u32, permanent: bool) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
            permanent,
        })
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let handler = flaky(2, false);
        let queue = InlineQueue::new(handler.clone(), policy(3));

        queue.enqueue(task(1)).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let handler = flaky(5, false);
        let queue = InlineQueue::new(handler.clone(), policy(3));

        queue.enqueue(task(1)).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let handler = flaky(0, true);
        let queue = InlineQueue::new(handler.clone(), policy(5));

        queue.enqueue(task(1)).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.dead_letters()[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_worker_pool_drains_on_shutdown() {
        let handler = flaky(1, false);
        let pool = WorkerPool::start(handler.clone(), policy(2), 3, 4);

        for id in 0..10 {
            pool.enqueue(task(id)).await.unwrap();
        }
        pool.shutdown().await;

        // One failure plus one success per task
        assert_eq!(handler.calls.load(Ordering::SeqCst), 20);
        assert!(pool.dead_letters().is_empty());
        assert!(matches!(
            pool.enqueue(task(99)).await,
            Err(IndexError::QueueClosed)
        ));
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy::new(20, Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(500));
        let mut delays = policy.schedule();

        let millis: Vec<u128> = (0..19)
            .map(|_| delays.next_backoff().unwrap().as_millis())
            .collect();
        assert_eq!(&millis[..4], &[100, 200, 400, 500]);
        assert!(millis.iter().all(|ms| *ms <= 500));
    }

    #[test]
    fn test_configured_policy_is_capped() {
        let config = QueueConfig {
            max_attempts: 20,
            ..QueueConfig::default()
        };
        let policy = RetryPolicy::from(&config);
        let ceiling = Duration::from_millis(config.retry_max_backoff_ms);
        let slack = ceiling.mul_f64(1.0 + RETRY_JITTER) + Duration::from_millis(1);

        let mut delays = policy.schedule();
        for _ in 1..config.max_attempts {
            let delay = delays.next_backoff().unwrap();
            assert!(delay <= slack, "delay {:?} above ceiling", delay);
        }
    }
}
