//! Asynchronous task queue: bounded ingress with a semaphore-bounded
//! worker pool and two-phase graceful shutdown.
//!
//! Grounded on the worker pool's concurrency/backpressure/shutdown
//! idiom (semaphore-gated execution, `watch`-channel shutdown signal,
//! poll-until-drained-or-timeout), adapted here from "poll a durable
//! store for claimed tasks" to "accept into a bounded in-process
//! channel with `try_send`", which is the ingress shape the distilled
//! spec calls for.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::store::{OrchestratorStore, TaskRecord, TaskState};

pub type BoxedWork =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send>;

pub struct SubmittedTask {
    pub application_name: String,
    pub workflow_name: String,
    pub work: BoxedWork,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is at capacity")]
    Full,
    #[error("queue is shutting down")]
    ShuttingDown,
    #[error("task '{0}' not found")]
    TaskNotFound(Uuid),
    #[error("{0}")]
    InputError(String),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_concurrency: usize,
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_concurrency: 5,
            shutdown_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub workers: u64,
    pub capacity: u64,
}

struct Envelope {
    task_id: Uuid,
    application_name: String,
    workflow_name: String,
    work: BoxedWork,
}

/// Handle used to submit work and observe/control the queue; the
/// accompanying worker loop is spawned by `TaskQueue::start`.
pub struct TaskQueue {
    sender: mpsc::Sender<Envelope>,
    shutdown_tx: watch::Sender<bool>,
    accepting: Arc<AtomicBool>,
    pending: Arc<AtomicU64>,
    running: Arc<AtomicU64>,
    completed_total: Arc<AtomicU64>,
    failed_total: Arc<AtomicU64>,
    capacity: usize,
    cancellations: Arc<DashMap<Uuid, CancellationToken>>,
    worker_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    config: QueueConfig,
    store: Arc<dyn OrchestratorStore>,
}

impl TaskQueue {
    /// Starts the queue's background worker loop.
    pub fn start(config: QueueConfig, store: Arc<dyn OrchestratorStore>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let queue = Arc::new(Self {
            sender,
            shutdown_tx,
            accepting: Arc::new(AtomicBool::new(true)),
            pending: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicU64::new(0)),
            completed_total: Arc::new(AtomicU64::new(0)),
            failed_total: Arc::new(AtomicU64::new(0)),
            capacity: config.capacity,
            cancellations: Arc::new(DashMap::new()),
            worker_handle: std::sync::Mutex::new(None),
            config: config.clone(),
            store: store.clone(),
        });

        let handle = {
            let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
            let pending = queue.pending.clone();
            let running = queue.running.clone();
            let cancellations = queue.cancellations.clone();
            let store = store.clone();
            let mut shutdown_rx = shutdown_rx;
            let mut receiver = receiver;

            tokio::spawn(async move {
                loop {
                    let envelope = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                receiver.close();
                            }
                            match receiver.try_recv() {
                                Ok(e) => Some(e),
                                Err(_) => break,
                            }
                        }
                        maybe = receiver.recv() => maybe,
                    };

                    let Some(envelope) = envelope else { break };

                    pending.fetch_sub(1, Ordering::SeqCst);
                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                    running.fetch_add(1, Ordering::SeqCst);

                    let token = CancellationToken::new();
                    cancellations.insert(envelope.task_id, token.clone());

                    let task_record = TaskRecord {
                        task_id: envelope.task_id,
                        application_name: envelope.application_name.clone(),
                        workflow_name: envelope.workflow_name.clone(),
                        state: TaskState::Running,
                        created_at: chrono::Utc::now(),
                        started_at: Some(chrono::Utc::now()),
                        completed_at: None,
                        error: None,
                    };
                    if let Err(e) = store.save_task(&task_record).await {
                        warn!(task_id = %envelope.task_id, error = %e, "failed to record task start");
                    }

                    let running = running.clone();
                    let completed_total = completed_total.clone();
                    let failed_total = failed_total.clone();
                    let cancellations = cancellations.clone();
                    let store = store.clone();
                    let cancel_check = token.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        let task_id = envelope.task_id;
                        debug!(%task_id, "task running");
                        let result = (envelope.work)(token).await;
                        cancellations.remove(&task_id);

                        let state = if cancel_check.is_cancelled() {
                            TaskState::Cancelled
                        } else {
                            match &result {
                                Ok(()) => TaskState::Completed,
                                Err(_) => TaskState::Failed,
                            }
                        };
                        match state {
                            TaskState::Failed => {
                                failed_total.fetch_add(1, Ordering::SeqCst);
                            }
                            TaskState::Completed => {
                                completed_total.fetch_add(1, Ordering::SeqCst);
                            }
                            _ => {}
                        }
                        if let Err(e) = &result {
                            error!(%task_id, error = %e, "task failed");
                        }

                        let record = TaskRecord {
                            task_id,
                            application_name: envelope.application_name,
                            workflow_name: envelope.workflow_name,
                            state,
                            created_at: chrono::Utc::now(),
                            started_at: Some(chrono::Utc::now()),
                            completed_at: Some(chrono::Utc::now()),
                            error: result.err(),
                        };
                        if let Err(e) = store.save_task(&record).await {
                            warn!(%task_id, error = %e, "failed to record task completion");
                        }

                        running.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                debug!("queue worker loop exited");
            })
        };

        *queue.worker_handle.lock().unwrap() = Some(handle);
        queue
    }

    /// Non-blocking submission; fails immediately if the queue is full
    /// or shutting down rather than waiting for space. Either way, a
    /// task record is persisted synchronously before returning: `Pending`
    /// on acceptance, `Failed` with reason "queue backpressure" if the
    /// bounded channel is full.
    pub async fn submit(
        &self,
        application_name: impl Into<String>,
        workflow_name: impl Into<String>,
        work: BoxedWork,
    ) -> Result<Uuid, QueueError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let task_id = Uuid::now_v7();
        let application_name = application_name.into();
        let workflow_name = workflow_name.into();
        let envelope = Envelope {
            task_id,
            application_name: application_name.clone(),
            workflow_name: workflow_name.clone(),
            work,
        };

        match self.sender.try_send(envelope) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                let record = TaskRecord {
                    task_id,
                    application_name,
                    workflow_name,
                    state: TaskState::Pending,
                    created_at: chrono::Utc::now(),
                    started_at: None,
                    completed_at: None,
                    error: None,
                };
                if let Err(e) = self.store.save_task(&record).await {
                    warn!(%task_id, error = %e, "failed to record task submission");
                }
                Ok(task_id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let record = TaskRecord {
                    task_id,
                    application_name,
                    workflow_name,
                    state: TaskState::Failed,
                    created_at: chrono::Utc::now(),
                    started_at: None,
                    completed_at: Some(chrono::Utc::now()),
                    error: Some("queue backpressure".to_string()),
                };
                if let Err(e) = self.store.save_task(&record).await {
                    warn!(%task_id, error = %e, "failed to record queue backpressure");
                }
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::ShuttingDown),
        }
    }

    /// Cooperative cancellation: signals the running task's token if
    /// it is currently executing. A no-op if it already finished.
    pub fn cancel_task(&self, task_id: Uuid) -> Result<(), QueueError> {
        match self.cancellations.get(&task_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(QueueError::TaskNotFound(task_id)),
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.pending.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            completed_total: self.completed_total.load(Ordering::SeqCst),
            failed_total: self.failed_total.load(Ordering::SeqCst),
            workers: self.config.max_concurrency as u64,
            capacity: self.capacity as u64,
        }
    }

    /// Two-phase graceful shutdown: stop accepting new work, then wait
    /// for in-flight tasks to drain, bounded by `shutdown_timeout`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        info!("queue shutdown requested");
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.running.load(Ordering::SeqCst) == 0 && self.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("queue shutdown timed out with tasks still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(handle) = self.worker_handle.lock().unwrap().take() {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryOrchestratorStore;

    fn noop_work() -> BoxedWork {
        Box::new(|_token| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn submit_and_drain_one_task() {
        let store = Arc::new(InMemoryOrchestratorStore::new());
        let queue = TaskQueue::start(QueueConfig::default(), store.clone());
        let task_id = queue.submit("app1", "deploy-app", noop_work()).await.unwrap();
        assert_ne!(task_id, Uuid::nil());

        let submitted = store.get_task(task_id).await.unwrap();
        assert!(matches!(submitted.state, TaskState::Pending | TaskState::Running | TaskState::Completed));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = queue.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.completed_total, 1);

        let completed = store.get_task(task_id).await.unwrap();
        assert_eq!(completed.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn scenario_s5_queue_full_returns_immediately() {
        let store = Arc::new(InMemoryOrchestratorStore::new());
        let config = QueueConfig {
            capacity: 1,
            max_concurrency: 1,
            shutdown_timeout: Duration::from_secs(5),
        };
        let queue = TaskQueue::start(config, store.clone());

        let blocking = Box::new(|_token: CancellationToken| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(())
            }) as Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        });
        queue.submit("app1", "w", blocking).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Worker slot occupied; a second submission should overflow the
        // bounded channel immediately rather than block.
        for _ in 0..4 {
            match queue.submit("app1", "w", noop_work()).await {
                Ok(_) => continue,
                Err(QueueError::Full) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        let rejected = store
            .list_tasks("app1")
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.state == TaskState::Failed && t.error.as_deref() == Some("queue backpressure"));
        assert!(rejected.is_some(), "expected a persisted Failed/queue-backpressure task record");
    }

    #[tokio::test]
    async fn cancel_unknown_task_errors() {
        let store = Arc::new(InMemoryOrchestratorStore::new());
        let queue = TaskQueue::start(QueueConfig::default(), store);
        let result = queue.cancel_task(Uuid::now_v7());
        assert!(matches!(result, Err(QueueError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_work() {
        let store = Arc::new(InMemoryOrchestratorStore::new());
        let queue = TaskQueue::start(QueueConfig::default(), store);
        queue.submit("app1", "w", noop_work()).await.unwrap();
        queue.shutdown().await.unwrap();
        assert_eq!(queue.stats().running, 0);
    }

    #[tokio::test]
    async fn scenario_s6_cancelled_task_persists_as_cancelled() {
        let store = Arc::new(InMemoryOrchestratorStore::new());
        let queue = TaskQueue::start(QueueConfig::default(), store.clone());

        let work = Box::new(|token: CancellationToken| {
            Box::pin(async move {
                token.cancelled().await;
                Ok(())
            }) as Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        });
        let task_id = queue.submit("app1", "w", work).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.cancel_task(task_id).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = store.get_task(task_id).await.unwrap();
        assert_eq!(record.state, TaskState::Cancelled);
    }
}
