//! Worker pool consuming tasks from the durable queue.
//!
//! A fixed number of consumption loops share one pull-consumer handle
//! and the store clients. Each iteration fetches a batch of exactly one
//! message, flips the status record to Processing as a tracked
//! best-effort side task, and drives the runner. Ten consecutive fetch
//! failures are fatal for a loop and tear the pool down so an operator
//! can investigate broker health.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::message::{RunResult, RunStatus, TaskMsg};
use crate::retry::{with_retry, RetryPolicy};
use crate::runner::ToolRunner;
use crate::store::typed::TypedKv;
use crate::store::{StoreError, TaskQueue};

/// Consecutive fetch failures after which a loop gives up.
const FATAL_FETCH_ERRORS: u32 = 10;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of consumption loops to spawn.
    pub workers: usize,
    /// Bounded wait for each queue fetch; expiry is not a failure.
    pub fetch_expires: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            fetch_expires: Duration::from_secs(5),
        }
    }
}

/// Pool of consumption loops over a shared queue consumer.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn TaskQueue>,
    runner: Arc<ToolRunner>,
    status: TypedKv<RunResult>,
    retry: RetryPolicy,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<Result<(), WorkerError>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn TaskQueue>,
        runner: Arc<ToolRunner>,
        status: TypedKv<RunResult>,
        retry: RetryPolicy,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            queue,
            runner,
            status,
            retry,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Spawns all consumption loops.
    pub fn start(&mut self) {
        for i in 0..self.config.workers {
            let consume_loop = ConsumeLoop {
                id: format!("worker-{i}"),
                queue: Arc::clone(&self.queue),
                runner: Arc::clone(&self.runner),
                status: self.status.clone(),
                retry: self.retry.clone(),
                fetch_expires: self.config.fetch_expires,
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            self.handles.push(tokio::spawn(consume_loop.run()));
        }
        info!(workers = self.config.workers, "worker pool started");
    }

    /// Waits until every loop has exited. Returns the first fatal loop
    /// error after signalling the remaining loops to stop.
    pub async fn wait(&mut self) -> Result<(), WorkerError> {
        while !self.handles.is_empty() {
            let (result, _, rest) =
                futures::future::select_all(self.handles.drain(..)).await;
            self.handles = rest;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = self.shutdown_tx.send(());
                    self.drain().await;
                    return Err(e);
                }
                Err(join_err) => {
                    let _ = self.shutdown_tx.send(());
                    self.drain().await;
                    return Err(WorkerError::LoopPanicked(join_err.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Signals all loops to stop and waits for them to finish their
    /// current task.
    pub async fn shutdown(&mut self) {
        info!("initiating worker pool shutdown");
        let _ = self.shutdown_tx.send(());
        self.drain().await;
        info!("worker pool shutdown complete");
    }

    async fn drain(&mut self) {
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "worker loop exited with error"),
                Err(e) => error!(error = %e, "worker loop panicked during shutdown"),
            }
        }
    }
}

/// Best-effort transition to Processing, guarded so it can never clobber
/// a concurrent Finished write.
pub async fn mark_processing(
    status: &TypedKv<RunResult>,
    key: &str,
) -> Result<(), StoreError> {
    status
        .conditional_update(
            key,
            |r| r.status != RunStatus::Enqueued,
            |r| r.status = RunStatus::Processing,
        )
        .await
        .map(|_| ())
}

struct ConsumeLoop {
    id: String,
    queue: Arc<dyn TaskQueue>,
    runner: Arc<ToolRunner>,
    status: TypedKv<RunResult>,
    retry: RetryPolicy,
    fetch_expires: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConsumeLoop {
    async fn run(mut self) -> Result<(), WorkerError> {
        info!(worker_id = %self.id, "worker started");
        let mut consecutive_errors = 0u32;
        // tracked so in-flight Processing updates are drained on exit
        let mut processing_updates = JoinSet::new();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
            while processing_updates.try_join_next().is_some() {}

            let batch = with_retry(&self.retry, StoreError::is_transient, || {
                self.queue.fetch(1, self.fetch_expires)
            })
            .await
            .map_err(StoreError::from);

            let batch = match batch {
                Ok(batch) => {
                    consecutive_errors = 0;
                    batch
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        consecutive_errors,
                        "queue fetch failed"
                    );
                    if consecutive_errors >= FATAL_FETCH_ERRORS {
                        error!(
                            worker_id = %self.id,
                            "{FATAL_FETCH_ERRORS} fetch failures in a row, giving up"
                        );
                        while processing_updates.join_next().await.is_some() {}
                        return Err(WorkerError::FetchThresholdExceeded {
                            count: consecutive_errors,
                        });
                    }
                    continue;
                }
            };

            let Some(message) = batch.into_iter().next() else {
                debug!(worker_id = %self.id, "no tasks available");
                continue;
            };

            let msg: TaskMsg = match serde_json::from_slice(message.payload()) {
                Ok(msg) => msg,
                Err(e) => {
                    // left unacknowledged; the broker redelivers it
                    warn!(worker_id = %self.id, error = %e, "malformed task payload");
                    continue;
                }
            };

            // best-effort visibility of in-progress state; the pipeline
            // does not wait for it and correctness rests on the CAS guard
            {
                let status = self.status.clone();
                let key = msg.kv_id.clone();
                let worker_id = self.id.clone();
                processing_updates.spawn(async move {
                    if let Err(e) = mark_processing(&status, &key).await {
                        warn!(worker_id, kv_id = %key, error = %e, "failed to mark task processing");
                    }
                });
            }

            info!(worker_id = %self.id, kv_id = %msg.kv_id, tool = %msg.tool, "processing task");
            if let Err(e) = self.runner.process(msg, message.as_ref()).await {
                warn!(
                    worker_id = %self.id,
                    error = %e,
                    "task aborted, message left for redelivery"
                );
            }
        }

        while processing_updates.join_next().await.is_some() {}
        info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }
}
