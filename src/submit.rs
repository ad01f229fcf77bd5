//! Submitter-side helpers.
//!
//! Uploads input files and enqueues tasks while enforcing the ordering
//! invariant the workers rely on: a task's status record exists (as
//! Enqueued) before its message is ever published, so a task is never
//! observable in the queue without a status entry.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::WorkerError;
use crate::message::{InputFile, RunResult, TaskMsg, ToolResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::typed::{RobustBlobs, TypedKv};
use crate::store::{random_id, BlobStore, KvStore, StoreError, TaskQueue};

/// Client-side handle for submitting tasks and polling their status.
pub struct Submitter {
    queue: Arc<dyn TaskQueue>,
    source: RobustBlobs,
    results: RobustBlobs,
    status: TypedKv<RunResult>,
    subject: String,
    retry: RetryPolicy,
}

impl Submitter {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        source: Arc<dyn BlobStore>,
        results: Arc<dyn BlobStore>,
        status_store: Arc<dyn KvStore>,
        subject: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            source: RobustBlobs::new(source, retry.clone()),
            results: RobustBlobs::new(results, retry.clone()),
            status: TypedKv::new(status_store, retry.clone()),
            subject: subject.into(),
            retry,
        }
    }

    /// Uploads one input file and returns its task reference.
    pub async fn upload_input(
        &self,
        data: Bytes,
        extension: &str,
    ) -> Result<InputFile, StoreError> {
        let info = self.source.put_random(data).await?;
        Ok(InputFile {
            object_store_id: info.name,
            extension: extension.to_string(),
        })
    }

    /// Assigns a fresh correlation key, creates the Enqueued status
    /// record and only then publishes the task. Returns the key under
    /// which the task's status can be polled.
    pub async fn submit(&self, mut task: TaskMsg) -> Result<String, WorkerError> {
        let kv_id = random_id();
        task.kv_id = kv_id.clone();

        self.status.create(&kv_id, &RunResult::enqueued()).await?;

        let payload = Bytes::from(serde_json::to_vec(&task).map_err(StoreError::from)?);
        with_retry(&self.retry, StoreError::is_transient, || {
            self.queue.publish(&self.subject, payload.clone())
        })
        .await
        .map_err(StoreError::from)?;

        Ok(kv_id)
    }

    /// Reads the current status record for a submitted task.
    pub async fn status(&self, kv_id: &str) -> Result<RunResult, StoreError> {
        Ok(self.status.get(kv_id).await?.0)
    }

    /// Fetches the `ToolResult` blob referenced by a finished task.
    pub async fn tool_result(&self, result_id: &str) -> Result<ToolResult, StoreError> {
        self.results.get_json(result_id).await
    }

    /// Downloads a produced artifact by its blob id.
    pub async fn artifact(&self, id: &str) -> Result<Bytes, StoreError> {
        self.results.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RunStatus;
    use crate::store::memory::{MemoryBlobStore, MemoryKvStore, MemoryQueue};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            multiplier: 1.0,
            max_attempts: 2,
        }
    }

    fn sample_task() -> TaskMsg {
        TaskMsg {
            input_files: Vec::new(),
            output_file_extensions: Vec::new(),
            tool: "noop".to_string(),
            arguments: Vec::new(),
            environment: Vec::new(),
            notification_url: None,
            kv_id: String::new(),
        }
    }

    #[tokio::test]
    async fn test_submit_creates_status_before_publish() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        let submitter = Submitter::new(
            Arc::new(queue.clone()),
            Arc::new(MemoryBlobStore::default()),
            Arc::new(MemoryBlobStore::default()),
            Arc::new(MemoryKvStore::default()),
            "tasks",
            fast_retry(),
        );

        let kv_id = submitter.submit(sample_task()).await.unwrap();

        // the published message carries the assigned correlation key
        assert_eq!(queue.pending(), 1);
        let batch = queue.fetch(1, Duration::from_millis(10)).await.unwrap();
        let msg: TaskMsg = serde_json::from_slice(batch[0].payload()).unwrap();
        assert_eq!(msg.kv_id, kv_id);

        // and the status record already exists as Enqueued
        let status = submitter.status(&kv_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Enqueued);
    }

    #[tokio::test]
    async fn test_upload_input_roundtrip() {
        let submitter = Submitter::new(
            Arc::new(MemoryQueue::new(Duration::from_secs(30))),
            Arc::new(MemoryBlobStore::default()),
            Arc::new(MemoryBlobStore::default()),
            Arc::new(MemoryKvStore::default()),
            "tasks",
            fast_retry(),
        );

        let input = submitter
            .upload_input(Bytes::from_static(b"int main() {}"), ".cpp")
            .await
            .unwrap();
        assert_eq!(input.extension, ".cpp");
        assert!(!input.object_store_id.is_empty());
    }
}
