//! Tool execution runner: the per-task pipeline.
//!
//! Given a dequeued task, the runner fetches the input blobs into
//! temporary files, allocates output paths, substitutes placeholders,
//! runs the tool as a subprocess, uploads the produced outputs
//! concurrently, persists the `ToolResult` blob, finalizes the status
//! record through the CAS loop and only then acknowledges the message.
//! Temporary files are released on every exit path; any failure before
//! the acknowledgement leaves the message eligible for redelivery.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::cleanup::Cleanup;
use crate::error::WorkerError;
use crate::message::{InputFile, OutputSlot, RunResult, RunStatus, TaskMsg, ToolResult};
use crate::notify::Notifier;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::typed::{RobustBlobs, TypedKv};
use crate::store::{random_id, BlobStore, KvStore, QueueMessage, StoreError};

/// File-system and environment settings for tool invocations.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory the task's `tool` name is resolved under.
    pub tools_dir: PathBuf,
    /// Directory temporary input/output files are placed in.
    pub work_dir: PathBuf,
    /// Host environment variables passed through to the tool.
    pub inherit_env: Vec<String>,
}

/// Executes one task end to end.
pub struct ToolRunner {
    source: RobustBlobs,
    results: RobustBlobs,
    status: TypedKv<RunResult>,
    retry: RetryPolicy,
    config: RunnerConfig,
    notifier: Option<Notifier>,
}

impl ToolRunner {
    pub fn new(
        source: Arc<dyn BlobStore>,
        results: Arc<dyn BlobStore>,
        status_store: Arc<dyn KvStore>,
        retry: RetryPolicy,
        config: RunnerConfig,
        notifier: Option<Notifier>,
    ) -> Self {
        Self {
            source: RobustBlobs::new(source, retry.clone()),
            results: RobustBlobs::new(results, retry.clone()),
            status: TypedKv::new(status_store, retry.clone()),
            retry,
            config,
            notifier,
        }
    }

    /// Runs the full per-task pipeline and acknowledges `delivery` on
    /// success. On error the message is left unacknowledged so the
    /// queue redelivers it after the ack-wait window.
    pub async fn process(
        &self,
        mut msg: TaskMsg,
        delivery: &dyn QueueMessage,
    ) -> Result<(), WorkerError> {
        let kv_id = msg.kv_id.clone();
        let mut cleanup = Cleanup::new();

        let input_paths = self.fetch_inputs(&msg.input_files).await?;
        for (index, path) in input_paths.iter().enumerate() {
            let path = path.clone();
            cleanup.add(move || match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), index, "input file was deleted by the tool");
                }
                Err(e) => {
                    warn!(path = %path.display(), index, error = %e, "failed to delete input file");
                }
            });
        }

        let output_paths = self.allocate_outputs(&msg.output_file_extensions);
        for (index, path) in output_paths.iter().enumerate() {
            let path = path.clone();
            cleanup.add(move || match std::fs::remove_file(&path) {
                // the tool may legitimately never have created this path
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), index, error = %e, "failed to delete output file");
                }
            });
        }

        let inputs: Vec<String> = input_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let outputs: Vec<String> = output_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        msg.substitute_placeholders(&inputs, &outputs);

        // long tool runs should not hit the ack-wait window mid-flight
        if let Err(e) = delivery.mark_in_progress().await {
            debug!(kv_id, error = %e, "failed to extend ack window");
        }

        let tool_output = self.invoke_tool(&msg).await;
        let output_files = self.upload_outputs(&output_paths).await;

        let tool_result = ToolResult {
            tool_output,
            output_files,
        };
        let result_blob = self.results.put_json(&tool_result).await?;

        // idempotent against redelivery: a second attempt observes
        // Finished and stops without writing
        let (final_state, _) = self
            .status
            .conditional_update(
                &kv_id,
                |r| r.status == RunStatus::Finished,
                |r| {
                    r.status = RunStatus::Finished;
                    r.tool_result_id = result_blob.name.clone();
                },
            )
            .await?;

        if let (Some(notifier), Some(url)) = (&self.notifier, &msg.notification_url) {
            notifier.notify(url, &kv_id, final_state.status).await;
        }

        with_retry(&self.retry, StoreError::is_transient, || delivery.ack())
            .await
            .map_err(StoreError::from)?;

        info!(
            kv_id,
            result_id = %final_state.tool_result_id,
            "task finished"
        );
        Ok(())
    }

    /// Downloads every input blob to a fresh temporary path carrying the
    /// declared extension. All-or-nothing: on failure, files already
    /// materialized in this step are removed before the error propagates.
    async fn fetch_inputs(&self, inputs: &[InputFile]) -> Result<Vec<PathBuf>, WorkerError> {
        let mut partial = Cleanup::new();
        let mut paths = Vec::with_capacity(inputs.len());
        for file in inputs {
            let path = self
                .config
                .work_dir
                .join(format!("{}{}", random_id(), file.extension));
            let data = self.source.get(&file.object_store_id).await?;
            tokio::fs::write(&path, &data)
                .await
                .map_err(|e| WorkerError::TempFile {
                    path: path.display().to_string(),
                    source: e,
                })?;
            let created = path.clone();
            partial.add(move || {
                if let Err(e) = std::fs::remove_file(&created) {
                    warn!(path = %created.display(), error = %e, "failed to delete partial input file");
                }
            });
            paths.push(path);
        }
        partial.discard();
        Ok(paths)
    }

    /// Names one temporary path per declared output extension. The paths
    /// are not created; the tool is expected to produce them.
    fn allocate_outputs(&self, extensions: &[String]) -> Vec<PathBuf> {
        extensions
            .iter()
            .map(|ext| self.config.work_dir.join(format!("{}{ext}", random_id())))
            .collect()
    }

    /// Launches the tool with the substituted arguments and composed
    /// environment, capturing standard output and standard error.
    ///
    /// A non-zero exit code, a spawn failure or a wait error is logged
    /// but never aborts the pipeline; the captured output (possibly
    /// empty) still flows into the normal result path.
    async fn invoke_tool(&self, msg: &TaskMsg) -> String {
        let program = self.config.tools_dir.join(&msg.tool);
        debug!(tool = %program.display(), args = ?msg.arguments, "invoking tool");

        let output = Command::new(&program)
            .args(&msg.arguments)
            .env_clear()
            .envs(msg.child_env(&self.config.inherit_env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) => {
                if !output.status.success() {
                    warn!(
                        tool = %msg.tool,
                        code = ?output.status.code(),
                        "tool exited with non-zero status"
                    );
                }
                if !output.stderr.is_empty() {
                    warn!(
                        tool = %msg.tool,
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "tool produced error output"
                    );
                }
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Err(e) => {
                error!(tool = %msg.tool, error = %e, "failed to run tool");
                String::new()
            }
        }
    }

    /// Uploads every allocated output concurrently and restores declared
    /// order. A path the tool never created yields [`OutputSlot::Missing`];
    /// an upload error yields [`OutputSlot::Failed`] for that slot only.
    async fn upload_outputs(&self, paths: &[PathBuf]) -> Vec<OutputSlot> {
        let uploads = paths.iter().map(|path| async move {
            match tokio::fs::read(path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => OutputSlot::Missing,
                Err(e) => OutputSlot::Failed(e.to_string()),
                Ok(data) => match self.results.put_random(Bytes::from(data)).await {
                    Ok(info) => OutputSlot::Stored(info.name),
                    Err(e) => OutputSlot::Failed(e.to_string()),
                },
            }
        });
        join_all(uploads).await
    }
}
