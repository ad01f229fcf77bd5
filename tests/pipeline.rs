//! End-to-end pipeline tests over the in-memory stores.
//!
//! A real shell script plays the tool: the submitter uploads an input,
//! publishes a task, and a running worker pool must drive the status
//! record to Finished with the expected artifacts in the result store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use execforge::message::{OutputSlot, RunStatus, TaskMsg};
use execforge::retry::RetryPolicy;
use execforge::runner::{RunnerConfig, ToolRunner};
use execforge::store::memory::{MemoryBlobStore, MemoryKvStore, MemoryQueue};
use execforge::store::typed::TypedKv;
use execforge::submit::Submitter;
use execforge::worker::{WorkerPool, WorkerPoolConfig};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
        multiplier: 2.0,
        max_attempts: 3,
    }
}

fn install_tool(dir: &Path, name: &str, script: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct Harness {
    submitter: Submitter,
    pool: WorkerPool,
    _tools: TempDir,
    _work: TempDir,
}

fn harness(tool_script: &str) -> Harness {
    let tools = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    install_tool(tools.path(), "copytool", tool_script);

    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let source = Arc::new(MemoryBlobStore::default());
    let results = Arc::new(MemoryBlobStore::default());
    let statuses = Arc::new(MemoryKvStore::default());

    let submitter = Submitter::new(
        queue.clone(),
        source.clone(),
        results.clone(),
        statuses.clone(),
        "tasks",
        fast_retry(),
    );

    let runner = Arc::new(ToolRunner::new(
        source,
        results,
        statuses.clone(),
        fast_retry(),
        RunnerConfig {
            tools_dir: tools.path().to_path_buf(),
            work_dir: work.path().to_path_buf(),
            inherit_env: vec!["PATH".to_string()],
        },
        None,
    ));

    let pool = WorkerPool::new(
        WorkerPoolConfig {
            workers: 2,
            fetch_expires: Duration::from_millis(50),
        },
        queue,
        runner,
        TypedKv::new(statuses, fast_retry()),
        fast_retry(),
    );

    Harness {
        submitter,
        pool,
        _tools: tools,
        _work: work,
    }
}

fn sample_task(tool: &str) -> TaskMsg {
    TaskMsg {
        input_files: Vec::new(),
        output_file_extensions: vec![String::new(), ".log".to_string()],
        tool: tool.to_string(),
        arguments: vec![
            "<input-file#0>".to_string(),
            "<output-file#0>".to_string(),
            "<output-file#1>".to_string(),
        ],
        environment: Vec::new(),
        notification_url: None,
        kv_id: String::new(),
    }
}

async fn await_finished(submitter: &Submitter, kv_id: &str) -> execforge::message::RunResult {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = submitter.status(kv_id).await.unwrap();
            if status.status == RunStatus::Finished {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task did not finish in time")
}

#[tokio::test]
async fn test_full_pipeline_produces_stored_outputs() {
    let mut h = harness(
        "#!/bin/sh\n\
         cat \"$1\" > \"$2\"\n\
         echo run log > \"$3\"\n\
         printf 'compiled ok'\n",
    );

    let input = h
        .submitter
        .upload_input(Bytes::from_static(b"int main() { return 0; }"), ".cpp")
        .await
        .unwrap();
    let mut task = sample_task("copytool");
    task.input_files = vec![input];

    let kv_id = h.submitter.submit(task).await.unwrap();
    h.pool.start();

    let status = await_finished(&h.submitter, &kv_id).await;
    assert!(!status.tool_result_id.is_empty());

    let result = h.submitter.tool_result(&status.tool_result_id).await.unwrap();
    assert_eq!(result.tool_output, "compiled ok");
    assert_eq!(result.output_files.len(), 2);

    let copy_id = result.output_files[0].id().expect("first output stored");
    let log_id = result.output_files[1].id().expect("second output stored");
    assert_eq!(
        h.submitter.artifact(copy_id).await.unwrap(),
        Bytes::from_static(b"int main() { return 0; }")
    );
    assert_eq!(
        h.submitter.artifact(log_id).await.unwrap(),
        Bytes::from_static(b"run log\n")
    );

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_tool_without_outputs_still_finishes() {
    let mut h = harness("#!/bin/sh\nprintf 'nothing to do'\n");

    let mut task = sample_task("copytool");
    task.arguments = Vec::new();
    task.input_files = Vec::new();

    let kv_id = h.submitter.submit(task).await.unwrap();
    h.pool.start();

    let status = await_finished(&h.submitter, &kv_id).await;
    let result = h.submitter.tool_result(&status.tool_result_id).await.unwrap();
    assert_eq!(result.tool_output, "nothing to do");
    assert_eq!(
        result.output_files,
        vec![OutputSlot::Missing, OutputSlot::Missing]
    );

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_task_environment_reaches_the_tool() {
    let mut h = harness("#!/bin/sh\nprintf '%s' \"$GREETING\"\n");

    let mut task = sample_task("copytool");
    task.arguments = Vec::new();
    task.output_file_extensions = Vec::new();
    task.environment = vec!["GREETING=hello from the task".to_string()];

    let kv_id = h.submitter.submit(task).await.unwrap();
    h.pool.start();

    let status = await_finished(&h.submitter, &kv_id).await;
    let result = h.submitter.tool_result(&status.tool_result_id).await.unwrap();
    assert_eq!(result.tool_output, "hello from the task");
    assert!(result.output_files.is_empty());

    h.pool.shutdown().await;
}
