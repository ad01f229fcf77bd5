//! Task message model and placeholder substitution.
//!
//! A `TaskMsg` travels over the durable queue and references its inputs
//! in the blob store and its status record in the key-value store.
//! Arguments and environment entries may embed positional placeholders
//! (`<input-file#N>` / `<output-file#N>`) that the worker replaces with
//! real temporary paths before invoking the tool. Placeholders are
//! purposely verbose to avoid colliding with real arguments.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A submitted source file stored in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InputFile {
    /// Id of the uploaded blob holding the file content.
    pub object_store_id: String,
    /// File extension (including the dot) the temporary copy must carry.
    #[serde(default)]
    pub extension: String,
}

/// A task as published on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskMsg {
    pub input_files: Vec<InputFile>,
    /// One entry (possibly empty) per output file the tool is expected
    /// to produce.
    pub output_file_extensions: Vec<String>,
    /// Tool name, resolved under the configured tools directory.
    pub tool: String,
    pub arguments: Vec<String>,
    /// "KEY=VALUE" entries appended to the allow-listed host environment.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Webhook invoked (best effort) when the task finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_url: Option<String>,
    /// Correlation key of the task's `RunResult` in the status store.
    #[serde(rename = "key-value-id")]
    pub kv_id: String,
}

fn input_placeholder(index: usize) -> String {
    format!("<input-file#{index}>")
}

fn output_placeholder(index: usize) -> String {
    format!("<output-file#{index}>")
}

impl TaskMsg {
    /// Replaces every placeholder occurrence in `arguments` and
    /// `environment` with the corresponding real path.
    ///
    /// # Panics
    ///
    /// Panics if the number of supplied paths does not match the number
    /// of declared input files or output extensions. A mismatch means
    /// the message is structurally invalid and should have been
    /// rejected at submission time, so the process aborts loudly
    /// instead of running a tool against the wrong files.
    pub fn substitute_placeholders(&mut self, input_paths: &[String], output_paths: &[String]) {
        assert_eq!(
            input_paths.len(),
            self.input_files.len(),
            "input path count does not match declared input files"
        );
        assert_eq!(
            output_paths.len(),
            self.output_file_extensions.len(),
            "output path count does not match declared output extensions"
        );
        for (index, path) in input_paths.iter().enumerate() {
            self.replace_all(&input_placeholder(index), path);
        }
        for (index, path) in output_paths.iter().enumerate() {
            self.replace_all(&output_placeholder(index), path);
        }
    }

    fn replace_all(&mut self, from: &str, to: &str) {
        for argument in &mut self.arguments {
            *argument = argument.replace(from, to);
        }
        for entry in &mut self.environment {
            *entry = entry.replace(from, to);
        }
    }

    /// Composes the child process environment: the allow-listed subset
    /// of the host environment followed by the task's own entries.
    ///
    /// Entries without a `=` separator carry no value and are skipped
    /// with a warning.
    pub fn child_env(&self, inherit: &[String]) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(inherit.len() + self.environment.len());
        for key in inherit {
            if let Ok(value) = std::env::var(key) {
                env.push((key.clone(), value));
            }
        }
        for entry in &self.environment {
            match entry.split_once('=') {
                Some((key, value)) => env.push((key.to_string(), value.to_string())),
                None => warn!(entry, "skipping environment entry without '='"),
            }
        }
        env
    }
}

/// Lifecycle of a task's status record. Never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Enqueued,
    Processing,
    Finished,
}

/// The single mutable record per task, stored under the correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    /// Id of the `ToolResult` blob; only meaningful once `Finished`.
    #[serde(rename = "result-id", default, skip_serializing_if = "String::is_empty")]
    pub tool_result_id: String,
}

impl RunResult {
    /// The state a submitter creates atomically before publishing.
    pub fn enqueued() -> Self {
        Self {
            status: RunStatus::Enqueued,
            tool_result_id: String::new(),
        }
    }
}

/// Outcome of one declared output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputSlot {
    /// Uploaded under this blob id.
    Stored(String),
    /// The tool never created the file. Not an error.
    Missing,
    /// The file existed but could not be uploaded.
    Failed(String),
}

impl OutputSlot {
    /// Returns the blob id for a stored output.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Stored(id) => Some(id),
            Self::Missing | Self::Failed(_) => None,
        }
    }
}

/// Write-once record of a completed tool invocation, stored as a blob
/// and referenced by exactly one `RunResult`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ToolResult {
    /// Captured standard output of the tool.
    pub tool_output: String,
    /// One slot per declared output extension, in declared order.
    pub output_files: Vec<OutputSlot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_msg() -> TaskMsg {
        TaskMsg {
            input_files: vec![InputFile {
                object_store_id: "id1".to_string(),
                extension: ".cpp".to_string(),
            }],
            output_file_extensions: vec![String::new(), ".log".to_string()],
            tool: "clang_compile".to_string(),
            arguments: vec![
                "<input-file#0>".to_string(),
                "<output-file#0>".to_string(),
                "<output-file#1>".to_string(),
            ],
            environment: Vec::new(),
            notification_url: None,
            kv_id: "key".to_string(),
        }
    }

    #[test]
    fn test_substitute_placeholders() {
        let mut msg = sample_msg();
        msg.substitute_placeholders(
            &["/tmp/a.cpp".to_string()],
            &["/tmp/b".to_string(), "/tmp/b.log".to_string()],
        );
        assert_eq!(msg.arguments, vec!["/tmp/a.cpp", "/tmp/b", "/tmp/b.log"]);
    }

    #[test]
    fn test_substitute_inside_larger_token_and_env() {
        let mut msg = sample_msg();
        msg.arguments = vec!["--input=<input-file#0>".to_string()];
        msg.environment = vec!["OUT=<output-file#1>:<output-file#1>".to_string()];
        msg.substitute_placeholders(
            &["/tmp/a.cpp".to_string()],
            &["/tmp/b".to_string(), "/tmp/b.log".to_string()],
        );
        assert_eq!(msg.arguments, vec!["--input=/tmp/a.cpp"]);
        assert_eq!(msg.environment, vec!["OUT=/tmp/b.log:/tmp/b.log"]);
    }

    #[test]
    #[should_panic(expected = "input path count")]
    fn test_input_count_mismatch_panics() {
        let mut msg = sample_msg();
        msg.substitute_placeholders(&[], &["/tmp/b".to_string(), "/tmp/b.log".to_string()]);
    }

    #[test]
    #[should_panic(expected = "output path count")]
    fn test_output_count_mismatch_panics() {
        let mut msg = sample_msg();
        msg.substitute_placeholders(&["/tmp/a.cpp".to_string()], &["/tmp/b".to_string()]);
    }

    #[test]
    fn test_child_env_allow_list_and_task_entries() {
        std::env::set_var("EXECFORGE_TEST_PATHLIKE", "/usr/bin");
        let mut msg = sample_msg();
        msg.environment = vec!["CFLAGS=-O2".to_string(), "BROKEN".to_string()];
        let env = msg.child_env(&["EXECFORGE_TEST_PATHLIKE".to_string()]);
        assert_eq!(
            env,
            vec![
                ("EXECFORGE_TEST_PATHLIKE".to_string(), "/usr/bin".to_string()),
                ("CFLAGS".to_string(), "-O2".to_string()),
            ]
        );
    }

    #[test]
    fn test_task_msg_wire_shape() {
        let msg = sample_msg();
        let value = serde_json::to_value(&msg).expect("serialize");
        assert!(value.get("input-files").is_some());
        assert!(value.get("output-file-extensions").is_some());
        assert_eq!(value["key-value-id"], "key");
        assert_eq!(value["input-files"][0]["object-store-id"], "id1");
        // notification-url is omitted when unset
        assert!(value.get("notification-url").is_none());
    }

    #[test]
    fn test_run_result_wire_shape() {
        let result = RunResult {
            status: RunStatus::Finished,
            tool_result_id: "abc".to_string(),
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["status"], "finished");
        assert_eq!(value["result-id"], "abc");

        let enqueued = serde_json::to_value(RunResult::enqueued()).expect("serialize");
        assert_eq!(enqueued["status"], "enqueued");
        assert!(enqueued.get("result-id").is_none());
    }

    #[test]
    fn test_output_slot_wire_shape() {
        let result = ToolResult {
            tool_output: "done".to_string(),
            output_files: vec![
                OutputSlot::Stored("id0".to_string()),
                OutputSlot::Missing,
                OutputSlot::Failed("timeout".to_string()),
            ],
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["tool-output"], "done");
        assert_eq!(value["output-files"][0]["stored"], "id0");
        assert_eq!(value["output-files"][1], "missing");
        assert_eq!(value["output-files"][2]["failed"], "timeout");

        let back: ToolResult = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, result);
    }
}
