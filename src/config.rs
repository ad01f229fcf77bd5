//! Worker configuration.
//!
//! Loaded from a JSON file whose string values may reference process
//! environment variables with a `$NAME` prefix; references are resolved
//! at load time (an unset variable resolves to the empty string).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::WorkerError;

fn default_workers() -> usize {
    4
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_inherit_env() -> Vec<String> {
    vec!["PATH".to_string()]
}

fn default_fetch_expires_secs() -> u64 {
    5
}

fn default_ack_wait_secs() -> u64 {
    300
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionConfig {
    pub nats_url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// Durable pull-consumer binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConsumerConfig {
    pub stream_name: String,
    /// Durable consumer name shared by all worker loops.
    pub name: String,
    /// Window after which an unacknowledged message is redelivered.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

/// Top-level worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    /// Directory tool names are resolved under.
    pub path_to_tools: PathBuf,
    /// Directory for temporary input/output files.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Host environment variables passed through to tools.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: Vec<String>,
    pub connection_config: ConnectionConfig,
    pub consumer_config: ConsumerConfig,
    pub source_object_store_bucket: String,
    pub result_object_store_bucket: String,
    pub key_value_bucket: String,
    /// Subject tasks are published on.
    pub tasks_subject: String,
    #[serde(default = "default_fetch_expires_secs")]
    pub fetch_expires_secs: u64,
}

impl WorkerConfig {
    /// Loads the configuration file and resolves `$NAME` references.
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorkerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<Self, WorkerError> {
        let mut value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| WorkerError::Config(format!("invalid config JSON: {e}")))?;
        resolve_env_refs(&mut value);
        serde_json::from_value(value)
            .map_err(|e| WorkerError::Config(format!("invalid config: {e}")))
    }
}

fn resolve_env_refs(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(name) = s.strip_prefix('$') {
                *s = std::env::var(name).unwrap_or_default();
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(resolve_env_refs),
        serde_json::Value::Object(map) => map.values_mut().for_each(resolve_env_refs),
        _ => {}
    }
}
