//! Crate-level error type for the worker pipeline.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the worker pipeline and its wiring.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("failed to materialize temporary file {path}: {source}")]
    TempFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{count} consecutive queue-fetch failures, aborting consumption loop")]
    FetchThresholdExceeded { count: u32 },

    #[error("worker task panicked: {0}")]
    LoopPanicked(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}
