//! Capability interfaces over the three external stores.
//!
//! The worker core is written against narrow traits for the durable
//! queue, the blob store and the key-value store. Production bindings
//! live in [`nats`] (JetStream); [`memory`] provides in-process
//! implementations for tests and local runs. Backend errors are mapped
//! into [`StoreError`] so transient-failure classification and the CAS
//! loop stay backend-agnostic.

pub mod memory;
pub mod nats;
pub mod typed;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::retry::RetryError;

/// Errors surfaced by store operations, normalized across backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The remote call timed out. Transient.
    #[error("remote operation timed out")]
    Timeout,

    /// Broker ownership/leadership changed mid-call. Transient.
    #[error("broker leadership changed")]
    LeadershipChanged,

    /// The requested object or key does not exist.
    #[error("'{0}' not found")]
    NotFound(String),

    /// Create refused because the key already exists.
    #[error("key '{0}' already exists")]
    KeyExists(String),

    /// Conditional write lost the race; the caller should re-read.
    #[error("revision conflict on key '{key}' (expected revision {expected})")]
    RevisionMismatch { key: String, expected: u64 },

    /// A transient error persisted through every retry attempt.
    #[error("still failing after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the error belongs to the fixed retry allow-list.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::LeadershipChanged)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<RetryError<StoreError>> for StoreError {
    fn from(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, last } => Self::RetryExhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

/// Generates a fresh random id for blobs, correlation keys and
/// temporary file names.
pub fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Metadata returned when a blob is stored.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub name: String,
    pub size: usize,
}

/// Write-once blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, name: &str, data: Bytes) -> Result<BlobInfo, StoreError>;

    /// Fails with [`StoreError::NotFound`] for unknown ids.
    async fn get(&self, id: &str) -> Result<Bytes, StoreError>;
}

/// Revision-tracked key-value storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the current value and its revision.
    async fn get(&self, key: &str) -> Result<(Bytes, u64), StoreError>;

    /// Fails with [`StoreError::KeyExists`] if the key is present.
    async fn create(&self, key: &str, value: Bytes) -> Result<u64, StoreError>;

    /// Conditional write; fails with [`StoreError::RevisionMismatch`]
    /// if the stored revision moved since the read.
    async fn update(&self, key: &str, value: Bytes, expected_revision: u64)
        -> Result<u64, StoreError>;
}

/// One delivered message from the durable queue.
#[async_trait]
pub trait QueueMessage: Send + Sync {
    fn payload(&self) -> &Bytes;

    /// Acknowledges successful processing; the message will not be
    /// redelivered.
    async fn ack(&self) -> Result<(), StoreError>;

    /// Returns the message for immediate redelivery.
    async fn nack(&self) -> Result<(), StoreError>;

    /// Extends the ack-wait window for a long-running task.
    async fn mark_in_progress(&self) -> Result<(), StoreError>;
}

/// At-least-once durable queue with an explicit pull consumer.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), StoreError>;

    /// Pulls up to `max` messages, waiting at most `expires`. An empty
    /// batch after the deadline is not an error.
    async fn fetch(
        &self,
        max: usize,
        expires: Duration,
    ) -> Result<Vec<Box<dyn QueueMessage>>, StoreError>;
}
