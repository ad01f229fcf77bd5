//! NATS JetStream bindings for the store interfaces.
//!
//! Maps the JetStream key-value bucket, object store and durable pull
//! consumer onto the crate's capability traits. Broker errors are
//! classified into [`StoreError`] by their reported text, which keeps
//! the transient allow-list (timeouts, leadership changes) in one place.

use std::time::Duration;

use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncReadExt;

use super::{BlobInfo, BlobStore, KvStore, QueueMessage, StoreError, TaskQueue};
use crate::config::ConnectionConfig;

/// Connects to the broker with the configured credentials.
pub async fn connect(config: &ConnectionConfig) -> Result<async_nats::Client, StoreError> {
    let mut options = async_nats::ConnectOptions::new();
    if !config.user.is_empty() {
        options = options.user_and_password(config.user.clone(), config.password.clone());
    }
    options
        .connect(&config.nats_url)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to connect to {}: {e}", config.nats_url)))
}

/// Classifies a broker error by its reported text.
fn classify(message: impl ToString) -> StoreError {
    let message = message.to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        StoreError::Timeout
    } else if lower.contains("leadership") {
        StoreError::LeadershipChanged
    } else {
        StoreError::Backend(message)
    }
}

/// JetStream object store bucket.
pub struct NatsBlobStore {
    store: jetstream::object_store::ObjectStore,
}

impl NatsBlobStore {
    pub async fn open(context: &jetstream::Context, bucket: &str) -> Result<Self, StoreError> {
        let store = context
            .get_object_store(bucket)
            .await
            .map_err(|e| StoreError::Backend(format!("object store bucket '{bucket}': {e}")))?;
        Ok(Self { store })
    }
}

#[async_trait]
impl BlobStore for NatsBlobStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<BlobInfo, StoreError> {
        let info = self
            .store
            .put(name, &mut data.as_ref())
            .await
            .map_err(classify)?;
        Ok(BlobInfo {
            name: info.name,
            size: info.size,
        })
    }

    async fn get(&self, id: &str) -> Result<Bytes, StoreError> {
        let mut object = self.store.get(id).await.map_err(|e| {
            let message = e.to_string();
            if message.to_ascii_lowercase().contains("not found") {
                StoreError::NotFound(id.to_string())
            } else {
                classify(message)
            }
        })?;
        let mut data = Vec::new();
        object
            .read_to_end(&mut data)
            .await
            .map_err(|e| StoreError::Backend(format!("reading object '{id}': {e}")))?;
        Ok(data.into())
    }
}

/// JetStream key-value bucket.
pub struct NatsKvStore {
    store: jetstream::kv::Store,
}

impl NatsKvStore {
    pub async fn open(context: &jetstream::Context, bucket: &str) -> Result<Self, StoreError> {
        let store = context
            .get_key_value(bucket)
            .await
            .map_err(|e| StoreError::Backend(format!("key-value bucket '{bucket}': {e}")))?;
        Ok(Self { store })
    }
}

#[async_trait]
impl KvStore for NatsKvStore {
    async fn get(&self, key: &str) -> Result<(Bytes, u64), StoreError> {
        match self.store.entry(key).await {
            Ok(Some(entry)) => Ok((entry.value, entry.revision)),
            Ok(None) => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(classify(e)),
        }
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64, StoreError> {
        self.store.create(key, value).await.map_err(|e| {
            let message = e.to_string();
            if message.to_ascii_lowercase().contains("already exists") {
                StoreError::KeyExists(key.to_string())
            } else {
                classify(message)
            }
        })
    }

    async fn update(
        &self,
        key: &str,
        value: Bytes,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        self.store
            .update(key, value, expected_revision)
            .await
            .map_err(|e| {
                let message = e.to_string();
                // the server rejects a conditional write whose revision
                // moved with a "wrong last sequence" error
                if message.to_ascii_lowercase().contains("wrong last sequence") {
                    StoreError::RevisionMismatch {
                        key: key.to_string(),
                        expected: expected_revision,
                    }
                } else {
                    classify(message)
                }
            })
    }
}

/// JetStream publisher plus durable pull consumer, shared by all worker
/// loops.
pub struct NatsQueue {
    context: jetstream::Context,
    consumer: jetstream::consumer::PullConsumer,
}

impl NatsQueue {
    /// Binds to an existing durable consumer on the stream. Topology is
    /// provisioned out of band.
    pub async fn bind(
        context: &jetstream::Context,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<Self, StoreError> {
        let stream = context
            .get_stream(stream_name)
            .await
            .map_err(|e| StoreError::Backend(format!("stream '{stream_name}': {e}")))?;
        let consumer = stream
            .get_consumer::<jetstream::consumer::pull::Config>(consumer_name)
            .await
            .map_err(|e| StoreError::Backend(format!("consumer '{consumer_name}': {e}")))?;
        Ok(Self {
            context: context.clone(),
            consumer,
        })
    }
}

#[async_trait]
impl TaskQueue for NatsQueue {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), StoreError> {
        let ack = self
            .context
            .publish(subject.to_string(), payload)
            .await
            .map_err(classify)?;
        ack.await.map_err(classify)?;
        Ok(())
    }

    async fn fetch(
        &self,
        max: usize,
        expires: Duration,
    ) -> Result<Vec<Box<dyn QueueMessage>>, StoreError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(expires)
            .messages()
            .await
            .map_err(classify)?;

        let mut batch: Vec<Box<dyn QueueMessage>> = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(classify)?;
            batch.push(Box::new(NatsMessage { message }));
        }
        Ok(batch)
    }
}

struct NatsMessage {
    message: jetstream::Message,
}

#[async_trait]
impl QueueMessage for NatsMessage {
    fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    async fn ack(&self) -> Result<(), StoreError> {
        self.message.ack().await.map_err(classify)
    }

    async fn nack(&self) -> Result<(), StoreError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(classify)
    }

    async fn mark_in_progress(&self) -> Result<(), StoreError> {
        self.message
            .ack_with(jetstream::AckKind::Progress)
            .await
            .map_err(classify)
    }
}
