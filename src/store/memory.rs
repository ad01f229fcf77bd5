//! In-memory store implementations.
//!
//! Back the integration tests and local development runs with the same
//! semantics the worker relies on in production: revision-tracked
//! conditional writes, a distinguished not-found error, and at-least-once
//! queue delivery with an ack-wait redelivery window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{BlobInfo, BlobStore, KvStore, QueueMessage, StoreError, TaskQueue};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<BlobInfo, StoreError> {
        let size = data.len();
        lock(&self.objects).insert(name.to_string(), data);
        Ok(BlobInfo {
            name: name.to_string(),
            size,
        })
    }

    async fn get(&self, id: &str) -> Result<Bytes, StoreError> {
        lock(&self.objects)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// In-memory revision-tracked key-value store.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, (Bytes, u64)>>,
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<(Bytes, u64), StoreError> {
        lock(&self.entries)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64, StoreError> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(key) {
            return Err(StoreError::KeyExists(key.to_string()));
        }
        entries.insert(key.to_string(), (value, 1));
        Ok(1)
    }

    async fn update(
        &self,
        key: &str,
        value: Bytes,
        expected_revision: u64,
    ) -> Result<u64, StoreError> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if entry.1 != expected_revision {
            return Err(StoreError::RevisionMismatch {
                key: key.to_string(),
                expected: expected_revision,
            });
        }
        entry.0 = value;
        entry.1 += 1;
        Ok(entry.1)
    }
}

struct Inflight {
    payload: Bytes,
    deadline: Instant,
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    ready: VecDeque<Bytes>,
    inflight: HashMap<u64, Inflight>,
}

impl QueueInner {
    /// Moves unacknowledged messages whose ack-wait window expired back
    /// to the ready list.
    fn redeliver_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(message) = self.inflight.remove(&id) {
                self.ready.push_back(message.payload);
            }
        }
    }

    fn next_inflight_deadline(&self) -> Option<Instant> {
        self.inflight.values().map(|m| m.deadline).min()
    }
}

struct QueueShared {
    ack_wait: Duration,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// In-memory at-least-once queue with a single subject.
///
/// The publish subject is accepted for interface compatibility and
/// ignored; the queue is bound to one logical subject at construction.
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<QueueShared>,
}

impl MemoryQueue {
    pub fn new(ack_wait: Duration) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                ack_wait,
                inner: Mutex::new(QueueInner::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Messages waiting for delivery (excluding in-flight ones).
    pub fn pending(&self) -> usize {
        lock(&self.shared.inner).ready.len()
    }

    /// Messages delivered but not yet acknowledged.
    pub fn inflight(&self) -> usize {
        lock(&self.shared.inner).inflight.len()
    }
}

struct MemoryMessage {
    shared: Arc<QueueShared>,
    id: u64,
    payload: Bytes,
}

#[async_trait]
impl QueueMessage for MemoryMessage {
    fn payload(&self) -> &Bytes {
        &self.payload
    }

    async fn ack(&self) -> Result<(), StoreError> {
        lock(&self.shared.inner).inflight.remove(&self.id);
        Ok(())
    }

    async fn nack(&self) -> Result<(), StoreError> {
        let mut inner = lock(&self.shared.inner);
        if let Some(message) = inner.inflight.remove(&self.id) {
            inner.ready.push_front(message.payload);
            drop(inner);
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    async fn mark_in_progress(&self) -> Result<(), StoreError> {
        let mut inner = lock(&self.shared.inner);
        if let Some(message) = inner.inflight.get_mut(&self.id) {
            message.deadline = Instant::now() + self.shared.ack_wait;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, _subject: &str, payload: Bytes) -> Result<(), StoreError> {
        lock(&self.shared.inner).ready.push_back(payload);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn fetch(
        &self,
        max: usize,
        expires: Duration,
    ) -> Result<Vec<Box<dyn QueueMessage>>, StoreError> {
        let fetch_deadline = Instant::now() + expires;
        loop {
            let next_wake;
            {
                let mut inner = lock(&self.shared.inner);
                let now = Instant::now();
                inner.redeliver_expired(now);
                if !inner.ready.is_empty() {
                    let mut batch: Vec<Box<dyn QueueMessage>> = Vec::new();
                    while batch.len() < max {
                        let Some(payload) = inner.ready.pop_front() else {
                            break;
                        };
                        let id = inner.next_id;
                        inner.next_id += 1;
                        inner.inflight.insert(
                            id,
                            Inflight {
                                payload: payload.clone(),
                                deadline: now + self.shared.ack_wait,
                            },
                        );
                        batch.push(Box::new(MemoryMessage {
                            shared: Arc::clone(&self.shared),
                            id,
                            payload,
                        }));
                    }
                    return Ok(batch);
                }
                next_wake = inner.next_inflight_deadline();
            }

            let now = Instant::now();
            if now >= fetch_deadline {
                return Ok(Vec::new());
            }
            let wake_at = match next_wake {
                Some(deadline) => deadline.min(fetch_deadline),
                None => fetch_deadline,
            };
            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blob_put_get_and_not_found() {
        let store = MemoryBlobStore::default();
        let info = store.put("obj", Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(info.name, "obj");
        assert_eq!(info.size, 4);
        assert_eq!(store.get("obj").await.unwrap(), Bytes::from_static(b"data"));
        assert!(store.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_kv_revisions() {
        let store = MemoryKvStore::default();
        let rev = store.create("k", Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(rev, 1);
        assert!(matches!(
            store.create("k", Bytes::from_static(b"b")).await,
            Err(StoreError::KeyExists(_))
        ));

        let rev = store.update("k", Bytes::from_static(b"b"), rev).await.unwrap();
        assert_eq!(rev, 2);

        // stale revision loses
        assert!(matches!(
            store.update("k", Bytes::from_static(b"c"), 1).await,
            Err(StoreError::RevisionMismatch { .. })
        ));

        let (value, revision) = store.get("k").await.unwrap();
        assert_eq!(value, Bytes::from_static(b"b"));
        assert_eq!(revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_fetch_and_ack() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.publish("tasks", Bytes::from_static(b"one")).await.unwrap();

        let batch = queue.fetch(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload().as_ref(), b"one");
        assert_eq!(queue.inflight(), 1);

        batch[0].ack().await.unwrap();
        assert_eq!(queue.inflight(), 0);

        // queue drained: fetch expires empty, which is not an error
        let empty = queue.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered_after_ack_wait() {
        let queue = MemoryQueue::new(Duration::from_millis(100));
        queue.publish("tasks", Bytes::from_static(b"job")).await.unwrap();

        let first = queue.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.len(), 1);
        drop(first); // never acked

        let second = queue.fetch(1, Duration::from_millis(500)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload().as_ref(), b"job");
        second[0].ack().await.unwrap();

        let third = queue.fetch(1, Duration::from_millis(500)).await.unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_returns_message_immediately() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.publish("tasks", Bytes::from_static(b"job")).await.unwrap();

        let batch = queue.fetch(1, Duration::from_millis(50)).await.unwrap();
        batch[0].nack().await.unwrap();
        assert_eq!(queue.pending(), 1);

        let again = queue.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_in_progress_extends_ack_wait() {
        let queue = MemoryQueue::new(Duration::from_millis(100));
        queue.publish("tasks", Bytes::from_static(b"job")).await.unwrap();

        let batch = queue.fetch(1, Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        batch[0].mark_in_progress().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // without the extension the message would have been redelivered
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.inflight(), 1);
    }
}
