//! Typed, retry-wrapped access to the key-value and blob stores.
//!
//! [`TypedKv`] layers serde on top of the raw byte-oriented [`KvStore`]
//! and hosts the optimistic-concurrency loop every status transition
//! goes through. [`RobustBlobs`] does the same for blobs. Both wrap
//! every remote call in the retry policy, so callers see either success
//! or a meaningful non-transient error.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{BlobInfo, BlobStore, KvStore, StoreError};
use crate::retry::{with_retry, RetryPolicy};

/// Serde-typed view of a key-value bucket.
pub struct TypedKv<T> {
    store: Arc<dyn KvStore>,
    retry: RetryPolicy,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedKv<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            retry: self.retry.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedKv<T> {
    pub fn new(store: Arc<dyn KvStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            _marker: PhantomData,
        }
    }

    /// Reads and deserializes the current value with its revision.
    pub async fn get(&self, key: &str) -> Result<(T, u64), StoreError> {
        let (raw, revision) = with_retry(&self.retry, StoreError::is_transient, || {
            self.store.get(key)
        })
        .await?;
        Ok((serde_json::from_slice(&raw)?, revision))
    }

    /// Creates the key; fails with [`StoreError::KeyExists`] if present.
    pub async fn create(&self, key: &str, value: &T) -> Result<u64, StoreError> {
        let raw = Bytes::from(serde_json::to_vec(value)?);
        Ok(with_retry(&self.retry, StoreError::is_transient, || {
            self.store.create(key, raw.clone())
        })
        .await?)
    }

    /// Conditional write at a previously read revision.
    pub async fn update(&self, key: &str, value: &T, expected_revision: u64) -> Result<u64, StoreError> {
        let raw = Bytes::from(serde_json::to_vec(value)?);
        Ok(with_retry(&self.retry, StoreError::is_transient, || {
            self.store.update(key, raw.clone(), expected_revision)
        })
        .await?)
    }

    /// Lock-free conditional update.
    ///
    /// Reads the current value; if `stop` holds, returns it unchanged
    /// with zero writes (safe under duplicate delivery and races).
    /// Otherwise applies `mutate` to a copy and writes at the read
    /// revision, restarting from a fresh read on a revision conflict.
    /// Any other error aborts the operation.
    pub async fn conditional_update(
        &self,
        key: &str,
        stop: impl Fn(&T) -> bool,
        mutate: impl Fn(&mut T),
    ) -> Result<(T, u64), StoreError> {
        loop {
            let (mut value, revision) = self.get(key).await?;
            if stop(&value) {
                return Ok((value, revision));
            }
            mutate(&mut value);
            match self.update(key, &value, revision).await {
                Ok(new_revision) => return Ok((value, new_revision)),
                Err(StoreError::RevisionMismatch { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Retry-wrapped blob access with random-id naming.
#[derive(Clone)]
pub struct RobustBlobs {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl RobustBlobs {
    pub fn new(store: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn get(&self, id: &str) -> Result<Bytes, StoreError> {
        Ok(with_retry(&self.retry, StoreError::is_transient, || {
            self.store.get(id)
        })
        .await?)
    }

    /// Stores the data under a freshly generated id.
    pub async fn put_random(&self, data: Bytes) -> Result<BlobInfo, StoreError> {
        let name = super::random_id();
        Ok(with_retry(&self.retry, StoreError::is_transient, || {
            self.store.put(&name, data.clone())
        })
        .await?)
    }

    /// Serializes a value as JSON and stores it under a fresh id.
    pub async fn put_json<T: Serialize>(&self, value: &T) -> Result<BlobInfo, StoreError> {
        let data = Bytes::from(serde_json::to_vec(value)?);
        self.put_random(data).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, id: &str) -> Result<T, StoreError> {
        let data = self.get(id).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}
