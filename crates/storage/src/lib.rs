//! Key-value storage adapter for the committee node.
//!
//! This crate provides the storage capability the rest of the node is built
//! on: an async key-value interface over opaque byte keys, with an in-memory
//! backend for tests, a sled backend for durable local storage, and a retry
//! decorator for transient faults.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not be reached; the operation may be retried.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
}

impl StorageError {
    /// Whether retrying the failed operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// The key-value capability used throughout the node.
///
/// All operations are idempotent for the caller. Keys and values are opaque
/// bytes; namespacing is the caller's concern.
#[allow(async_fn_in_trait)]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Batched read. Missing keys are absent from the result map.
    async fn multi_get(
        &self,
        keys: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, Vec<u8>>, StorageError>;

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Batched write; durable before the call returns.
    async fn multi_set(
        &self,
        entries: HashMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(), StorageError>;

    /// Compare-and-swap: writes `new` only if the current value equals
    /// `expected` (`None` meaning the key is absent). Returns whether the
    /// write happened.
    async fn cas_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError>;
}

impl<S: Storage> Storage for Arc<S> {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).get(key).await
    }

    async fn multi_get(
        &self,
        keys: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, Vec<u8>>, StorageError> {
        (**self).multi_get(keys).await
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        (**self).set(key, value).await
    }

    async fn multi_set(
        &self,
        entries: HashMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(), StorageError> {
        (**self).multi_set(entries).await
    }

    async fn cas_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        (**self).cas_set(key, expected, new).await
    }
}

/// In-memory storage for tests and offline runs.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("storage lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .entries
            .lock()
            .expect("storage lock poisoned")
            .get(key)
            .cloned())
    }

    async fn multi_get(
        &self,
        keys: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, Vec<u8>>, StorageError> {
        let entries = self.entries.lock().expect("storage lock poisoned");
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn multi_set(
        &self,
        entries: HashMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(), StorageError> {
        self.entries
            .lock()
            .expect("storage lock poisoned")
            .extend(entries);
        Ok(())
    }

    async fn cas_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        let current = entries.get(key).map(|v| v.as_slice());
        if current == expected {
            entries.insert(key.to_vec(), new.to_vec());
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Durable local storage backed by sled.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Create a temporary database (for testing).
    pub fn temporary() -> Result<Self, StorageError> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }
}

impl Storage for SledStorage {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    async fn multi_get(
        &self,
        keys: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, Vec<u8>>, StorageError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.db.get(key)? {
                found.insert(key.clone(), value.to_vec());
            }
        }
        Ok(found)
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn multi_set(
        &self,
        entries: HashMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            batch.insert(key, value);
        }
        self.db.apply_batch(batch)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn cas_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let swapped = self
            .db
            .compare_and_swap(key, expected, Some(new))?
            .is_ok();
        if swapped {
            self.db.flush_async().await?;
        }
        Ok(swapped)
    }
}

/// Backoff parameters for [`RetryingStorage`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay)
    }
}

/// Decorator that retries transient faults with capped exponential backoff.
///
/// Non-transient errors and exhausted retries are surfaced to the caller
/// unchanged.
pub struct RetryingStorage<S> {
    inner: S,
    retry: RetryConfig,
}

impl<S: Storage> RetryingStorage<S> {
    pub fn new(inner: S, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn run<'a, T, F, Fut>(&'a self, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut(&'a S) -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op(&self.inner).await {
                Err(err) if err.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt, ?delay, "transient storage fault: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl<S: Storage> Storage for RetryingStorage<S> {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.run(|s| s.get(key)).await
    }

    async fn multi_get(
        &self,
        keys: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, Vec<u8>>, StorageError> {
        self.run(|s| s.multi_get(keys)).await
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.run(|s| s.set(key, value)).await
    }

    async fn multi_set(
        &self,
        entries: HashMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(), StorageError> {
        // Clone per attempt; batches are small relative to a network round trip.
        self.run(|s| s.multi_set(entries.clone())).await
    }

    async fn cas_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        self.run(|s| s.cas_set(key, expected, new)).await
    }
}
