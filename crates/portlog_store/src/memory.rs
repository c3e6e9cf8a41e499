//! In-memory object store for testing.

use crate::error::{StoreError, StoreResult};
use crate::store::{validate_bucket, validate_key, ObjectStore};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An in-memory object store.
///
/// This store keeps every object in memory and is suitable for:
/// - Unit tests
/// - Integration tests of the consolidation pass
///
/// Failures can be injected with [`MemoryObjectStore::fail_next_puts`] to
/// exercise the retry path deterministically.
///
/// # Example
///
/// ```rust
/// use portlog_store::{MemoryObjectStore, ObjectStore};
///
/// let store = MemoryObjectStore::new();
/// store.put("logs", "a/b.gz", b"payload").unwrap();
/// assert_eq!(store.get("logs", "a/b.gz").unwrap(), b"payload");
/// assert_eq!(store.put_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    failing_puts: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `put` fail with a retryable error.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Returns the number of successful `put` calls so far.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Returns a copy of the object stored under `key`, if any.
    #[must_use]
    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Returns the number of stored objects across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> StoreResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;

        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::backend_retryable("injected put failure"));
        }

        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        validate_bucket(bucket)?;
        let objects = self.objects.read();
        Ok(objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        validate_bucket(bucket)?;
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(bucket, key))
    }
}
