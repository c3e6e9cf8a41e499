//! Object store trait definition.

use crate::error::{StoreError, StoreResult};

/// A remote (or remote-like) object store.
///
/// Object stores are **opaque byte stores** addressed by `(bucket, key)`.
/// They know nothing about segments, streams or gzip; portlog owns the
/// naming and payload format of everything it uploads.
///
/// # Invariants
///
/// - `put` overwrites any existing object under the same key
/// - after `put` returns `Ok`, the object is durably stored
/// - a failed `put` leaves no partially visible object
/// - implementations must be `Send + Sync` so one instance can serve the
///   periodic consolidator and one-shot CLI passes
///
/// # Implementors
///
/// - [`super::MemoryObjectStore`] - For testing
/// - [`super::DirectoryObjectStore`] - Mirrors objects into a local directory
pub trait ObjectStore: Send + Sync {
    /// Stores `data` under `key` in `bucket`, replacing any existing object.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the backend fails.
    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> StoreResult<()>;

    /// Lists the keys in `bucket` that start with `prefix`, sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed.
    fn list(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>>;

    /// Deletes the object stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such object exists.
    fn delete(&self, bucket: &str, key: &str) -> StoreResult<()>;
}

/// Validates a bucket name.
///
/// Buckets are a single path component: non-empty, no `/`, not `.` or `..`.
pub fn validate_bucket(bucket: &str) -> StoreResult<()> {
    if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
        return Err(StoreError::invalid_key(format!("bad bucket name '{bucket}'")));
    }
    Ok(())
}

/// Validates an object key.
///
/// Keys are `/`-separated, must not be empty, must not start with `/`, and
/// no component may be empty, `.` or `..`.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StoreError::invalid_key(format!("bad object key '{key}'")));
    }
    if key
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StoreError::invalid_key(format!("bad object key '{key}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_hierarchical_keys() {
        assert!(validate_key("r13/default/3_2024-01-01_00-00-00.log.gz").is_ok());
        assert!(validate_key("plain").is_ok());
    }

    #[test]
    fn rejects_traversal_and_empty_components() {
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a/./b").is_err());
        assert!(validate_key("a/").is_err());
    }

    #[test]
    fn bucket_is_single_component() {
        assert!(validate_bucket("platformsupport").is_ok());
        assert!(validate_bucket("").is_err());
        assert!(validate_bucket("a/b").is_err());
        assert!(validate_bucket("..").is_err());
    }
}
