//! Amazon S3 object store (feature `s3`).

use crate::error::{StoreError, StoreResult};
use crate::store::{validate_bucket, validate_key, ObjectStore};
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore as _, PutPayload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;

/// An object store backed by Amazon S3.
///
/// Credentials and region come from the standard `AWS_*` environment
/// variables. One client is built lazily per bucket.
///
/// Calls block on the captured tokio runtime handle, so they must be made
/// from a blocking context (a plain thread or `spawn_blocking`), never from
/// inside an async task.
pub struct S3ObjectStore {
    handle: Handle,
    clients: Mutex<HashMap<String, Arc<AmazonS3>>>,
}

impl S3ObjectStore {
    /// Creates a store that drives requests on `handle`.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, bucket: &str) -> StoreResult<Arc<AmazonS3>> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(bucket) {
            return Ok(Arc::clone(client));
        }

        let client = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| StoreError::backend_fatal(e.to_string()))?;
        let client = Arc::new(client);
        clients.insert(bucket.to_string(), Arc::clone(&client));
        Ok(client)
    }
}

/// Returns the deepest directory fully named by `prefix`.
///
/// S3 listing filters by whole path segments, so a partial last segment is
/// matched on the client.
fn list_location(prefix: &str) -> Option<ObjectPath> {
    prefix
        .rsplit_once('/')
        .map(|(dir, _)| dir.trim_matches('/'))
        .filter(|dir| !dir.is_empty())
        .map(ObjectPath::from)
}

fn map_error(bucket: &str, key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::not_found(bucket, key),
        other => StoreError::backend_retryable(other.to_string()),
    }
}

impl ObjectStore for S3ObjectStore {
    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> StoreResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;

        let client = self.client(bucket)?;
        let location = ObjectPath::from(key);
        let payload = PutPayload::from(data.to_vec());

        self.handle
            .block_on(client.put(&location, payload))
            .map(|_| ())
            .map_err(|e| map_error(bucket, key, e))
    }

    fn list(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        validate_bucket(bucket)?;

        let client = self.client(bucket)?;
        let location = list_location(prefix);
        let metas: Vec<_> = self
            .handle
            .block_on(client.list(location.as_ref()).try_collect())
            .map_err(|e| map_error(bucket, prefix, e))?;

        let mut keys: Vec<String> = metas
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;

        let client = self.client(bucket)?;
        self.handle
            .block_on(client.delete(&ObjectPath::from(key)))
            .map_err(|e| map_error(bucket, key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_is_narrowed_to_the_prefix_directory() {
        assert_eq!(list_location("site-a/"), Some(ObjectPath::from("site-a")));
        assert_eq!(
            list_location("site-a/logs/3_2024"),
            Some(ObjectPath::from("site-a/logs"))
        );
        assert_eq!(list_location("site-a"), None);
        assert_eq!(list_location(""), None);
        assert_eq!(list_location("/3_"), None);
    }
}
