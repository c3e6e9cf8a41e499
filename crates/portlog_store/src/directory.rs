//! Directory-backed object store.

use crate::error::{StoreError, StoreResult};
use crate::store::{validate_bucket, validate_key, ObjectStore};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix of the temporary file an object is staged in before it is renamed
/// into place.
const STAGING_SUFFIX: &str = ".partial";

/// An object store that mirrors buckets and keys into a local directory.
///
/// Objects live at `<root>/<bucket>/<key>`, with `/` in keys mapped to
/// nested directories. Writes are staged in a sibling file and renamed into
/// place after `sync_all`, so a crash never leaves a truncated object under
/// its final key.
///
/// # Example
///
/// ```no_run
/// use portlog_store::{DirectoryObjectStore, ObjectStore};
/// use std::path::Path;
///
/// let store = DirectoryObjectStore::open(Path::new("uploads")).unwrap();
/// store.put("logs", "site/3_2024-01-01_00-00-00.log.gz", b"...").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: &Path) -> StoreResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.root.join(bucket);
        for part in key.split('/') {
            path.push(part);
        }
        path
    }

    fn collect_keys(dir: &Path, relative: &str, keys: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = if relative.is_empty() {
                name.clone()
            } else {
                format!("{relative}/{name}")
            };

            if entry.file_type()?.is_dir() {
                Self::collect_keys(&entry.path(), &key, keys)?;
            } else if !name.ends_with(STAGING_SUFFIX) {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStore for DirectoryObjectStore {
    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> StoreResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;

        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut staging = path.clone().into_os_string();
        staging.push(STAGING_SUFFIX);
        let staging = PathBuf::from(staging);

        {
            let mut file = File::create(&staging)?;
            file.write_all(data)?;
            file.sync_all()?;
        }

        if let Err(err) = fs::rename(&staging, &path) {
            let _ = fs::remove_file(&staging);
            return Err(err.into());
        }

        tracing::debug!(bucket, key, bytes = data.len(), "stored object");
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        validate_bucket(bucket)?;

        let bucket_dir = self.root.join(bucket);
        if !bucket_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        Self::collect_keys(&bucket_dir, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;

        match fs::remove_file(self.object_path(bucket, key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::not_found(bucket, key))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn directory_put_creates_nested_object() {
        let dir = tempdir().unwrap();
        let store = DirectoryObjectStore::open(dir.path()).unwrap();

        store.put("logs", "site/a/1.gz", b"hello").unwrap();

        let path = dir.path().join("logs").join("site").join("a").join("1.gz");
        assert_eq!(fs::read(path).unwrap(), b"hello");
    }

    #[test]
    fn directory_put_overwrites_and_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let store = DirectoryObjectStore::open(dir.path()).unwrap();

        store.put("logs", "k", b"one").unwrap();
        store.put("logs", "k", b"two").unwrap();

        assert_eq!(fs::read(dir.path().join("logs").join("k")).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path().join("logs")).unwrap().count(), 1);
    }

    #[test]
    fn directory_list_is_sorted_and_prefixed() {
        let dir = tempdir().unwrap();
        let store = DirectoryObjectStore::open(dir.path()).unwrap();

        store.put("logs", "p/2", b"").unwrap();
        store.put("logs", "p/1", b"").unwrap();
        store.put("logs", "q/1", b"").unwrap();

        assert_eq!(store.list("logs", "p/").unwrap(), vec!["p/1", "p/2"]);
        assert!(store.list("empty", "").unwrap().is_empty());
    }

    #[test]
    fn directory_delete() {
        let dir = tempdir().unwrap();
        let store = DirectoryObjectStore::open(dir.path()).unwrap();

        store.put("logs", "k", b"x").unwrap();
        store.delete("logs", "k").unwrap();

        assert!(store.list("logs", "").unwrap().is_empty());
        assert!(matches!(
            store.delete("logs", "k"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn directory_rejects_escape() {
        let dir = tempdir().unwrap();
        let store = DirectoryObjectStore::open(dir.path()).unwrap();

        assert!(store.put("logs", "../../etc/passwd", b"").is_err());
        assert!(store.put("..", "k", b"").is_err());
    }
}
