//! Storage directory management.
//!
//! ```text
//! <storage_dir>/
//! ├─ LOCK                           # Advisory lock, one pipeline per directory
//! ├─ 0_2024-05-01_12-00-00.gz       # Closed, compressed segment
//! └─ 0_2024-05-01_13-00-00          # Active (or uncompressed closed) segment
//! ```
//!
//! The registry of open segments lives in process memory. The LOCK file
//! ensures that only the process owning that registry consolidates the
//! directory.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// An exclusively locked storage directory.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct StorageDir {
    path: PathBuf,
    _lock_file: File,
}

impl StorageDir {
    /// Creates `path` if needed and locks it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::StorageRoot`] if the directory cannot be created or is
    ///   not a directory
    /// - [`CoreError::StorageLocked`] if another process holds the lock
    pub fn open(path: &Path) -> CoreResult<Self> {
        let root_error = |source: io::Error| CoreError::StorageRoot {
            path: path.to_path_buf(),
            source,
        };

        fs::create_dir_all(path).map_err(root_error)?;
        if !path.is_dir() {
            return Err(root_error(io::Error::other("not a directory")));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))
            .map_err(root_error)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StorageLocked {
                path: path.to_path_buf(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
