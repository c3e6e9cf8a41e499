//! Upload target selection.

use portlog_store::{DirectoryObjectStore, ObjectStore};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Where consolidated archives are uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    /// Objects are written below a local directory.
    Directory(PathBuf),
    /// Amazon S3, configured from `AWS_*` variables.
    #[cfg(feature = "s3")]
    S3,
}

impl FromStr for StoreTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("dir:") {
            if path.is_empty() {
                return Err("dir: target needs a path".to_string());
            }
            return Ok(Self::Directory(PathBuf::from(path)));
        }
        #[cfg(feature = "s3")]
        if s == "s3" {
            return Ok(Self::S3);
        }
        Err(format!("unknown store '{s}', expected dir:<path>{}", S3_HINT))
    }
}

#[cfg(feature = "s3")]
const S3_HINT: &str = " or s3";
#[cfg(not(feature = "s3"))]
const S3_HINT: &str = "";

impl StoreTarget {
    /// Opens the target.
    ///
    /// Remote stores drive their requests on `handle` and must be called
    /// from blocking threads.
    #[cfg_attr(not(feature = "s3"), allow(unused_variables))]
    pub fn open(
        &self,
        handle: &Handle,
    ) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error>> {
        match self {
            Self::Directory(path) => Ok(Arc::new(DirectoryObjectStore::open(path)?)),
            #[cfg(feature = "s3")]
            Self::S3 => Ok(Arc::new(portlog_store::S3ObjectStore::new(handle.clone()))),
        }
    }
}
