//! # portlog Store
//!
//! Object store trait and implementations for portlog.
//!
//! This crate provides the remote-storage abstraction that consolidated
//! log archives are uploaded to. Stores are **opaque byte stores** keyed by
//! `(bucket, key)` - they do not interpret the data they store.
//!
//! ## Design Principles
//!
//! - Stores are simple byte stores (put, list, delete)
//! - No knowledge of segments, streams or the gzip payload format
//! - Must be `Send + Sync` so one instance serves every consolidation pass
//! - `put` has overwrite semantics, which makes re-uploads idempotent
//!
//! ## Available Stores
//!
//! - [`MemoryObjectStore`] - For testing
//! - [`DirectoryObjectStore`] - Mirrors objects into a local directory
//! - `S3ObjectStore` - Amazon S3, behind the `s3` feature
//!
//! ## Example
//!
//! ```rust
//! use portlog_store::{MemoryObjectStore, ObjectStore};
//!
//! let store = MemoryObjectStore::new();
//! store.put("logs", "default/3_2024-01-01_00-00-00.log.gz", b"gz").unwrap();
//! assert_eq!(store.list("logs", "default/").unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod directory;
mod error;
mod memory;
#[cfg(feature = "s3")]
mod s3;
mod store;

pub use directory::DirectoryObjectStore;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
pub use store::{validate_bucket, validate_key, ObjectStore};
