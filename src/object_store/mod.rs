//! Object storage collaborator.
//!
//! Dispatch only ever lists keys under a prefix and deletes keys; uploads and
//! downloads happen elsewhere.

mod fs_store;
mod memory_store;

pub use fs_store::FsObjectStore;
pub use memory_store::MemoryObjectStore;

use anyhow::Result;

/// A single object in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    /// Upload time in milliseconds since the Unix epoch.
    pub uploaded_at_ms: i64,
}

/// Read/delete access to a bucketed object store.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait ObjectStore: Send + Sync {
    /// All objects in `bucket` whose key starts with `prefix`, in no
    /// particular order. An unknown bucket lists as empty.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>>;

    /// Delete one object. Deleting a missing key succeeds.
    fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}
