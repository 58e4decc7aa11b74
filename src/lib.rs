//! Dreambooth Dispatch Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod config;
pub mod dispatch;
pub mod object_store;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use dispatch::{DispatchError, DispatchManager, SqliteJobStore};
pub use object_store::{FsObjectStore, ObjectStore};
pub use server::{run_server, RequestsLoggingLevel};
