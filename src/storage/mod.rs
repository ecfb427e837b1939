//! Crash-safe record storage.
//!
//! Records live one per file as `<prefix>_<id>` inside a single directory.
//! - [`BlobStore`] does the synchronous atomic file work.
//! - [`Storage`] serializes every operation through one ordered worker.

pub mod blob_store;
pub mod store;
pub mod types;

pub use blob_store::BlobStore;
pub use store::Storage;
pub use types::{Order, Storable, StorageStats};
