//! Storage data structures and traits.

use std::collections::BTreeMap;

use crate::error::Result;

/// A record that can be persisted under `<PREFIX>_<id>`.
///
/// Ids are unique within a prefix and grow with creation time, so sorting ids
/// gives creation order.
pub trait Storable: Sized {
    /// Type tag used as the file-name prefix.
    const PREFIX: &'static str;

    fn storage_id(&self) -> i64;

    /// Serializes the record body. The id is carried by the file name.
    fn store(&self) -> Result<Vec<u8>>;

    fn restore(id: i64, data: &[u8]) -> Result<Self>;
}

/// Snapshot of what a storage directory holds.
#[derive(Clone, Debug, Default)]
pub struct StorageStats {
    /// Number of records across all prefixes
    pub records: usize,
    /// Total size of record bodies in bytes
    pub bytes: u64,
    /// Record count per prefix
    pub by_prefix: BTreeMap<String, usize>,
}

/// Which end of a prefix `read_one` starts from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Oldest,
    Newest,
}
