//! Blob store - one file per record in a flat directory.
//!
//! # File Layout
//! ```text
//! <dir>/request_1700000000123     committed record
//! <dir>/session_1700000000001
//! <dir>/consent_0
//! <dir>/.request_1700000000124.tmp  write in progress
//! ```
//!
//! A write goes to the hidden temporary name, is synced, then renamed over
//! the final name. Readers therefore see either the old body or the new one.
//! Temporary files found on open belong to writes that never committed and
//! are deleted.

use log::{debug, warn};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::types::StorageStats;
use crate::error::Result;

const TMP_SUFFIX: &str = ".tmp";

/// Synchronous record store. All methods serialize on one lock so a single
/// process never interleaves two writes to the same name.
pub struct BlobStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").field("dir", &self.dir).finish()
    }
}

impl BlobStore {
    /// Open or create a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = BlobStore {
            dir,
            lock: Mutex::new(()),
        };
        store.remove_leftovers()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, prefix: &str, id: i64) -> PathBuf {
        self.dir.join(format!("{}_{}", prefix, id))
    }

    fn tmp_path(&self, prefix: &str, id: i64) -> PathBuf {
        self.dir.join(format!(".{}_{}{}", prefix, id, TMP_SUFFIX))
    }

    /// Splits `request_42` into `("request", 42)`.
    fn parse_name(name: &str) -> Option<(&str, i64)> {
        if name.starts_with('.') {
            return None;
        }
        let (prefix, id) = name.rsplit_once('_')?;
        if prefix.is_empty() {
            return None;
        }
        id.parse().ok().map(|id| (prefix, id))
    }

    fn remove_leftovers(&self) -> Result<()> {
        let _guard = self.lock.lock();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(TMP_SUFFIX) {
                warn!("[storage] removing interrupted write {}", name);
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("[storage] could not remove {}: {}", name, e);
                }
            }
        }
        Ok(())
    }

    /// Atomically writes `data` as `<prefix>_<id>`.
    pub fn write(&self, prefix: &str, id: i64, data: &[u8]) -> Result<()> {
        let _guard = self.lock.lock();
        self.write_locked(prefix, id, data)
    }

    /// Like [`write`](Self::write) but gives up after `wait` when another
    /// operation holds the store.
    pub fn write_within(&self, prefix: &str, id: i64, data: &[u8], wait: Duration) -> Result<()> {
        let Some(_guard) = self.lock.try_lock_for(wait) else {
            return Err(std::io::Error::new(ErrorKind::WouldBlock, "record store is busy").into());
        };
        self.write_locked(prefix, id, data)
    }

    fn write_locked(&self, prefix: &str, id: i64, data: &[u8]) -> Result<()> {
        let tmp_path = self.tmp_path(prefix, id);

        let result = (|| -> Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp_path, self.record_path(prefix, id))?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    pub fn read(&self, prefix: &str, id: i64) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock();
        match fs::read(self.record_path(prefix, id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `true` when a record was deleted.
    pub fn remove(&self, prefix: &str, id: i64) -> Result<bool> {
        let _guard = self.lock.lock();
        match fs::remove_file(self.record_path(prefix, id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids stored under `prefix`, ascending.
    pub fn ids(&self, prefix: &str) -> Result<Vec<i64>> {
        let _guard = self.lock.lock();
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some((p, id)) = Self::parse_name(&name) {
                if p == prefix {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Every committed `(prefix, id)` pair, sorted by prefix then id.
    pub fn entries(&self) -> Result<Vec<(String, i64)>> {
        let _guard = self.lock.lock();
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some((prefix, id)) = Self::parse_name(&name) {
                entries.push((prefix.to_string(), id));
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Largest id across all prefixes, 0 for an empty store.
    pub fn max_id(&self) -> Result<i64> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|(_, id)| id)
            .max()
            .unwrap_or(0))
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();
        for (prefix, id) in self.entries()? {
            let size = match fs::metadata(self.record_path(&prefix, id)) {
                Ok(meta) => meta.len(),
                Err(e) => {
                    debug!("[storage] {}_{} vanished during stats: {}", prefix, id, e);
                    continue;
                }
            };
            stats.records += 1;
            stats.bytes += size;
            *stats.by_prefix.entry(prefix).or_insert(0) += 1;
        }
        Ok(stats)
    }
}
