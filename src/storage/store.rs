//! Async record storage.
//!
//! `Storage` is a cheap-to-clone handle over a [`BlobStore`] and a dedicated
//! [`Tasks`] worker. Every operation is submitted to that worker, so
//! operations observe each other in call order and the file system never sees
//! two concurrent writers from this process. File I/O itself runs on tokio's
//! blocking pool.

use log::{debug, error, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::blob_store::BlobStore;
use super::types::{Order, Storable, StorageStats};
use crate::error::Result;
use crate::tasks::{TaskHandle, TaskId, Tasks};

pub const WRITE_NOW_WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct Storage {
    blobs: Arc<BlobStore>,
    tasks: Arc<Tasks>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("dir", &self.blobs.dir())
            .field("tasks", &self.tasks)
            .finish()
    }
}

fn restore_logged<T: Storable>(id: i64, data: &[u8]) -> Option<T> {
    match T::restore(id, data) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("[storage] corrupt record {}_{}: {}", T::PREFIX, id, e);
            None
        }
    }
}

impl Storage {
    /// Open storage in `dir`. Must be called inside a tokio runtime.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let blobs = BlobStore::open(dir)?;
        debug!("[storage] opened {}", blobs.dir().display());
        Ok(Storage {
            blobs: Arc::new(blobs),
            tasks: Arc::new(Tasks::new("storage")?),
        })
    }

    pub fn dir(&self) -> &Path {
        self.blobs.dir()
    }

    fn submit<R, F>(&self, op: F) -> TaskHandle<R>
    where
        R: Clone + Default + Send + Sync + 'static,
        F: FnOnce(&BlobStore) -> Result<R> + Send + 'static,
    {
        let blobs = Arc::clone(&self.blobs);
        self.tasks.run(TaskId::Unique, async move {
            match tokio::task::spawn_blocking(move || op(&blobs)).await {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => {
                    error!("[storage] operation failed: {}", e);
                    R::default()
                }
                Err(e) => {
                    error!("[storage] blocking operation failed: {}", e);
                    R::default()
                }
            }
        })
    }

    async fn resolve<R: Clone + Default>(handle: TaskHandle<R>) -> R {
        match handle.wait().await {
            Ok(value) => value,
            Err(e) => {
                warn!("[storage] {}", e);
                R::default()
            }
        }
    }

    /// Queues a write of `record` and returns a handle to its outcome.
    ///
    /// The record is serialized before this returns, so later mutation of
    /// `record` does not affect what is written.
    pub fn push_async<T: Storable>(&self, record: &T) -> TaskHandle<bool> {
        let id = record.storage_id();
        let data = record.store();
        self.submit(move |blobs| match data {
            Ok(data) => blobs.write(T::PREFIX, id, &data).map(|_| true),
            Err(e) => {
                error!("[storage] cannot serialize {}_{}: {}", T::PREFIX, id, e);
                Ok(false)
            }
        })
    }

    pub async fn push<T: Storable>(&self, record: &T) -> bool {
        Self::resolve(self.push_async(record)).await
    }

    /// Writes immediately on the calling thread, bypassing the worker.
    ///
    /// Only for paths that cannot await, such as a panic hook. Waits at most
    /// [`WRITE_NOW_WAIT`] for an operation already touching the store.
    pub fn write_now<T: Storable>(&self, record: &T) -> bool {
        let id = record.storage_id();
        let result = record
            .store()
            .and_then(|data| self.blobs.write_within(T::PREFIX, id, &data, WRITE_NOW_WAIT));
        match result {
            Ok(()) => true,
            Err(e) => {
                error!("[storage] direct write of {}_{} failed: {}", T::PREFIX, id, e);
                false
            }
        }
    }

    /// Non-destructive read. Corrupt records read as `None`.
    pub async fn read<T: Storable>(&self, id: i64) -> Option<T> {
        let data = Self::resolve(self.submit(move |blobs| blobs.read(T::PREFIX, id))).await?;
        restore_logged(id, &data)
    }

    /// Reads and deletes a record.
    pub async fn pop<T: Storable>(&self, id: i64) -> Option<T> {
        let handle = self.submit(move |blobs| {
            let data = blobs.read(T::PREFIX, id)?;
            if data.is_some() {
                blobs.remove(T::PREFIX, id)?;
            }
            Ok(data)
        });
        let data = Self::resolve(handle).await?;
        restore_logged(id, &data)
    }

    /// First readable record of `T::PREFIX` from the given end.
    pub async fn read_one<T: Storable>(&self, order: Order) -> Option<T> {
        let handle = self.submit(move |blobs| {
            let mut ids = blobs.ids(T::PREFIX)?;
            if order == Order::Newest {
                ids.reverse();
            }
            for id in ids {
                if let Some(data) = blobs.read(T::PREFIX, id)? {
                    if T::restore(id, &data).is_ok() {
                        return Ok(Some((id, data)));
                    }
                    warn!("[storage] skipping corrupt record {}_{}", T::PREFIX, id);
                }
            }
            Ok(None)
        });
        let (id, data) = Self::resolve(handle).await?;
        restore_logged(id, &data)
    }

    /// Ids under `prefix`.
    ///
    /// `limit == 0` lists everything in creation order, `limit > 0` the oldest
    /// `limit` ids in creation order, and `limit < 0` the newest `-limit` ids
    /// newest first.
    pub async fn list(&self, prefix: &str, limit: i64) -> Vec<i64> {
        let prefix = prefix.to_string();
        let ids = Self::resolve(self.submit(move |blobs| blobs.ids(&prefix))).await;
        slice_ids(ids, limit)
    }

    pub async fn remove<T: Storable>(&self, record: &T) -> bool {
        self.remove_id(T::PREFIX, record.storage_id()).await
    }

    pub fn remove_async(&self, prefix: &str, id: i64) -> TaskHandle<bool> {
        let prefix = prefix.to_string();
        self.submit(move |blobs| blobs.remove(&prefix, id))
    }

    pub async fn remove_id(&self, prefix: &str, id: i64) -> bool {
        Self::resolve(self.remove_async(prefix, id)).await
    }

    /// Rewrites records of `prefix` in place. `f` returns the new body, or
    /// `None` to leave a record untouched. Returns the number rewritten.
    pub async fn transform<F>(&self, prefix: &str, f: F) -> usize
    where
        F: Fn(i64, &[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let prefix = prefix.to_string();
        let handle = self.submit(move |blobs| {
            let mut changed = 0;
            for id in blobs.ids(&prefix)? {
                let Some(data) = blobs.read(&prefix, id)? else {
                    continue;
                };
                if let Some(updated) = f(id, &data) {
                    blobs.write(&prefix, id, &updated)?;
                    changed += 1;
                }
            }
            Ok(changed)
        });
        Self::resolve(handle).await
    }

    /// Deletes every record of `T::PREFIX` for which `matches` holds.
    /// Corrupt records are deleted too.
    pub async fn remove_where<T, F>(&self, matches: F) -> usize
    where
        T: Storable,
        F: Fn(&T) -> bool + Send + 'static,
    {
        let handle = self.submit(move |blobs| {
            let mut removed = 0;
            for id in blobs.ids(T::PREFIX)? {
                let Some(data) = blobs.read(T::PREFIX, id)? else {
                    continue;
                };
                let drop_it = match T::restore(id, &data) {
                    Ok(record) => matches(&record),
                    Err(_) => true,
                };
                if drop_it && blobs.remove(T::PREFIX, id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        });
        Self::resolve(handle).await
    }

    /// Deletes every record under `prefix`.
    pub async fn purge(&self, prefix: &str) -> usize {
        let prefix = prefix.to_string();
        let handle = self.submit(move |blobs| {
            let mut removed = 0;
            for id in blobs.ids(&prefix)? {
                if blobs.remove(&prefix, id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        });
        Self::resolve(handle).await
    }

    /// Largest id on disk across every prefix.
    pub fn max_id(&self) -> i64 {
        match self.blobs.max_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("[storage] cannot scan for max id: {}", e);
                0
            }
        }
    }

    pub async fn stats(&self) -> StorageStats {
        Self::resolve(self.submit(|blobs| blobs.stats())).await
    }

    /// Resolves once every operation submitted before it has completed.
    pub async fn barrier(&self) {
        self.tasks.barrier().await;
    }

    pub fn shutdown(&self) {
        self.tasks.shutdown();
    }

    pub async fn await_termination(&self) {
        self.tasks.await_termination().await;
    }
}

fn slice_ids(ids: Vec<i64>, limit: i64) -> Vec<i64> {
    let count = limit.unsigned_abs() as usize;
    match limit {
        0 => ids,
        l if l > 0 => ids.into_iter().take(count).collect(),
        _ => ids.into_iter().rev().take(count).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        id: i64,
        text: String,
    }

    impl Storable for Note {
        const PREFIX: &'static str = "note";

        fn storage_id(&self) -> i64 {
            self.id
        }

        fn store(&self) -> Result<Vec<u8>> {
            Ok(self.text.as_bytes().to_vec())
        }

        fn restore(id: i64, data: &[u8]) -> Result<Self> {
            let text = String::from_utf8(data.to_vec())
                .map_err(|e| AgentError::Serialization(e.to_string()))?;
            Ok(Note { id, text })
        }
    }

    fn note(id: i64, text: &str) -> Note {
        Note {
            id,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_slice_ids() {
        let ids = vec![1, 2, 3, 4, 5];
        assert_eq!(slice_ids(ids.clone(), 0), vec![1, 2, 3, 4, 5]);
        assert_eq!(slice_ids(ids.clone(), 2), vec![1, 2]);
        assert_eq!(slice_ids(ids.clone(), -2), vec![5, 4]);
        assert_eq!(slice_ids(ids.clone(), 10), vec![1, 2, 3, 4, 5]);
        assert_eq!(slice_ids(ids, -10), vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_push_read_pop() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();

        assert!(storage.push(&note(1, "one")).await);
        assert!(storage.push(&note(2, "two")).await);

        assert_eq!(storage.read::<Note>(1).await, Some(note(1, "one")));
        assert_eq!(storage.pop::<Note>(1).await, Some(note(1, "one")));
        assert_eq!(storage.read::<Note>(1).await, None);
        assert_eq!(storage.list("note", 0).await, vec![2]);
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_absent() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("note_3"), [0xff, 0xfe]).unwrap();
        std::fs::write(temp_dir.path().join("note_4"), b"fine").unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();

        assert_eq!(storage.read::<Note>(3).await, None);
        assert_eq!(
            storage.read_one::<Note>(Order::Oldest).await,
            Some(note(4, "fine"))
        );
    }

    #[tokio::test]
    async fn test_push_snapshot_taken_at_submit() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();

        let mut record = note(9, "before");
        let handle = storage.push_async(&record);
        record.text = "after".into();
        assert!(handle.wait().await.unwrap());

        assert_eq!(storage.read::<Note>(9).await, Some(note(9, "before")));
    }

    #[tokio::test]
    async fn test_transform_and_remove_where() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        for (id, text) in [(1, "keep"), (2, "drop"), (3, "keep")] {
            storage.push(&note(id, text)).await;
        }

        let changed = storage
            .transform("note", |_, data| {
                (data == b"keep").then(|| b"kept".to_vec())
            })
            .await;
        assert_eq!(changed, 2);

        let removed = storage.remove_where::<Note, _>(|n| n.text == "drop").await;
        assert_eq!(removed, 1);
        assert_eq!(storage.list("note", 0).await, vec![1, 3]);
        assert_eq!(storage.read::<Note>(3).await, Some(note(3, "kept")));
    }

    #[tokio::test]
    async fn test_write_now_visible_to_async_reads() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();

        assert!(storage.write_now(&note(11, "panic")));
        assert_eq!(storage.read::<Note>(11).await, Some(note(11, "panic")));
        assert_eq!(storage.max_id(), 11);
    }

    #[tokio::test]
    async fn test_purge_and_stats() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        storage.push(&note(1, "a")).await;
        storage.push(&note(2, "b")).await;

        assert_eq!(storage.stats().await.records, 2);
        assert_eq!(storage.purge("note").await, 2);
        assert!(storage.list("note", 0).await.is_empty());
    }
}
