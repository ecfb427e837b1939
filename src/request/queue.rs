//! Durable request queue.
//!
//! Thin layer over [`Storage`] for `request_<id>` records. Every successful
//! enqueue wakes the networking loop through a shared [`Notify`].
//!
//! Requests are stamped with the device id current at enqueue time, so a
//! later identity change never relabels data recorded under the old id.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::Notify;

use super::params::PARAM_DEVICE_ID;
use super::request::Request;
use crate::storage::{Order, Storable, Storage};

#[derive(Clone)]
pub struct RequestQueue {
    storage: Storage,
    wake: Arc<Notify>,
    device_id: Option<Arc<RwLock<Option<String>>>>,
}

impl RequestQueue {
    pub fn new(storage: Storage) -> Self {
        RequestQueue {
            storage,
            wake: Arc::new(Notify::new()),
            device_id: None,
        }
    }

    /// Stamps untagged requests with the id held in `slot`.
    pub fn tagging(mut self, slot: Arc<RwLock<Option<String>>>) -> Self {
        self.device_id = Some(slot);
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Notified whenever a request is enqueued.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Persists `request`; the networking loop is woken on success.
    pub async fn push(&self, request: &Request) -> bool {
        if request.is_empty() {
            debug!("[queue] dropping empty request {}", request.id());
            return false;
        }
        let request = self.stamp(request);
        let stored = self.storage.push(&*request).await;
        if stored {
            debug!("[queue] queued {}", request);
            self.wake.notify_one();
        } else {
            warn!("[queue] failed to persist request {}", request.id());
        }
        stored
    }

    fn stamp<'a>(&self, request: &'a Request) -> Cow<'a, Request> {
        if request.params.has(PARAM_DEVICE_ID) {
            return Cow::Borrowed(request);
        }
        let device_id = self.device_id.as_ref().and_then(|slot| slot.read().clone());
        match device_id {
            Some(device_id) => {
                let mut tagged = request.clone();
                tagged.params.add(PARAM_DEVICE_ID, device_id);
                Cow::Owned(tagged)
            }
            None => Cow::Borrowed(request),
        }
    }

    pub async fn oldest(&self) -> Option<Request> {
        self.storage.read_one::<Request>(Order::Oldest).await
    }

    pub async fn remove(&self, id: i64) -> bool {
        self.storage.remove_id(Request::PREFIX, id).await
    }

    pub async fn ids(&self) -> Vec<i64> {
        self.storage.list(Request::PREFIX, 0).await
    }

    pub async fn len(&self) -> usize {
        self.ids().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Adds `device_id` to every queued request that lacks one. Runs two
    /// passes so requests written while the first pass ran are covered.
    pub async fn inject_device_id(&self, device_id: &str) -> usize {
        let mut total = 0;
        for _ in 0..2 {
            let id_value = device_id.to_string();
            total += self
                .storage
                .transform(Request::PREFIX, move |id, data| {
                    let mut request = Request::restore(id, data).ok()?;
                    if request.params.has(PARAM_DEVICE_ID) {
                        return None;
                    }
                    request.params.add(PARAM_DEVICE_ID, &id_value);
                    request.store().ok()
                })
                .await;
        }
        if total > 0 {
            info!("[queue] added device id to {} queued requests", total);
            self.wake.notify_one();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Params;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_push_orders_and_wakes() {
        let temp_dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(Storage::open(temp_dir.path()).unwrap());
        let wake = queue.wake_handle();

        assert!(queue.push(&Request::with_params(2, Params::new().with("a", 1))).await);
        assert!(queue.push(&Request::with_params(1, Params::new().with("b", 1))).await);
        tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
            .await
            .unwrap();

        assert_eq!(queue.ids().await, vec![1, 2]);
        assert_eq!(queue.oldest().await.unwrap().id(), 1);
    }

    #[tokio::test]
    async fn test_empty_request_not_stored() {
        let temp_dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(Storage::open(temp_dir.path()).unwrap());
        assert!(!queue.push(&Request::new(1)).await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_inject_device_id_only_where_missing() {
        let temp_dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(Storage::open(temp_dir.path()).unwrap());
        queue
            .push(&Request::with_params(1, Params::new().with("begin_session", 1)))
            .await;
        queue
            .push(&Request::with_params(
                2,
                Params::new().with("device_id", "OLD").with("end_session", 1),
            ))
            .await;

        assert_eq!(queue.inject_device_id("NEW").await, 1);

        let first = queue.storage().read::<Request>(1).await.unwrap();
        let second = queue.storage().read::<Request>(2).await.unwrap();
        assert_eq!(first.params.get("device_id"), Some("NEW"));
        assert_eq!(second.params.get("device_id"), Some("OLD"));
    }

    #[tokio::test]
    async fn test_push_stamps_current_device_id() {
        let temp_dir = TempDir::new().unwrap();
        let slot = Arc::new(RwLock::new(None));
        let queue = RequestQueue::new(Storage::open(temp_dir.path()).unwrap()).tagging(Arc::clone(&slot));

        queue.push(&Request::with_params(1, Params::new().with("a", 1))).await;
        *slot.write() = Some("A".to_string());
        queue.push(&Request::with_params(2, Params::new().with("b", 1))).await;
        queue
            .push(&Request::with_params(
                3,
                Params::new().with("device_id", "X").with("c", 1),
            ))
            .await;

        assert!(!queue.push(&Request::with_params(4, Params::new().with("device_id", "X"))).await);

        let storage = queue.storage();
        assert!(storage.read::<Request>(4).await.is_none());
        assert_eq!(storage.read::<Request>(1).await.unwrap().params.get("device_id"), None);
        assert_eq!(storage.read::<Request>(2).await.unwrap().params.get("device_id"), Some("A"));
        assert_eq!(storage.read::<Request>(3).await.unwrap().params.get("device_id"), Some("X"));
    }
}
