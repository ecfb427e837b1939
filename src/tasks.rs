//! # Tasks
//!
//! Single-worker ordered executor with task-identity coalescing.
//!
//! Each subsystem that owns mutable state (storage, networking, device-id
//! acquisition) gets its own `Tasks`. Work submitted to one instance runs
//! strictly one at a time in submission order on a dedicated tokio task.
//!
//! Submissions carrying the same [`TaskId::Key`] while an earlier one is still
//! pending or running are coalesced: the later body is dropped unexecuted and
//! the caller receives a handle to the earlier task's result.

use log::{debug, error, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};

use crate::error::{AgentError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Identity of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// Never coalesced.
    Unique,
    /// Coalesced with any pending or running task of the same key.
    Key(String),
}

impl TaskId {
    pub fn key(key: impl Into<String>) -> Self {
        TaskId::Key(key.into())
    }

    fn coalescing_key(&self) -> Option<&str> {
        match self {
            TaskId::Unique => None,
            TaskId::Key(key) => Some(key),
        }
    }
}

/// Handle to the eventual result of a submitted task.
///
/// Coalesced submissions receive clones of the same handle; use
/// [`TaskHandle::same_task`] to tell whether two handles alias one execution.
pub struct TaskHandle<T> {
    seq: u64,
    executor: Arc<str>,
    rx: watch::Receiver<Option<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        TaskHandle {
            seq: self.seq,
            executor: Arc::clone(&self.executor),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Waits for the task to finish and returns its result.
    ///
    /// Fails with `TaskAborted` when the task panicked or was never run
    /// because the executor had already shut down.
    pub async fn wait(mut self) -> Result<T> {
        let value = self
            .rx
            .wait_for(|v| v.is_some())
            .await
            .map(|slot| (*slot).clone())
            .ok()
            .flatten();
        value.ok_or_else(|| AgentError::TaskAborted(self.executor.to_string()))
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// True when two handles refer to one execution.
    pub fn same_task(&self, other: &TaskHandle<T>) -> bool {
        self.seq == other.seq && self.executor == other.executor
    }

    fn is_abandoned(&self) -> bool {
        self.rx.has_changed().is_err() && self.rx.borrow().is_none()
    }
}

struct Pending {
    seq: u64,
    handle: Box<dyn Any + Send + Sync>,
}

/// Ordered single-worker executor.
pub struct Tasks {
    name: Arc<str>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    seq: AtomicU64,
    running: Arc<AtomicBool>,
    shutdown: AtomicBool,
    terminated: Arc<AtomicBool>,
    terminated_notify: Arc<Notify>,
}

impl std::fmt::Debug for Tasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasks")
            .field("name", &self.name)
            .field("pending", &self.pending.lock().len())
            .field("shutdown", &self.is_shutdown())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Tasks {
    /// Creates an executor and spawns its worker on the current tokio runtime.
    pub fn new(name: &str) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AgentError::Config(format!("tasks '{}' need a tokio runtime: {}", name, e)))?;

        let name: Arc<str> = Arc::from(name);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let running = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let terminated_notify = Arc::new(Notify::new());

        {
            let name = Arc::clone(&name);
            let running = Arc::clone(&running);
            let terminated = Arc::clone(&terminated);
            let terminated_notify = Arc::clone(&terminated_notify);
            runtime.spawn(async move {
                while let Some(job) = receiver.recv().await {
                    running.store(true, Ordering::SeqCst);
                    if let Err(e) = tokio::spawn(job).await {
                        error!("[tasks:{}] task failed: {}", name, e);
                    }
                    running.store(false, Ordering::SeqCst);
                }
                terminated.store(true, Ordering::SeqCst);
                terminated_notify.notify_waiters();
                debug!("[tasks:{}] worker terminated", name);
            });
        }

        Ok(Tasks {
            name,
            sender: Mutex::new(Some(sender)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(1),
            running,
            shutdown: AtomicBool::new(false),
            terminated,
            terminated_notify,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits `task` for ordered execution.
    pub fn run<T, F>(&self, id: TaskId, task: F) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.submit(id, task, None::<fn(&T)>)
    }

    /// Submits `task` and runs `callback` on the worker with its result
    /// before the handle resolves.
    pub fn run_with_callback<T, F, C>(&self, id: TaskId, task: F, callback: C) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = T> + Send + 'static,
        C: FnOnce(&T) + Send + 'static,
    {
        self.submit(id, task, Some(callback))
    }

    fn submit<T, F, C>(&self, id: TaskId, task: F, callback: Option<C>) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = T> + Send + 'static,
        C: FnOnce(&T) + Send + 'static,
    {
        let mut pending = self.pending.lock();

        if let Some(key) = id.coalescing_key() {
            if let Some(existing) = pending.get(key) {
                match existing.handle.downcast_ref::<TaskHandle<T>>() {
                    Some(handle) if !handle.is_done() && !handle.is_abandoned() => {
                        debug!("[tasks:{}] coalescing '{}'", self.name, key);
                        return handle.clone();
                    }
                    Some(_) => {}
                    None => warn!(
                        "[tasks:{}] '{}' resubmitted with a different result type, not coalescing",
                        self.name, key
                    ),
                }
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        let handle = TaskHandle {
            seq,
            executor: Arc::clone(&self.name),
            rx,
        };

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            warn!("[tasks:{}] rejected submission after shutdown", self.name);
            return handle;
        };

        let key = id.coalescing_key().map(str::to_string);
        let job_key = key.clone();
        let job_pending = Arc::clone(&self.pending);
        let job: Job = Box::pin(async move {
            let value = task.await;
            if let Some(key) = job_key {
                let mut pending = job_pending.lock();
                if pending.get(&key).map(|p| p.seq) == Some(seq) {
                    pending.remove(&key);
                }
            }
            if let Some(callback) = callback {
                callback(&value);
            }
            let _ = tx.send(Some(value));
        });

        if sender.send(job).is_err() {
            warn!("[tasks:{}] worker is gone, task dropped", self.name);
            return handle;
        }

        if let Some(key) = key {
            pending.insert(
                key,
                Pending {
                    seq,
                    handle: Box::new(handle.clone()),
                },
            );
        }

        handle
    }

    /// Resolves once every task submitted before this call has run.
    pub async fn barrier(&self) {
        if let Err(e) = self.run(TaskId::Unique, async {}).wait().await {
            debug!("[tasks:{}] barrier skipped: {}", self.name, e);
        }
    }

    /// True while the worker is executing a task body.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops accepting new work without waiting for queued work to finish.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("[tasks:{}] shutting down", self.name);
            self.sender.lock().take();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// True once shut down and every queued task has drained.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub async fn await_termination(&self) {
        loop {
            let notified = self.terminated_notify.notified();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }
}
