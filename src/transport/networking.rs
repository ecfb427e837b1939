//! Queue drain loop.
//!
//! `Networking` repeatedly takes the oldest queued request, completes its
//! required parameters, sends it and applies the outcome. Drains run on a
//! dedicated `network` worker under one coalescing key, so any number of
//! concurrent triggers (enqueue wake-ups, the periodic ticker, device id
//! acquisition) result in at most one drain in flight.

use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::backoff::Backoff;
use super::http::{Outcome, Transport};
use crate::error::Result;
use crate::request::{RequestQueue, RequiredParams};
use crate::tasks::{TaskHandle, TaskId, Tasks};
use crate::ticker::{Ticker, TickerConfig};

const CHECK_KEY: &str = "network-check";

/// Counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub rejected: u64,
    pub retried: u64,
}

pub struct Networking {
    queue: RequestQueue,
    transport: Transport,
    required: RequiredParams,
    tasks: Tasks,
    backoff: Mutex<Backoff>,
    shutdown: AtomicBool,
    stop_signal: Notify,
    ticker: Mutex<Option<Ticker>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    delivered: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
}

impl Networking {
    pub fn new(
        queue: RequestQueue,
        transport: Transport,
        required: RequiredParams,
        backoff: Backoff,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Networking {
            queue,
            transport,
            required,
            tasks: Tasks::new("network")?,
            backoff: Mutex::new(backoff),
            shutdown: AtomicBool::new(false),
            stop_signal: Notify::new(),
            ticker: Mutex::new(None),
            listener: Mutex::new(None),
            delivered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        }))
    }

    /// Starts draining on every enqueue and every `interval`.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let wake = self.queue.wake_handle();
        let weak = Arc::downgrade(self);
        let listener = tokio::spawn(async move {
            loop {
                wake.notified().await;
                match weak.upgrade() {
                    Some(networking) => {
                        networking.check();
                    }
                    None => break,
                }
            }
        });
        *self.listener.lock() = Some(listener);

        let weak: Weak<Self> = Arc::downgrade(self);
        let ticker = Ticker::start("network", TickerConfig::every(interval), move || {
            let weak = weak.clone();
            async move {
                if let Some(networking) = weak.upgrade() {
                    networking.check();
                }
            }
        });
        *self.ticker.lock() = Some(ticker);

        self.check();
    }

    /// Requests a drain. Coalesces with a drain already pending or running.
    pub fn check(self: &Arc<Self>) -> TaskHandle<usize> {
        let this = Arc::clone(self);
        self.tasks
            .run(TaskId::key(CHECK_KEY), async move { this.drain().await })
    }

    /// True while a drain is in progress.
    pub fn is_sending(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }

    /// Sends until the queue is empty, the head request cannot be sent yet,
    /// or shutdown. Returns the number of requests delivered.
    async fn drain(&self) -> usize {
        let mut delivered = 0;
        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(mut request) = self.queue.oldest().await else {
                break;
            };
            if !self.required.complete(&mut request.params) {
                debug!("[network] request {} waits for a device id", request.id());
                break;
            }

            match self.transport.send(&request).await {
                Outcome::Ok => {
                    self.queue.remove(request.id()).await;
                    self.backoff.lock().reset();
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Outcome::Remove => {
                    self.queue.remove(request.id()).await;
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::Retry => {
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff.lock().next_delay();
                    debug!(
                        "[network] backing off {}s before retrying {}",
                        delay.as_secs(),
                        request.id()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop_signal.notified() => break,
                    }
                }
            }
        }
        delivered
    }

    /// Stops triggering drains. A drain sleeping on backoff is interrupted; a
    /// send already on the wire completes.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.notify_one();
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.tasks.shutdown();
        let stats = self.stats();
        info!(
            "[network] stopped: {} delivered, {} rejected, {} retries",
            stats.delivered, stats.rejected, stats.retried
        );
    }

    pub async fn await_termination(&self) {
        self.tasks.await_termination().await;
    }
}
