//! Main-loop stall detection.
//!
//! Every period the watchdog posts a tick increment onto the host's main
//! context and then checks whether the counter moved. Two consecutive checks
//! without progress are reported once; reporting re-arms as soon as the main
//! loop makes progress again.

use log::{debug, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::host::MainContext;

/// Consecutive checks without progress that count as a stall.
pub const STALL_CHECKS: u32 = 2;

pub struct StallWatchdog {
    ticks: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StallWatchdog {
    /// Starts watching. `on_stall` receives a backtrace snapshot.
    pub fn start<F, Fut>(main: Arc<dyn MainContext>, period: Duration, on_stall: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ticks = Arc::new(AtomicU64::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));
        let counter = Arc::clone(&ticks);

        let handle = tokio::spawn(async move {
            let mut stalls = 0u32;
            let mut reported = false;
            loop {
                let seen = counter.load(Ordering::SeqCst);
                if !in_flight.swap(true, Ordering::SeqCst) {
                    let counter = Arc::clone(&counter);
                    let in_flight = Arc::clone(&in_flight);
                    main.post(Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        in_flight.store(false, Ordering::SeqCst);
                    }));
                }

                tokio::time::sleep(period).await;

                if counter.load(Ordering::SeqCst) > seen {
                    if reported {
                        debug!("[crash] main loop responsive again");
                    }
                    stalls = 0;
                    reported = false;
                    continue;
                }
                stalls += 1;
                if stalls >= STALL_CHECKS && !reported {
                    warn!("[crash] main loop stalled for {} checks", stalls);
                    reported = true;
                    let snapshot = std::backtrace::Backtrace::force_capture().to_string();
                    on_stall(snapshot).await;
                }
            }
        });

        StallWatchdog {
            ticks,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Ticks the main context has processed.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for StallWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TokioMainContext;

    /// Main context that never runs anything.
    struct Frozen;

    impl MainContext for Frozen {
        fn post(&self, _job: Box<dyn FnOnce() + Send>) {}
    }

    /// Main context that holds jobs until released.
    #[derive(Default)]
    struct Gate {
        jobs: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl Gate {
        fn release(&self) {
            for job in self.jobs.lock().drain(..) {
                job();
            }
        }
    }

    impl MainContext for Gate {
        fn post(&self, job: Box<dyn FnOnce() + Send>) {
            self.jobs.lock().push(job);
        }
    }

    fn counting() -> (Arc<AtomicU64>, impl Fn(String) -> std::future::Ready<()> + Send + Sync) {
        let reports = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&reports);
        (reports, move |_snapshot: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_loop_never_reports() {
        let (reports, on_stall) = counting();
        let watchdog = StallWatchdog::start(Arc::new(TokioMainContext), Duration::from_secs(5), on_stall);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 0);
        assert!(watchdog.ticks() >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_reported_once_after_two_checks() {
        let (reports, on_stall) = counting();
        let _watchdog = StallWatchdog::start(Arc::new(Frozen), Duration::from_secs(5), on_stall);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearms_after_progress() {
        let (reports, on_stall) = counting();
        let gate = Arc::new(Gate::default());
        let _watchdog = StallWatchdog::start(gate.clone(), Duration::from_secs(5), on_stall);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 1);

        gate.release();
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(reports.load(Ordering::SeqCst), 2);
    }
}
