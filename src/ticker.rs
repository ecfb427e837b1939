//! Periodic background ticker.
//!
//! Drives the session update heartbeat and the networking queue check. A
//! ticker owns one spawned tokio task that calls its callback on a fixed
//! interval until stopped or dropped. The first callback fires one full
//! interval after start.

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::types::now_ms;

/// Configuration for a ticker.
#[derive(Debug, Clone)]
pub struct TickerConfig {
    /// Interval between callbacks
    pub interval: Duration,
    /// Whether the ticker runs at all
    pub enabled: bool,
}

impl TickerConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            enabled: !interval.is_zero(),
        }
    }
}

pub struct Ticker {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_tick_at: Arc<RwLock<i64>>,
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Ticker {
    /// Spawns the ticker on the current runtime.
    pub fn start<F, Fut>(name: &str, config: TickerConfig, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let last_tick_at = Arc::new(RwLock::new(now_ms()));
        let ticker = Ticker {
            name: name.to_string(),
            handle: Mutex::new(None),
            last_tick_at: Arc::clone(&last_tick_at),
        };

        if !config.enabled {
            info!("[ticker:{}] disabled, skipping", name);
            return ticker;
        }

        info!(
            "[ticker:{}] starting with {}-second interval",
            name,
            config.interval.as_secs()
        );

        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut timer = interval(config.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() completes its first tick immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                debug!("[ticker:{}] tick", task_name);
                callback().await;
                *last_tick_at.write() = now_ms();
            }
        });
        *ticker.handle.lock() = Some(handle);
        ticker
    }

    /// Milliseconds timestamp of the last completed callback, or of start.
    pub fn last_tick(&self) -> i64 {
        *self.last_tick_at.read()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            debug!("[ticker:{}] stopped", self.name);
            handle.abort();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_zero_interval_disables() {
        let config = TickerConfig::every(Duration::ZERO);
        assert!(!config.enabled);
        assert!(TickerConfig::every(Duration::from_secs(60)).enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_each_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let ticker = Ticker::start("test", TickerConfig::every(Duration::from_secs(10)), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(ticker.is_running());

        ticker.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!ticker.is_running());
    }

    #[tokio::test]
    async fn test_disabled_ticker_never_runs() {
        let config = TickerConfig {
            interval: Duration::from_millis(1),
            enabled: false,
        };
        let ticker = Ticker::start("off", config, || async {});
        assert!(!ticker.is_running());
    }
}
