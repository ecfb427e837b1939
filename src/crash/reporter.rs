//! # Crash Reporter
//!
//! Records crashes as `crash_<id>` records and converts them into `crash=`
//! requests. The two steps are separate so that a fatal crash, which cannot
//! await anything, only needs the synchronous write; conversion happens on
//! the next start.
//!
//! Nothing in this module may take the host down while it reports a crash:
//! every failure on the reporting path is logged and dropped.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::Arc;
use std::time::Instant;

use super::report::CrashReport;
use crate::consent::{ConsentGate, Feature};
use crate::error::{AgentError, Result};
use crate::host::DeviceMetadata;
use crate::request::RequestQueue;
use crate::request::RequestFactory;
use crate::storage::Storable;

pub struct CrashReporter {
    queue: RequestQueue,
    factory: Arc<RequestFactory>,
    consent: Arc<ConsentGate>,
    metadata: Arc<dyn DeviceMetadata>,
    breadcrumbs: Mutex<VecDeque<String>>,
    max_breadcrumbs: usize,
    started: Instant,
}

impl CrashReporter {
    pub fn new(
        queue: RequestQueue,
        factory: Arc<RequestFactory>,
        consent: Arc<ConsentGate>,
        metadata: Arc<dyn DeviceMetadata>,
        max_breadcrumbs: usize,
    ) -> Arc<Self> {
        Arc::new(CrashReporter {
            queue,
            factory,
            consent,
            metadata,
            breadcrumbs: Mutex::new(VecDeque::with_capacity(max_breadcrumbs)),
            max_breadcrumbs,
            started: Instant::now(),
        })
    }

    // ========================================================================
    // BREADCRUMBS
    // ========================================================================

    /// Keeps the newest `max_breadcrumbs` lines for the next report.
    pub fn add_breadcrumb(&self, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Err(AgentError::invalid("breadcrumb must not be empty"));
        }
        if self.max_breadcrumbs == 0 {
            return Ok(());
        }
        let mut crumbs = self.breadcrumbs.lock();
        while crumbs.len() >= self.max_breadcrumbs {
            crumbs.pop_front();
        }
        crumbs.push_back(line.to_string());
        Ok(())
    }

    pub fn breadcrumbs(&self) -> Vec<String> {
        self.breadcrumbs.lock().iter().cloned().collect()
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    /// Report skeleton with breadcrumbs and environment filled in.
    fn report(&self, error: String) -> CrashReport {
        let crumbs = self.breadcrumbs();
        CrashReport::new(self.factory.next_id(), error)
            .logs(&crumbs)
            .environment(self.metadata.as_ref(), self.started.elapsed().as_secs())
    }

    /// Records `error` with its source chain. `_name` is the error's type.
    pub async fn record_exception<E>(
        &self,
        error: &E,
        fatal: bool,
        segments: BTreeMap<String, String>,
    ) -> Result<()>
    where
        E: std::error::Error + ?Sized,
    {
        let mut description = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            description.push_str("\ncaused by: ");
            description.push_str(&cause.to_string());
            source = cause.source();
        }
        let report = self
            .report(description)
            .fatal(fatal)
            .name(short_type_name::<E>())
            .custom(segments);
        self.record(report).await;
        Ok(())
    }

    /// Persists `report` and queues it. Returns `false` when crashes are not
    /// consented or it could not be stored.
    pub async fn record(&self, report: CrashReport) -> bool {
        if !self.consent.is_consented(Feature::Crashes) {
            debug!("[crash] no consent, dropping crash report");
            return false;
        }
        if !self.queue.storage().push(&report).await {
            error!("[crash] could not persist crash {}", report.id());
            return false;
        }
        self.convert_pending().await;
        true
    }

    /// Main-loop stall with the watchdog's stack snapshot.
    pub async fn record_stall(&self, snapshot: String) -> bool {
        let report = self
            .report(format!("main loop not responding\n{}", snapshot))
            .anr()
            .fatal(false);
        self.record(report).await
    }

    /// Synchronous fatal record for contexts that cannot await.
    pub fn record_fatal_now(&self, error: String) -> bool {
        if !self.consent.is_consented(Feature::Crashes) {
            return false;
        }
        let report = self.report(error).fatal(true).name("panic");
        self.queue.storage().write_now(&report)
    }

    /// Turns every stored crash record into a queued request. Returns how
    /// many were queued.
    pub async fn convert_pending(&self) -> usize {
        let storage = self.queue.storage();
        let mut queued = 0;
        for id in storage.list(CrashReport::PREFIX, 0).await {
            let Some(report) = storage.read::<CrashReport>(id).await else {
                storage.remove_id(CrashReport::PREFIX, id).await;
                continue;
            };
            let request = match self.factory.crash(&report) {
                Ok(request) => request,
                Err(e) => {
                    warn!("[crash] dropping unencodable crash {}: {}", id, e);
                    storage.remove(&report).await;
                    continue;
                }
            };
            if self.queue.push(&request).await {
                storage.remove(&report).await;
                queued += 1;
            }
        }
        if queued > 0 {
            info!("[crash] queued {} crash reports", queued);
        }
        queued
    }

    /// Deletes unconverted crash records after consent was revoked.
    pub async fn purge(&self) -> usize {
        self.queue.storage().purge(CrashReport::PREFIX).await
    }

    // ========================================================================
    // PANIC HOOK
    // ========================================================================

    /// Records panics as fatal crashes, then hands over to the previous
    /// hook. The hook holds the reporter weakly and becomes a pass-through
    /// once it is dropped.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let reporter = Arc::downgrade(self);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(reporter) = reporter.upgrade() {
                let recorded = panic::catch_unwind(AssertUnwindSafe(|| {
                    reporter.record_fatal_now(panic_description(info))
                }));
                if recorded.is_err() {
                    error!("[crash] panic while recording a panic");
                }
            }
            previous(info);
        }));
        debug!("[crash] panic hook installed");
    }
}

/// Message, location and backtrace of a panic.
pub fn panic_description(info: &PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string());
    let location = info
        .location()
        .map(|l| format!(" at {}:{}", l.file(), l.line()))
        .unwrap_or_default();
    let backtrace = std::backtrace::Backtrace::force_capture();
    format!("{}{}\n{}", message, location, backtrace)
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}
