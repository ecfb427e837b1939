//! Host integration points.
//!
//! The agent never depends on a UI framework. Hosts drive it through
//! [`HostLifecycle`] and plug platform readers in through the provider traits
//! below; every provider has a usable default.

use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

pub type HostFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Foreground/background notifications from the host application.
///
/// Starts and stops must pair up; nested spans are reference-counted and
/// only the outermost pair begins and ends a session.
pub trait HostLifecycle {
    fn on_foreground_start(&self) -> HostFuture<'_>;
    fn on_foreground_stop(&self) -> HostFuture<'_>;
    fn on_configuration_changed(&self) -> HostFuture<'_>;
}

/// Platform facts reported with sessions and crashes.
pub trait DeviceMetadata: Send + Sync {
    fn os(&self) -> String;
    fn os_version(&self) -> String;
    fn app_version(&self) -> String;

    /// Current screen orientation, when the platform has one.
    fn orientation(&self) -> Option<String> {
        None
    }

    /// `metrics` object attached to `begin_session`.
    fn metrics(&self) -> Value {
        json!({
            "_os": self.os(),
            "_os_version": self.os_version(),
            "_app_version": self.app_version(),
        })
    }
}

/// Metadata from compile-time constants, for hosts without platform readers.
#[derive(Debug, Clone)]
pub struct StaticMetadata {
    pub os: String,
    pub os_version: String,
    pub app_version: String,
}

impl Default for StaticMetadata {
    fn default() -> Self {
        StaticMetadata {
            os: std::env::consts::OS.to_string(),
            os_version: std::env::consts::ARCH.to_string(),
            app_version: "0.0.0".to_string(),
        }
    }
}

impl DeviceMetadata for StaticMetadata {
    fn os(&self) -> String {
        self.os.clone()
    }

    fn os_version(&self) -> String {
        self.os_version.clone()
    }

    fn app_version(&self) -> String {
        self.app_version.clone()
    }
}

/// Source of the platform advertising id.
pub trait AdvertisingIdProvider: Send + Sync {
    fn advertising_id(&self) -> Option<String>;
}

/// The host's main execution context, used by the stall watchdog.
pub trait MainContext: Send + Sync {
    /// Queues `job` to run on the main loop. Must not run it inline.
    fn post(&self, job: Box<dyn FnOnce() + Send>);
}

/// Main context backed by the tokio runtime the agent runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioMainContext;

impl MainContext for TokioMainContext {
    fn post(&self, job: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move { job() });
    }
}
