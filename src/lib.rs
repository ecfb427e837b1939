//! # Pulse Agent
//!
//! Client-side telemetry agent. Records sessions, events, views, crashes,
//! user profile changes and device identity changes, keeps them in a
//! crash-safe local store and ships them to a collector over HTTP.
//!
//! # Architecture
//! - [`storage`]: one file per record, atomic rename writes, ordered worker
//! - [`tasks`]: single-worker executors with task-id coalescing
//! - [`request`]: parameter multimap, request builders and the durable queue
//! - [`transport`]: GET/POST selection, checksum, pinning, backoff, drain loop
//! - [`session`]: session state machine, events, views, recovery
//! - [`identity`]: device id acquisition, realms and id changes
//! - [`consent`]: per-feature consent gate and revocation purges
//! - [`crash`]: crash records, panic hook, main-loop stall watchdog
//! - [`remote_config`]: collector-served key/value settings, cached on disk
//! - [`agent`]: the handle tying it all together
//!
//! ```no_run
//! use pulse::{AgentBuilder, AgentConfig, HostLifecycle};
//! use pulse::session::Event;
//!
//! # async fn run() -> pulse::Result<()> {
//! let agent = AgentBuilder::new(AgentConfig::new("https://collector.example.com", "app-key"))
//!     .build()
//!     .await?;
//! agent.on_foreground_start().await?;
//! agent.record_event(Event::new("purchase")?.sum(9.99)).await?;
//! agent.on_foreground_stop().await?;
//! agent.stop(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod consent;
pub mod crash;
pub mod error;
pub mod host;
pub mod identity;
pub mod remote_config;
pub mod request;
pub mod session;
pub mod storage;
pub mod tasks;
pub mod ticker;
pub mod transport;
pub mod types;
pub mod user;

pub use agent::{init, instance, shutdown, Agent, AgentBuilder};
pub use config::{AgentConfig, DeviceIdStrategy};
pub use consent::Feature;
pub use error::{AgentError, Result};
pub use host::{AdvertisingIdProvider, DeviceMetadata, HostLifecycle, MainContext};
pub use identity::{DeviceIdListener, LegacyIdSource, Realm};
pub use remote_config::KeyFilter;
pub use user::{Gender, UserChanges};
