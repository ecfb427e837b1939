//! # Device Id Manager
//!
//! Resolves the device id on first run, keeps it persisted in `config_0` and
//! carries out identity changes.
//!
//! Resolution order for a fresh install: an id left by a previous SDK
//! installation, then the developer's custom id, then the configured
//! strategy. Acquisition runs on a dedicated `device-id` worker under one
//! coalescing key, so the many lifecycle callbacks that ask for an id resolve
//! it once.
//!
//! Once an id is first known, every queued request built without one is
//! rewritten to carry it.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;

use super::device_id::{generate, DeviceIdentity, IdentityRecord, Realm};
use super::legacy::LegacyIdSource;
use crate::config::{AgentConfig, DeviceIdStrategy};
use crate::error::{AgentError, Result};
use crate::host::AdvertisingIdProvider;
use crate::request::{RequestFactory, RequestQueue};
use crate::session::SessionManager;
use crate::tasks::{TaskHandle, TaskId, Tasks};

const ACQUIRE_KEY: &str = "acquire";

/// Observer of device id assignments and changes.
pub trait DeviceIdListener: Send + Sync {
    /// `old` is set when an existing id is replaced or a legacy id was
    /// imported.
    fn on_device_id(&self, new: &str, old: Option<&str>);
}

#[derive(Debug, Clone, Default)]
pub struct IdentitySettings {
    pub strategy: DeviceIdStrategy,
    pub custom_id: Option<String>,
    pub fallback_allowed: bool,
}

impl IdentitySettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        IdentitySettings {
            strategy: config.device_id_strategy,
            custom_id: config
                .custom_device_id
                .clone()
                .filter(|id| !id.trim().is_empty()),
            fallback_allowed: config.device_id_fallback_allowed,
        }
    }
}

/// Optional host capabilities used during acquisition.
#[derive(Default, Clone)]
pub struct IdentitySources {
    pub advertising: Option<Arc<dyn AdvertisingIdProvider>>,
    pub legacy: Option<Arc<dyn LegacyIdSource>>,
    pub listener: Option<Arc<dyn DeviceIdListener>>,
}

pub struct DeviceIdManager {
    queue: RequestQueue,
    factory: Arc<RequestFactory>,
    sessions: Arc<SessionManager>,
    slot: Arc<RwLock<Option<String>>>,
    settings: IdentitySettings,
    sources: IdentitySources,
    record: RwLock<IdentityRecord>,
    tasks: Tasks,
    change_lock: tokio::sync::Mutex<()>,
}

impl DeviceIdManager {
    pub fn new(
        queue: RequestQueue,
        factory: Arc<RequestFactory>,
        sessions: Arc<SessionManager>,
        slot: Arc<RwLock<Option<String>>>,
        settings: IdentitySettings,
        sources: IdentitySources,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(DeviceIdManager {
            queue,
            factory,
            sessions,
            slot,
            settings,
            sources,
            record: RwLock::new(IdentityRecord::default()),
            tasks: Tasks::new("device-id")?,
            change_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Loads the persisted identities. Returns the stored device id.
    pub async fn load(&self) -> Option<String> {
        let stored = self.queue.storage().read::<IdentityRecord>(0).await;
        let Some(stored) = stored else {
            debug!("[device-id] no stored identity");
            return None;
        };
        let device_id = stored.get(Realm::DeviceId).map(|d| d.id.clone());
        *self.record.write() = stored;
        if let Some(id) = &device_id {
            *self.slot.write() = Some(id.clone());
            info!("[device-id] restored device id {}", id);
        }
        device_id
    }

    pub fn current(&self) -> Option<String> {
        self.slot.read().clone()
    }

    pub fn identity(&self, realm: Realm) -> Option<DeviceIdentity> {
        self.record.read().get(realm).cloned()
    }

    /// Advertising id stored for its realm, else from the provider.
    pub fn advertising_id(&self) -> Option<String> {
        self.identity(Realm::AdvertisingId)
            .map(|d| d.id)
            .or_else(|| self.sources.advertising.as_ref()?.advertising_id())
    }

    // ========================================================================
    // ACQUISITION
    // ========================================================================

    /// Resolves the device id if none is known yet. Coalesces with an
    /// acquisition already pending or running.
    pub fn acquire(self: &Arc<Self>) -> TaskHandle<Option<String>> {
        let this = Arc::clone(self);
        self.tasks
            .run(TaskId::key(ACQUIRE_KEY), async move { this.acquire_now().await })
    }

    async fn acquire_now(&self) -> Option<String> {
        let _guard = self.change_lock.lock().await;
        if let Some(id) = self.current() {
            return Some(id);
        }

        let legacy = self
            .sources
            .legacy
            .as_ref()
            .and_then(|source| source.legacy_device_id());
        if let Some(legacy_id) = legacy {
            info!("[device-id] importing legacy device id");
            let strategy = match self.settings.custom_id {
                Some(_) => DeviceIdStrategy::Custom,
                None => self.settings.strategy,
            };
            let identity = DeviceIdentity::new(Realm::DeviceId, strategy, legacy_id.clone());
            self.adopt(identity, Some(&legacy_id)).await;
            if let Some(source) = &self.sources.legacy {
                if let Err(e) = source.forget() {
                    warn!("[device-id] legacy id not cleared: {}", e);
                }
            }
            return Some(legacy_id);
        }

        let identity = match &self.settings.custom_id {
            Some(custom) => Some(DeviceIdentity::new(
                Realm::DeviceId,
                DeviceIdStrategy::Custom,
                custom.clone(),
            )),
            None => generate(
                self.settings.strategy,
                self.sources.advertising.as_deref(),
                self.settings.fallback_allowed,
            ),
        };
        let Some(identity) = identity else {
            warn!(
                "[device-id] no id available for strategy {:?}, requests are held",
                self.settings.strategy
            );
            return None;
        };
        let id = identity.id.clone();
        self.adopt(identity, None).await;
        Some(id)
    }

    /// First assignment: persist, publish, and tag everything queued so far.
    async fn adopt(&self, identity: DeviceIdentity, listener_old: Option<&str>) {
        let id = identity.id.clone();
        info!("[device-id] acquired device id {} ({:?})", id, identity.strategy);
        self.persist(identity).await;
        *self.slot.write() = Some(id.clone());
        self.queue.inject_device_id(&id).await;
        self.notify(&id, listener_old);
    }

    async fn persist(&self, identity: DeviceIdentity) {
        let record = {
            let mut record = self.record.write();
            record.set(identity);
            record.clone()
        };
        if !self.queue.storage().push(&record).await {
            warn!("[device-id] identity record not persisted");
        }
    }

    fn notify(&self, new: &str, old: Option<&str>) {
        if let Some(listener) = &self.sources.listener {
            listener.on_device_id(new, old);
        }
    }

    // ========================================================================
    // CHANGES
    // ========================================================================

    fn check_new_id(new_id: &str) -> Result<()> {
        if new_id.trim().is_empty() {
            return Err(AgentError::invalid("device id must not be empty"));
        }
        Ok(())
    }

    /// Switches to `new_id` keeping the active session. The server is told to
    /// merge the old id's history into the new one.
    pub async fn change_with_merge(&self, new_id: &str) -> Result<()> {
        Self::check_new_id(new_id)?;
        let _guard = self.change_lock.lock().await;
        let Some(old_id) = self.current() else {
            let identity = DeviceIdentity::new(Realm::DeviceId, DeviceIdStrategy::Custom, new_id);
            self.adopt(identity, None).await;
            return Ok(());
        };
        if old_id == new_id {
            return Ok(());
        }

        info!("[device-id] changing device id with merge");
        self.persist(DeviceIdentity::new(
            Realm::DeviceId,
            DeviceIdStrategy::Custom,
            new_id,
        ))
        .await;
        *self.slot.write() = Some(new_id.to_string());
        self.queue
            .push(&self.factory.device_id_change(new_id, &old_id))
            .await;
        self.sessions.retag(new_id).await;
        self.notify(new_id, Some(&old_id));
        Ok(())
    }

    /// Switches to `new_id` starting over: the active session ends under the
    /// old id and a new one begins under the new id.
    pub async fn change_without_merge(&self, new_id: &str) -> Result<()> {
        Self::check_new_id(new_id)?;
        let _guard = self.change_lock.lock().await;
        let old_id = self.current();
        if old_id.as_deref() == Some(new_id) {
            return Ok(());
        }

        info!("[device-id] changing device id without merge");
        let ended = self.sessions.end_for_identity_change().await;
        let identity = DeviceIdentity::new(Realm::DeviceId, DeviceIdStrategy::Custom, new_id);
        match &old_id {
            Some(_) => {
                self.persist(identity).await;
                *self.slot.write() = Some(new_id.to_string());
            }
            None => self.adopt(identity, None).await,
        }
        if ended {
            self.sessions.begin_after_identity_change().await;
        }
        if old_id.is_some() {
            self.notify(new_id, old_id.as_deref());
        }
        Ok(())
    }

    /// Stores an identity of another realm. Push tokens are registered with
    /// the collector; device ids go through a merge change.
    pub async fn set_identity(&self, realm: Realm, id: &str) -> Result<()> {
        if realm == Realm::DeviceId {
            return self.change_with_merge(id).await;
        }
        let _guard = self.change_lock.lock().await;
        if id.trim().is_empty() {
            let cleared = {
                let mut record = self.record.write();
                record.clear(realm).map(|_| record.clone())
            };
            if let Some(record) = cleared {
                self.queue.storage().push(&record).await;
            }
            return Ok(());
        }
        if self.identity(realm).is_some_and(|d| d.id == id) {
            return Ok(());
        }
        debug!("[device-id] storing {} identity", realm);
        self.persist(DeviceIdentity::new(realm, DeviceIdStrategy::Custom, id))
            .await;
        if realm == Realm::PushToken {
            self.queue.push(&self.factory.push_token(id)).await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.tasks.shutdown();
    }

    pub async fn await_termination(&self) {
        self.tasks.await_termination().await;
    }
}
