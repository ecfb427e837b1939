//! # Agent
//!
//! The handle a host application holds. It wires storage, the request queue,
//! sessions, device identity, crash reporting and networking together and is
//! the single place every public recording call passes through the consent
//! gate.
//!
//! ## Start-up
//! 1. Validate configuration, open storage, seed the id generator
//! 2. Restore consent and identity records
//! 3. End sessions abandoned by a previous process, queue leftover crashes
//! 4. Resolve the device id, start the network drain
//!
//! ## Shutdown
//! [`Agent::stop`] ends the active session, stops networking and drains the
//! storage worker. With `clear` every stored record is deleted as well.

use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::consent::{purge_events, purge_feature, ConsentGate, ConsentRecord, Feature};
use crate::crash::{CrashReport, CrashReporter, StallWatchdog};
use crate::error::{AgentError, Result};
use crate::host::{
    AdvertisingIdProvider, DeviceMetadata, HostFuture, HostLifecycle, MainContext,
    StaticMetadata, TokioMainContext,
};
use crate::identity::{
    DeviceIdListener, DeviceIdManager, IdentityRecord, IdentitySettings, IdentitySources,
    LegacyIdSource, PropertiesFile, Realm,
};
use crate::remote_config::{KeyFilter, RemoteConfig, RemoteConfigStore};
use crate::request::{Request, RequestFactory, RequestQueue, RequiredParams};
use crate::session::{Event, Segmentation, Session, SessionManager, SessionSettings};
use crate::storage::{Storable, Storage, StorageStats};
use crate::transport::{Backoff, Exchange, NetworkStats, Networking, ReqwestExchange, Transport};
use crate::types::TimeGenerator;
use crate::user::UserChanges;

// ================================================================================================
// BUILDER
// ================================================================================================

/// Assembles an [`Agent`] from configuration and optional host capabilities.
pub struct AgentBuilder {
    config: AgentConfig,
    exchange: Option<Arc<dyn Exchange>>,
    metadata: Option<Arc<dyn DeviceMetadata>>,
    legacy_ids: Option<Arc<dyn LegacyIdSource>>,
    advertising_ids: Option<Arc<dyn AdvertisingIdProvider>>,
    main_context: Option<Arc<dyn MainContext>>,
    device_id_listener: Option<Arc<dyn DeviceIdListener>>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        AgentBuilder {
            config,
            exchange: None,
            metadata: None,
            legacy_ids: None,
            advertising_ids: None,
            main_context: None,
            device_id_listener: None,
        }
    }

    /// HTTP exchange to use instead of the reqwest client.
    pub fn exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn metadata(mut self, metadata: Arc<dyn DeviceMetadata>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn legacy_ids(mut self, source: Arc<dyn LegacyIdSource>) -> Self {
        self.legacy_ids = Some(source);
        self
    }

    pub fn advertising_ids(mut self, provider: Arc<dyn AdvertisingIdProvider>) -> Self {
        self.advertising_ids = Some(provider);
        self
    }

    pub fn main_context(mut self, context: Arc<dyn MainContext>) -> Self {
        self.main_context = Some(context);
        self
    }

    pub fn device_id_listener(mut self, listener: Arc<dyn DeviceIdListener>) -> Self {
        self.device_id_listener = Some(listener);
        self
    }

    pub async fn build(self) -> Result<Agent> {
        let config = self.config;
        config.validate()?;

        let storage = Storage::open(&config.storage_dir)?;
        let ids = Arc::new(TimeGenerator::new());
        ids.observe(storage.max_id());
        let factory = Arc::new(RequestFactory::new(ids));

        let required = RequiredParams::new(&config.app_key, &config.sdk_name, &config.sdk_version);
        let slot = required.device_id_slot();
        let queue = RequestQueue::new(storage.clone()).tagging(Arc::clone(&slot));

        let consent = Arc::new(ConsentGate::new(
            config.require_consent,
            config.features.clone(),
            config.consent_groups.clone(),
        ));
        if let Some(record) = storage.read::<ConsentRecord>(0).await {
            consent.restore(&record);
        }

        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(StaticMetadata::default()));
        let sessions = SessionManager::new(
            queue.clone(),
            Arc::clone(&factory),
            Arc::clone(&consent),
            Arc::clone(&metadata),
            Arc::clone(&slot),
            SessionSettings {
                events_buffer_size: config.events_buffer_size,
                update_interval: config.update_interval(),
                cooldown: config.session_cooldown(),
                platform: metadata.os(),
            },
        );
        let crashes = CrashReporter::new(
            queue.clone(),
            Arc::clone(&factory),
            Arc::clone(&consent),
            Arc::clone(&metadata),
            config.max_breadcrumbs,
        );

        let legacy = self.legacy_ids.or_else(|| {
            config
                .legacy_id_file
                .as_ref()
                .map(|path| Arc::new(PropertiesFile::new(path)) as Arc<dyn LegacyIdSource>)
        });
        let device_ids = DeviceIdManager::new(
            queue.clone(),
            Arc::clone(&factory),
            Arc::clone(&sessions),
            slot,
            IdentitySettings::from_config(&config),
            IdentitySources {
                advertising: self.advertising_ids,
                legacy,
                listener: self.device_id_listener,
            },
        )?;
        device_ids.load().await;

        let exchange = match self.exchange {
            Some(exchange) => exchange,
            None => Arc::new(ReqwestExchange::new(&config)?),
        };
        let remote_config = RemoteConfig::load(
            storage.clone(),
            Arc::clone(&factory),
            required.clone(),
            Transport::new(&config, Arc::clone(&exchange)),
            Arc::clone(&consent),
            Arc::clone(&metadata),
        )
        .await;
        let networking = Networking::new(
            queue.clone(),
            Transport::new(&config, exchange),
            required,
            Backoff::new(config.backoff_base(), config.backoff_ceiling()),
        )?;

        let agent = Agent {
            storage,
            queue,
            factory,
            consent,
            sessions,
            device_ids,
            crashes,
            remote_config,
            networking,
            watchdog: RwLock::new(None),
            stopped: AtomicBool::new(false),
            config,
        };
        agent.start(self.main_context).await;
        Ok(agent)
    }
}

// ================================================================================================
// AGENT
// ================================================================================================

pub struct Agent {
    config: AgentConfig,
    storage: Storage,
    queue: RequestQueue,
    factory: Arc<RequestFactory>,
    consent: Arc<ConsentGate>,
    sessions: Arc<SessionManager>,
    device_ids: Arc<DeviceIdManager>,
    crashes: Arc<CrashReporter>,
    remote_config: Arc<RemoteConfig>,
    networking: Arc<Networking>,
    watchdog: RwLock<Option<StallWatchdog>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("server_url", &self.config.server_url)
            .field("storage", &self.storage)
            .field("consent", &self.consent)
            .field("device_id", &self.device_ids.current())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    async fn start(&self, main_context: Option<Arc<dyn MainContext>>) {
        if self.consent.is_required() && !self.config.initial_consents.is_empty() {
            let initial = self.config.initial_consents.clone();
            self.change_consent(&initial, true).await;
        }

        let recovered = self.sessions.recover().await;
        let crashes = self.crashes.convert_pending().await;
        if recovered > 0 || crashes > 0 {
            info!(
                "[agent] recovered {} sessions and {} crash reports from a previous run",
                recovered, crashes
            );
        }

        if self.config.crash_reporting_hook {
            self.crashes.install_panic_hook();
        }
        if self.config.anr_timeout_secs > 0 {
            let main = main_context.unwrap_or_else(|| Arc::new(TokioMainContext));
            let reporter = Arc::clone(&self.crashes);
            let watchdog = StallWatchdog::start(main, self.config.anr_timeout(), move |snapshot| {
                let reporter = Arc::clone(&reporter);
                async move {
                    reporter.record_stall(snapshot).await;
                }
            });
            *self.watchdog.write() = Some(watchdog);
        }

        if let Err(e) = self.device_ids.acquire().wait().await {
            warn!("[agent] device id acquisition failed: {}", e);
        }
        self.networking.start(self.config.update_interval());
        if self.config.remote_config_automatic_update {
            let remote_config = Arc::clone(&self.remote_config);
            tokio::spawn(async move {
                if let Err(e) = remote_config.update(KeyFilter::All).await {
                    warn!("[agent] remote config update failed: {}", e);
                }
            });
        }
        info!(
            "[agent] started for {} (device id {})",
            self.config.server_url,
            self.device_ids.current().as_deref().unwrap_or("pending")
        );
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AgentError::Shutdown("agent".to_string()));
        }
        Ok(())
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn device_id(&self) -> Option<String> {
        self.device_ids.current()
    }

    pub fn is_consented(&self, feature: Feature) -> bool {
        self.consent.is_consented(feature)
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.sessions.current_session().await
    }

    // ============================================================================================
    // EVENTS, VIEWS, LOCATION, USER, ATTRIBUTION
    // ============================================================================================

    pub async fn record_event(&self, event: Event) -> Result<()> {
        self.ensure_running()?;
        self.sessions.record_event(event).await
    }

    pub async fn start_event(&self, key: &str) -> Result<bool> {
        self.ensure_running()?;
        self.sessions.start_event(key).await
    }

    pub async fn end_event(
        &self,
        key: &str,
        segmentation: Segmentation,
        count: u32,
        sum: Option<f64>,
    ) -> Result<bool> {
        self.ensure_running()?;
        self.sessions.end_event(key, segmentation, count, sum).await
    }

    pub async fn record_view(&self, name: &str, segmentation: Segmentation) -> Result<()> {
        self.ensure_running()?;
        self.sessions.record_view(name, segmentation).await
    }

    /// Reports the user's location. With every argument `None` the server is
    /// told to forget the location instead.
    pub async fn set_location(
        &self,
        country_code: Option<&str>,
        city: Option<&str>,
        gps: Option<(f64, f64)>,
        ip: Option<&str>,
    ) -> Result<()> {
        self.ensure_running()?;
        if let Some((lat, lon)) = gps {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(AgentError::invalid(format!(
                    "coordinates out of range: {},{}",
                    lat, lon
                )));
            }
        }
        if !self.consent.is_consented(Feature::Location) {
            debug!("[agent] no consent for location");
            return Ok(());
        }
        let request = if country_code.is_none() && city.is_none() && gps.is_none() && ip.is_none() {
            self.factory.location_disabled()
        } else {
            self.factory.location(country_code, city, gps, ip)
        };
        self.queue.push(&request).await;
        Ok(())
    }

    /// Sends profile edits. Returns `false` when nothing was queued.
    pub async fn user_profile(&self, changes: UserChanges) -> Result<bool> {
        self.ensure_running()?;
        if !self.consent.is_consented(Feature::Users) {
            debug!("[agent] no consent for user details");
            return Ok(false);
        }
        if changes.is_empty() {
            return Ok(false);
        }
        let (details, picture) = changes.into_details();
        let request = self.factory.user_details(&details, picture)?;
        Ok(self.queue.push(&request).await)
    }

    /// Reports the campaign that brought the user. The advertising id is
    /// added when one is known.
    pub async fn record_attribution(
        &self,
        campaign_id: &str,
        campaign_user: Option<&str>,
    ) -> Result<()> {
        self.ensure_running()?;
        if campaign_id.trim().is_empty() {
            return Err(AgentError::invalid("campaign id must not be empty"));
        }
        if !self.consent.is_consented(Feature::Attribution) {
            debug!("[agent] no consent for attribution");
            return Ok(());
        }
        let aid = self.device_ids.advertising_id();
        let request = self
            .factory
            .attribution(campaign_id, campaign_user, aid.as_deref());
        self.queue.push(&request).await;
        Ok(())
    }

    // ============================================================================================
    // CRASHES
    // ============================================================================================

    pub async fn record_exception<E>(
        &self,
        error: &E,
        fatal: bool,
        segments: BTreeMap<String, String>,
    ) -> Result<()>
    where
        E: std::error::Error + ?Sized,
    {
        self.ensure_running()?;
        self.crashes.record_exception(error, fatal, segments).await
    }

    /// Records a fully built crash report.
    pub async fn record_crash(&self, report: CrashReport) -> Result<bool> {
        self.ensure_running()?;
        Ok(self.crashes.record(report).await)
    }

    pub fn add_breadcrumb(&self, line: &str) -> Result<()> {
        self.crashes.add_breadcrumb(line)
    }

    // ============================================================================================
    // REMOTE CONFIG
    // ============================================================================================

    /// Fetches remote config values now. Returns `false` when remote config
    /// is not consented.
    pub async fn update_remote_config(&self, filter: KeyFilter) -> Result<bool> {
        self.ensure_running()?;
        self.remote_config.update(filter).await
    }

    /// Last fetched value of `key`, from memory or a previous run.
    pub fn remote_config_value(&self, key: &str) -> Option<Value> {
        self.remote_config.value(key)
    }

    pub fn remote_config_values(&self) -> Map<String, Value> {
        self.remote_config.values()
    }

    // ============================================================================================
    // DEVICE IDENTITY
    // ============================================================================================

    pub async fn change_device_id_with_merge(&self, device_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.device_ids.change_with_merge(device_id).await
    }

    pub async fn change_device_id_without_merge(&self, device_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.device_ids.change_without_merge(device_id).await
    }

    /// Stores an identity of another realm, such as a push token.
    pub async fn set_identity(&self, realm: Realm, id: &str) -> Result<()> {
        self.ensure_running()?;
        self.device_ids.set_identity(realm, id).await
    }

    // ============================================================================================
    // CONSENT
    // ============================================================================================

    pub async fn give_consent(&self, features: &[Feature]) -> Result<()> {
        self.ensure_running()?;
        self.change_consent(features, true).await;
        Ok(())
    }

    pub async fn remove_consent(&self, features: &[Feature]) -> Result<()> {
        self.ensure_running()?;
        self.change_consent(features, false).await;
        Ok(())
    }

    pub async fn give_consent_group(&self, group: &str) -> Result<()> {
        let features = self.consent.group(group)?;
        self.give_consent(&features).await
    }

    pub async fn remove_consent_group(&self, group: &str) -> Result<()> {
        let features = self.consent.group(group)?;
        self.remove_consent(&features).await
    }

    /// Applies a consent change: persist, report, then grant or purge.
    async fn change_consent(&self, features: &[Feature], value: bool) {
        if !self.consent.is_required() {
            debug!("[consent] consent not required, ignoring change");
            return;
        }
        let changed = self.consent.set(features, value);
        if changed.is_empty() {
            return;
        }

        if !self.storage.push(&self.consent.snapshot()).await {
            warn!("[consent] consent record not persisted");
        }
        let flags: BTreeMap<Feature, bool> = changed.iter().map(|&f| (f, value)).collect();
        match self.factory.consent(&flags) {
            Ok(request) => {
                self.queue.push(&request).await;
            }
            Err(e) => warn!("[consent] cannot build consent request: {}", e),
        }

        if value {
            if changed.contains(&Feature::Sessions) {
                self.sessions.resume().await;
            }
            return;
        }
        for feature in changed {
            match feature {
                Feature::Sessions => self.sessions.drop_session().await,
                Feature::Events | Feature::Views => {
                    self.sessions.clear_events(feature).await;
                    purge_events(&self.storage, feature).await;
                    continue;
                }
                Feature::Crashes => {
                    self.crashes.purge().await;
                }
                Feature::RemoteConfig => self.remote_config.clear().await,
                _ => {}
            }
            purge_feature(&self.storage, feature).await;
        }
    }

    // ============================================================================================
    // DELIVERY & LIFECYCLE
    // ============================================================================================

    /// Runs a drain now and returns how many requests were delivered.
    pub async fn flush(&self) -> Result<usize> {
        self.networking.check().wait().await
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.networking.stats()
    }

    pub async fn storage_stats(&self) -> StorageStats {
        self.storage.stats().await
    }

    /// Ends the active session and stops all background work. With `clear`
    /// every stored record is deleted afterwards. Later calls are no-ops.
    pub async fn stop(&self, clear: bool) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("[agent] stopping (clear: {})", clear);
        if let Some(watchdog) = self.watchdog.write().take() {
            watchdog.stop();
        }
        self.sessions.stop().await;

        self.networking.stop();
        self.networking.await_termination().await;
        self.device_ids.stop();
        self.device_ids.await_termination().await;

        if clear {
            let mut removed = 0;
            for prefix in [
                Request::PREFIX,
                Session::PREFIX,
                CrashReport::PREFIX,
                ConsentRecord::PREFIX,
                IdentityRecord::PREFIX,
                RemoteConfigStore::PREFIX,
            ] {
                removed += self.storage.purge(prefix).await;
            }
            info!("[agent] cleared {} stored records", removed);
        }

        self.storage.barrier().await;
        self.storage.shutdown();
        self.storage.await_termination().await;
        Ok(())
    }
}

impl HostLifecycle for Agent {
    fn on_foreground_start(&self) -> HostFuture<'_> {
        Box::pin(async move {
            self.ensure_running()?;
            if self.device_ids.current().is_none() {
                self.device_ids.acquire();
            }
            self.sessions.foreground_start().await
        })
    }

    fn on_foreground_stop(&self) -> HostFuture<'_> {
        Box::pin(async move {
            self.ensure_running()?;
            self.sessions.foreground_stop().await
        })
    }

    fn on_configuration_changed(&self) -> HostFuture<'_> {
        Box::pin(async move {
            self.ensure_running()?;
            self.sessions.configuration_changed().await
        })
    }
}

// ================================================================================================
// PROCESS-WIDE INSTANCE
// ================================================================================================

static INSTANCE: RwLock<Option<Arc<Agent>>> = parking_lot::const_rwlock(None);

/// Builds the process-wide agent. Fails if one is already running.
pub async fn init(config: AgentConfig) -> Result<Arc<Agent>> {
    if INSTANCE.read().is_some() {
        return Err(AgentError::Config("agent is already initialized".to_string()));
    }
    let agent = Arc::new(AgentBuilder::new(config).build().await?);
    let raced = {
        let mut slot = INSTANCE.write();
        match slot.as_ref() {
            Some(_) => true,
            None => {
                *slot = Some(Arc::clone(&agent));
                false
            }
        }
    };
    if raced {
        agent.stop(false).await?;
        return Err(AgentError::Config("agent is already initialized".to_string()));
    }
    Ok(agent)
}

/// The process-wide agent created by [`init`].
pub fn instance() -> Result<Arc<Agent>> {
    INSTANCE.read().clone().ok_or(AgentError::NotInitialized)
}

/// Stops and forgets the process-wide agent.
pub async fn shutdown(clear: bool) -> Result<()> {
    let agent = INSTANCE.write().take().ok_or(AgentError::NotInitialized)?;
    agent.stop(clear).await
}
