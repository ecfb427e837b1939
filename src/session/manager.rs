//! # Session Manager
//!
//! Owns the leading session and everything recorded into it: custom events,
//! timed events, views and orientation changes. It turns session transitions
//! into queued requests and keeps the stored session record current so a
//! process death can be recovered on the next start.
//!
//! All state sits behind one async mutex; a transition and the storage
//! writes it causes happen under the same lock, so requests for a session are
//! queued in call order.

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::events::{feature_of_json, Event, Segmentation, ViewTracker, ORIENTATION_EVENT_KEY};
use super::session::{Recovery, Session};
use crate::consent::{ConsentGate, Feature};
use crate::error::{AgentError, Result};
use crate::host::DeviceMetadata;
use crate::request::{Request, RequestFactory, RequestQueue, PARAM_DEVICE_ID};
use crate::storage::Storable;
use crate::ticker::{Ticker, TickerConfig};
use crate::types::{now_ms, now_ns, secs_to_ns};

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Pending events that force an update
    pub events_buffer_size: usize,
    /// Heartbeat interval while in foreground
    pub update_interval: Duration,
    /// Age after which an un-ended stored session counts as abandoned
    pub cooldown: Duration,
    /// `segment` reported with view events
    pub platform: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            events_buffer_size: 10,
            update_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Nanosecond wall clock used for session timing.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Default)]
struct Inner {
    current: Option<Session>,
    foreground: usize,
    timed: BTreeMap<String, i64>,
    views: ViewTracker,
    orientation: Option<String>,
}

pub struct SessionManager {
    queue: RequestQueue,
    factory: Arc<RequestFactory>,
    consent: Arc<ConsentGate>,
    metadata: Arc<dyn DeviceMetadata>,
    device_id: Arc<RwLock<Option<String>>>,
    settings: SessionSettings,
    inner: tokio::sync::Mutex<Inner>,
    ticker: Mutex<Option<Ticker>>,
    clock: Clock,
}

impl SessionManager {
    pub fn new(
        queue: RequestQueue,
        factory: Arc<RequestFactory>,
        consent: Arc<ConsentGate>,
        metadata: Arc<dyn DeviceMetadata>,
        device_id: Arc<RwLock<Option<String>>>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Self::with_clock(queue, factory, consent, metadata, device_id, settings, Arc::new(now_ns))
    }

    /// Same as [`SessionManager::new`] with session timing read from `clock`.
    pub fn with_clock(
        queue: RequestQueue,
        factory: Arc<RequestFactory>,
        consent: Arc<ConsentGate>,
        metadata: Arc<dyn DeviceMetadata>,
        device_id: Arc<RwLock<Option<String>>>,
        settings: SessionSettings,
        clock: Clock,
    ) -> Arc<Self> {
        Arc::new(SessionManager {
            queue,
            factory,
            consent,
            metadata,
            device_id,
            settings,
            inner: tokio::sync::Mutex::new(Inner::default()),
            ticker: Mutex::new(None),
            clock,
        })
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub async fn foreground_start(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.foreground += 1;
        if inner.foreground > 1 {
            debug!("[sessions] nested foreground start ({})", inner.foreground);
            return Ok(());
        }
        if self.begin_locked(&mut inner).await {
            self.start_ticker();
        }
        Ok(())
    }

    pub async fn foreground_stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.foreground == 0 {
            return Err(AgentError::invalid(
                "foreground stop without a matching start",
            ));
        }
        inner.foreground -= 1;
        if inner.foreground > 0 {
            debug!("[sessions] nested foreground stop ({})", inner.foreground);
            return Ok(());
        }
        self.stop_ticker();
        self.end_locked(&mut inner).await;
        Ok(())
    }

    pub async fn foreground_depth(&self) -> usize {
        self.inner.lock().await.foreground
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.inner.lock().await.current.clone()
    }

    /// Heartbeat: reports elapsed time and flushes pending events.
    pub async fn update(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.update_locked(&mut inner).await
    }

    fn start_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let ticker = Ticker::start(
            "sessions",
            TickerConfig::every(self.settings.update_interval),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.update().await;
                    }
                }
            },
        );
        if let Some(previous) = self.ticker.lock().replace(ticker) {
            previous.stop();
        }
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    fn tag(&self, request: &mut Request, session: Option<&Session>) {
        if request.params.has(PARAM_DEVICE_ID) {
            return;
        }
        let device_id = session
            .and_then(|s| s.device_id().map(str::to_string))
            .or_else(|| self.device_id.read().clone());
        if let Some(device_id) = device_id {
            request.params.add(PARAM_DEVICE_ID, device_id);
        }
    }

    async fn begin_locked(&self, inner: &mut Inner) -> bool {
        if !self.consent.is_consented(Feature::Sessions) {
            debug!("[sessions] no consent, not beginning a session");
            return false;
        }
        if inner.current.as_ref().is_some_and(Session::is_active) {
            return false;
        }

        let mut session = Session::new(self.factory.next_id());
        session.begin(self.now());
        session.set_device_id(self.device_id.read().clone());
        session.set_leading(true);

        if !self.queue.storage().push(&session).await {
            warn!("[sessions] could not persist session {}", session.id());
        }
        match self.factory.session_begin(session.id(), &self.metadata.metrics()) {
            Ok(mut request) => {
                self.tag(&mut request, Some(&session));
                self.queue.push(&request).await;
            }
            Err(e) => error!("[sessions] cannot build begin request: {}", e),
        }

        info!("[sessions] began session {}", session.id());
        inner.views.reset_session();
        inner.current = Some(session);
        true
    }

    async fn update_locked(&self, inner: &mut Inner) -> bool {
        let Some(session) = inner.current.as_mut() else {
            return false;
        };
        let Some(duration) = session.update(self.now()) else {
            return false;
        };
        let events = session.take_events();
        if duration > 0 || !events.is_empty() {
            let mut request = self.factory.session_update(session.id(), duration, &events);
            self.tag(&mut request, Some(&*session));
            self.queue.push(&request).await;
        }
        self.queue.storage().push(&*session).await;
        true
    }

    async fn end_locked(&self, inner: &mut Inner) -> bool {
        let Some(mut session) = inner.current.take() else {
            return false;
        };
        if self.consent.is_consented(Feature::Views) {
            match inner.views.close().and_then(|e| e.map(|e| e.to_json()).transpose()) {
                Ok(Some(json)) => session.add_event(json),
                Ok(None) => {}
                Err(e) => warn!("[sessions] cannot close view: {}", e),
            }
        }
        inner.views.reset_session();
        self.end_session_at(session, self.now()).await
    }

    /// Queues the terminal request for `session`, then deletes its record.
    async fn end_session_at(&self, mut session: Session, ts: i64) -> bool {
        let storage = self.queue.storage();
        let Some(duration) = session.end(ts) else {
            storage.remove(&session).await;
            return false;
        };
        let events = session.take_events();
        let mut request = self.factory.session_end(session.id(), duration, &events);
        self.tag(&mut request, Some(&session));

        if self.queue.push(&request).await {
            storage.remove(&session).await;
            info!("[sessions] ended session {} ({}s)", session.id(), duration);
            true
        } else {
            storage.push(&session).await;
            false
        }
    }

    // ========================================================================
    // EVENTS & VIEWS
    // ========================================================================

    async fn add_event_locked(&self, inner: &mut Inner, json: String) {
        let flush = match inner.current.as_mut() {
            Some(session) if session.is_active() => {
                session.add_event(json);
                session.pending_events().len() >= self.settings.events_buffer_size
            }
            _ => {
                let mut request = self.factory.events(&[json]);
                self.tag(&mut request, None);
                self.queue.push(&request).await;
                return;
            }
        };
        if flush {
            self.update_locked(inner).await;
        } else if let Some(session) = inner.current.as_ref() {
            self.queue.storage().push(session).await;
        }
    }

    pub async fn record_event(&self, event: Event) -> Result<()> {
        if !self.consent.is_consented(Feature::Events) {
            debug!("[sessions] no consent for events, dropping '{}'", event.key);
            return Ok(());
        }
        let json = event.to_json()?;
        let mut inner = self.inner.lock().await;
        self.add_event_locked(&mut inner, json).await;
        Ok(())
    }

    /// Starts timing `key`. Returns `false` if it is already being timed or
    /// events are not consented.
    pub async fn start_event(&self, key: &str) -> Result<bool> {
        if key.trim().is_empty() {
            return Err(AgentError::invalid("event key must not be empty"));
        }
        if !self.consent.is_consented(Feature::Events) {
            return Ok(false);
        }
        let mut inner = self.inner.lock().await;
        if inner.timed.contains_key(key) {
            return Ok(false);
        }
        inner.timed.insert(key.to_string(), now_ms());
        Ok(true)
    }

    /// Stops timing `key` and records it with its duration. Returns `false`
    /// when `key` was not started.
    pub async fn end_event(
        &self,
        key: &str,
        segmentation: Segmentation,
        count: u32,
        sum: Option<f64>,
    ) -> Result<bool> {
        let started = self.inner.lock().await.timed.remove(key);
        let Some(started) = started else {
            return Ok(false);
        };
        let secs = (now_ms() - started).max(0) as f64 / 1000.0;
        let mut event = Event::new(key)?
            .count(count)?
            .segments(segmentation)
            .duration(secs);
        if let Some(sum) = sum {
            event = event.sum(sum);
        }
        self.record_event(event).await?;
        Ok(true)
    }

    pub async fn record_view(&self, name: &str, segmentation: Segmentation) -> Result<()> {
        if !self.consent.is_consented(Feature::Views) {
            debug!("[sessions] no consent for views, dropping '{}'", name);
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let events = inner.views.open(name, &self.settings.platform, segmentation)?;
        for event in events {
            let json = event.to_json()?;
            self.add_event_locked(&mut inner, json).await;
        }
        Ok(())
    }

    /// Emits an orientation event when the reported orientation changed.
    pub async fn configuration_changed(&self) -> Result<()> {
        let Some(orientation) = self.metadata.orientation() else {
            return Ok(());
        };
        let mut inner = self.inner.lock().await;
        if inner.orientation.as_deref() == Some(orientation.as_str()) {
            return Ok(());
        }
        inner.orientation = Some(orientation.clone());
        if !self.consent.is_consented(Feature::Events) {
            return Ok(());
        }
        let json = Event::new(ORIENTATION_EVENT_KEY)?
            .segment("mode", orientation)
            .to_json()?;
        self.add_event_locked(&mut inner, json).await;
        Ok(())
    }

    // ========================================================================
    // RECOVERY, IDENTITY & CONSENT HOOKS
    // ========================================================================

    /// Ends sessions abandoned by a previous process. Returns how many were
    /// ended.
    pub async fn recover(&self) -> usize {
        let inner = self.inner.lock().await;
        let current = inner.current.as_ref().map(Session::id);
        let storage = self.queue.storage();
        let cooldown = secs_to_ns(self.settings.cooldown.as_secs() as i64);
        let now = self.now();
        let mut ended = 0;

        for id in storage.list(Session::PREFIX, 0).await {
            if Some(id) == current {
                continue;
            }
            let Some(session) = storage.read::<Session>(id).await else {
                storage.remove_id(Session::PREFIX, id).await;
                continue;
            };
            match session.recovery(now, cooldown) {
                Recovery::Discard => {
                    debug!("[sessions] discarding stale session {}", id);
                    storage.remove(&session).await;
                }
                Recovery::Keep => debug!("[sessions] session {} is inside cooldown", id),
                Recovery::EndAt(ts) => {
                    info!("[sessions] recovering abandoned session {}", id);
                    if self.end_session_at(session, ts).await {
                        ended += 1;
                    }
                }
            }
        }
        drop(inner);
        ended
    }

    /// Ends the active session under its current identity.
    pub async fn end_for_identity_change(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.end_locked(&mut inner).await
    }

    /// Begins a fresh session if the host is in foreground.
    pub async fn begin_after_identity_change(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.foreground == 0 {
            return false;
        }
        let began = self.begin_locked(&mut inner).await;
        if began {
            self.start_ticker();
        }
        began
    }

    /// Moves the active session to `device_id` without ending it.
    pub async fn retag(&self, device_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.current.as_mut() {
            session.set_device_id(Some(device_id.to_string()));
            self.queue.storage().push(&*session).await;
        }
    }

    /// Sessions consent revoked: forget the session without reporting it.
    pub async fn drop_session(&self) {
        self.stop_ticker();
        let mut inner = self.inner.lock().await;
        inner.views.reset_session();
        if let Some(session) = inner.current.take() {
            info!("[sessions] dropping session {} after consent revocation", session.id());
            self.queue.storage().remove(&session).await;
        }
    }

    /// Events or views consent revoked: discard the pending events that
    /// `feature` owns.
    pub async fn clear_events(&self, feature: Feature) {
        let mut inner = self.inner.lock().await;
        match feature {
            Feature::Events => inner.timed.clear(),
            Feature::Views => inner.views.reset_session(),
            _ => {}
        }
        let Some(session) = inner.current.as_mut() else {
            return;
        };
        let pending = session.take_events();
        let before = pending.len();
        for json in pending {
            let owner = serde_json::from_str::<Value>(&json)
                .map(|event| feature_of_json(&event))
                .unwrap_or(Feature::Events);
            if owner != feature {
                session.add_event(json);
            }
        }
        if session.pending_events().len() != before {
            self.queue.storage().push(&*session).await;
        }
    }

    /// Sessions consent granted while in foreground: begin right away.
    pub async fn resume(self: &Arc<Self>) -> bool {
        self.begin_after_identity_change().await
    }

    /// Ends the active session and stops the heartbeat.
    pub async fn stop(&self) {
        self.stop_ticker();
        let mut inner = self.inner.lock().await;
        self.end_locked(&mut inner).await;
        inner.foreground = 0;
    }
}
