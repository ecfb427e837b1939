//! # Remote Config
//!
//! Key/value settings served by the collector. A fetch goes straight to the
//! read endpoint instead of through the request queue because the caller
//! wants the answer now. Fetched values are merged into an in-memory copy and
//! persisted as `remote_config_0` so they are available offline on the next
//! start.

use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::consent::{ConsentGate, Feature};
use crate::error::{AgentError, Result};
use crate::host::DeviceMetadata;
use crate::request::{Request, RequestFactory, RequiredParams};
use crate::storage::{Storable, Storage};
use crate::transport::Transport;

/// Which keys a fetch asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyFilter {
    /// Everything; the stored values are replaced by the answer
    #[default]
    All,
    /// Only these keys, merged into the stored values
    Only(Vec<String>),
    /// Everything but these keys, merged into the stored values
    Except(Vec<String>),
}

/// Cached remote config values, stored as `remote_config_0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteConfigStore {
    pub values: Map<String, Value>,
}

impl RemoteConfigStore {
    /// Overwrites every key present in `fetched`.
    pub fn merge(&mut self, fetched: Map<String, Value>) {
        self.values.extend(fetched);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

impl Storable for RemoteConfigStore {
    const PREFIX: &'static str = "remote_config";

    fn storage_id(&self) -> i64 {
        0
    }

    fn store(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.values)?)
    }

    fn restore(_id: i64, data: &[u8]) -> Result<Self> {
        Ok(RemoteConfigStore {
            values: serde_json::from_slice(data)?,
        })
    }
}

pub struct RemoteConfig {
    storage: Storage,
    factory: Arc<RequestFactory>,
    required: RequiredParams,
    transport: Transport,
    consent: Arc<ConsentGate>,
    metadata: Arc<dyn DeviceMetadata>,
    cache: RwLock<RemoteConfigStore>,
}

impl RemoteConfig {
    /// Creates the module with whatever a previous run left in storage.
    pub async fn load(
        storage: Storage,
        factory: Arc<RequestFactory>,
        required: RequiredParams,
        transport: Transport,
        consent: Arc<ConsentGate>,
        metadata: Arc<dyn DeviceMetadata>,
    ) -> Arc<Self> {
        let cache = storage
            .read::<RemoteConfigStore>(0)
            .await
            .unwrap_or_default();
        debug!("[remote-config] loaded {} cached values", cache.values.len());
        Arc::new(RemoteConfig {
            storage,
            factory,
            required,
            transport,
            consent,
            metadata,
            cache: RwLock::new(cache),
        })
    }

    /// Builds the fetch request. Fails while no device id is known.
    pub fn request(&self, filter: &KeyFilter) -> Result<Request> {
        let mut request = self.factory.common(None);
        request.params.add("method", "fetch_remote_config");
        match filter {
            KeyFilter::Only(keys) if !keys.is_empty() => {
                request.params.add_json("keys", keys)?;
            }
            KeyFilter::Except(keys) if !keys.is_empty() => {
                request.params.add_json("omit_keys", keys)?;
            }
            _ => {}
        }
        request.params.add_json("metrics", &self.metadata.metrics())?;
        if !self.required.complete(&mut request.params) {
            return Err(AgentError::Transport(
                "remote config needs a device id".to_string(),
            ));
        }
        Ok(request)
    }

    /// Fetches values from the collector. Returns `false` without contacting
    /// it when remote config is not consented. On failure the cached values
    /// stay as they were.
    pub async fn update(&self, filter: KeyFilter) -> Result<bool> {
        if !self.consent.is_consented(Feature::RemoteConfig) {
            debug!("[remote-config] no consent, not fetching");
            return Ok(false);
        }
        let request = self.request(&filter)?;
        let body = self.transport.fetch(&request).await?;
        let fetched = match serde_json::from_str::<Value>(&body)? {
            Value::Object(values) => values,
            other => {
                return Err(AgentError::Serialization(format!(
                    "remote config reply is not an object: {}",
                    other
                )))
            }
        };

        let snapshot = {
            let mut cache = self.cache.write();
            if filter == KeyFilter::All {
                cache.values.clear();
            }
            let count = fetched.len();
            cache.merge(fetched);
            info!(
                "[remote-config] merged {} values ({} cached)",
                count,
                cache.values.len()
            );
            cache.clone()
        };
        if !self.storage.push(&snapshot).await {
            warn!("[remote-config] values not persisted");
        }
        Ok(true)
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.cache.read().get(key).cloned()
    }

    pub fn values(&self) -> Map<String, Value> {
        self.cache.read().values.clone()
    }

    /// Forgets every cached value, in memory and in storage.
    pub async fn clear(&self) {
        let record = std::mem::take(&mut *self.cache.write());
        self.storage.remove(&record).await;
    }
}
