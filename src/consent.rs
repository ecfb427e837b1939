//! # Consent Gate
//!
//! Tracks which features the user has authorized. Every recording entry point
//! asks [`ConsentGate::is_consented`] before building anything that could reach
//! storage. The gate itself is pure state; persisting it and purging revoked
//! data is done by the agent with [`ConsentRecord`] and [`purge_feature`].

use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{AgentError, Result};
use crate::request::Request;
use crate::session::feature_of_json;
use crate::storage::{Storable, Storage};

/// A consentable feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Sessions,
    Events,
    Views,
    Crashes,
    Location,
    Users,
    Attribution,
    #[serde(rename = "remote-config")]
    RemoteConfig,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::Sessions,
        Feature::Events,
        Feature::Views,
        Feature::Crashes,
        Feature::Location,
        Feature::Users,
        Feature::Attribution,
        Feature::RemoteConfig,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Feature::Sessions => "sessions",
            Feature::Events => "events",
            Feature::Views => "views",
            Feature::Crashes => "crashes",
            Feature::Location => "location",
            Feature::Users => "users",
            Feature::Attribution => "attribution",
            Feature::RemoteConfig => "remote-config",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        Feature::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| AgentError::invalid(format!("unknown feature '{}'", s)))
    }
}

/// Persisted consent flags, stored as `consent_0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub flags: BTreeMap<Feature, bool>,
}

impl Storable for ConsentRecord {
    const PREFIX: &'static str = "consent";

    fn storage_id(&self) -> i64 {
        0
    }

    fn store(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.flags)?)
    }

    fn restore(_id: i64, data: &[u8]) -> Result<Self> {
        Ok(ConsentRecord {
            flags: serde_json::from_slice(data)?,
        })
    }
}

pub struct ConsentGate {
    required: bool,
    enabled: BTreeSet<Feature>,
    groups: BTreeMap<String, Vec<Feature>>,
    granted: RwLock<BTreeMap<Feature, bool>>,
}

impl fmt::Debug for ConsentGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsentGate")
            .field("required", &self.required)
            .field("granted", &*self.granted.read())
            .finish()
    }
}

impl ConsentGate {
    pub fn new(
        required: bool,
        enabled: BTreeSet<Feature>,
        groups: BTreeMap<String, Vec<Feature>>,
    ) -> Self {
        ConsentGate {
            required,
            enabled,
            groups,
            granted: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.enabled.contains(&feature)
    }

    /// True when data for `feature` may be recorded.
    ///
    /// A feature left out of the enabled set is never consented. When consent
    /// is not required every enabled feature counts as consented.
    pub fn is_consented(&self, feature: Feature) -> bool {
        if !self.is_enabled(feature) {
            return false;
        }
        if !self.required {
            return true;
        }
        self.granted.read().get(&feature).copied().unwrap_or(false)
    }

    /// Loads previously persisted flags without reporting changes.
    pub fn restore(&self, record: &ConsentRecord) {
        *self.granted.write() = record.flags.clone();
    }

    pub fn snapshot(&self) -> ConsentRecord {
        ConsentRecord {
            flags: self.granted.read().clone(),
        }
    }

    /// Sets `features` to `value` and returns the features whose effective
    /// state actually changed.
    pub fn set(&self, features: &[Feature], value: bool) -> Vec<Feature> {
        let mut changed = Vec::new();
        let mut granted = self.granted.write();
        for &feature in features {
            if !self.enabled.contains(&feature) {
                continue;
            }
            let before = granted.get(&feature).copied().unwrap_or(false);
            granted.insert(feature, value);
            if before != value && !changed.contains(&feature) {
                changed.push(feature);
            }
        }
        if !changed.is_empty() {
            info!("[consent] {} -> {:?}", if value { "granted" } else { "revoked" }, changed);
        }
        changed
    }

    /// Features of a configured consent group.
    pub fn group(&self, name: &str) -> Result<Vec<Feature>> {
        self.groups
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::invalid(format!("unknown consent group '{}'", name)))
    }
}

/// Deletes queued requests owned by `feature`. Returns how many were dropped.
pub async fn purge_feature(storage: &Storage, feature: Feature) -> usize {
    let removed = storage
        .remove_where::<Request, _>(move |request| request.feature() == Some(feature))
        .await;
    if removed > 0 {
        info!("[consent] purged {} queued {} requests", removed, feature);
    }
    removed
}

const PARAM_EVENTS: &str = "events";

/// Strips events owned by `feature` from every queued `events` batch,
/// including those riding on session requests. Requests left with nothing
/// to report are deleted. Returns how many requests were touched.
pub async fn purge_events(storage: &Storage, feature: Feature) -> usize {
    let rewritten = storage
        .transform(Request::PREFIX, move |id, data| {
            let mut request = Request::restore(id, data).ok()?;
            let events: Vec<Value> = serde_json::from_str(request.params.get(PARAM_EVENTS)?).ok()?;
            let before = events.len();
            let kept: Vec<Value> = events
                .into_iter()
                .filter(|event| feature_of_json(event) != feature)
                .collect();
            if kept.len() == before {
                return None;
            }
            if kept.is_empty() {
                request.params.remove(PARAM_EVENTS);
            } else {
                request.params.set(PARAM_EVENTS, serde_json::to_string(&kept).ok()?);
            }
            request.store().ok()
        })
        .await;

    let emptied = storage
        .remove_where::<Request, _>(|request| {
            !request.params.has(PARAM_EVENTS)
                && (request.feature() == Some(Feature::Events) || is_bare_update(request))
        })
        .await;
    if rewritten > 0 {
        info!(
            "[consent] stripped {} events from {} queued requests ({} deleted)",
            feature, rewritten, emptied
        );
    }
    rewritten
}

/// Session heartbeat that reports neither time nor events.
fn is_bare_update(request: &Request) -> bool {
    let params = &request.params;
    params.has("session_id")
        && !params.has("begin_session")
        && !params.has("end_session")
        && !params.has("session_duration")
}
