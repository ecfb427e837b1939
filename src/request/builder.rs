//! Request construction.
//!
//! `RequestFactory` stamps every request with a unique id and the common
//! time parameters, and knows the shape of each request kind. Parameters that
//! may not be known yet at record time (`device_id`) or that never change
//! (`app_key`, SDK identity) are added at send time by [`RequiredParams`].

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::params::{Params, PARAM_DEVICE_ID, PARAM_OLD_DEVICE_ID};
use super::request::{Attachment, Request};
use crate::consent::Feature;
use crate::error::Result;
use crate::types::{CalendarStamp, TimeGenerator};

pub struct RequestFactory {
    ids: Arc<TimeGenerator>,
}

impl RequestFactory {
    pub fn new(ids: Arc<TimeGenerator>) -> Self {
        RequestFactory { ids }
    }

    pub fn next_id(&self) -> i64 {
        self.ids.next()
    }

    /// Empty request with `timestamp`, `hour`, `dow` and `tz`.
    pub fn common(&self, feature: Option<Feature>) -> Request {
        let id = self.ids.next();
        let stamp = CalendarStamp::at(id);
        let params = Params::new()
            .with("timestamp", id)
            .with("hour", stamp.hour)
            .with("dow", stamp.dow)
            .with("tz", stamp.tz_minutes);
        let request = Request::with_params(id, params);
        match feature {
            Some(feature) => request.owned_by(feature),
            None => request,
        }
    }

    pub fn session_begin(&self, session_id: i64, metrics: &Value) -> Result<Request> {
        let mut request = self.common(Some(Feature::Sessions));
        request
            .params
            .add("begin_session", 1)
            .add("session_id", session_id)
            .add_json("metrics", metrics)?;
        Ok(request)
    }

    /// Duration heartbeat. `session_duration` is omitted when zero.
    pub fn session_update(&self, session_id: i64, duration_secs: i64, events: &[String]) -> Request {
        let mut request = self.common(Some(Feature::Sessions));
        request.params.add("session_id", session_id);
        if duration_secs > 0 {
            request.params.add("session_duration", duration_secs);
        }
        add_events(&mut request.params, events);
        request
    }

    pub fn session_end(&self, session_id: i64, duration_secs: i64, events: &[String]) -> Request {
        let mut request = self.common(Some(Feature::Sessions));
        request.params.add("end_session", 1).add("session_id", session_id);
        if duration_secs > 0 {
            request.params.add("session_duration", duration_secs);
        }
        add_events(&mut request.params, events);
        request
    }

    /// Event batch sent outside of any session.
    pub fn events(&self, events: &[String]) -> Request {
        let mut request = self.common(Some(Feature::Events));
        add_events(&mut request.params, events);
        request
    }

    pub fn crash<T: Serialize>(&self, crash: &T) -> Result<Request> {
        let mut request = self.common(Some(Feature::Crashes));
        request.params.add_json("crash", crash)?;
        Ok(request)
    }

    pub fn user_details(&self, details: &Value, picture: Option<Attachment>) -> Result<Request> {
        let mut request = self.common(Some(Feature::Users));
        request.params.add_json("user_details", details)?;
        if let Some(picture) = picture {
            request.attach(picture);
        }
        Ok(request)
    }

    pub fn location(
        &self,
        country_code: Option<&str>,
        city: Option<&str>,
        gps: Option<(f64, f64)>,
        ip: Option<&str>,
    ) -> Request {
        let mut request = self.common(Some(Feature::Location));
        if let Some(cc) = country_code {
            request.params.add("country_code", cc);
        }
        if let Some(city) = city {
            request.params.add("city", city);
        }
        if let Some((lat, lon)) = gps {
            request.params.add("location", format!("{},{}", lat, lon));
        }
        if let Some(ip) = ip {
            request.params.add("ip", ip);
        }
        request
    }

    /// Location cleared: an empty `location` tells the server to forget it.
    pub fn location_disabled(&self) -> Request {
        let mut request = self.common(Some(Feature::Location));
        request.params.add("location", "");
        request
    }

    pub fn attribution(
        &self,
        campaign_id: &str,
        campaign_user: Option<&str>,
        advertising_id: Option<&str>,
    ) -> Request {
        let mut request = self.common(Some(Feature::Attribution));
        request.params.add("campaign_id", campaign_id);
        if let Some(user) = campaign_user {
            request.params.add("campaign_user", user);
        }
        if let Some(aid) = advertising_id {
            request.params.add("aid", aid);
        }
        request
    }

    /// Consent change notice. Never owned by a feature so it survives purges.
    pub fn consent(&self, flags: &BTreeMap<Feature, bool>) -> Result<Request> {
        let mut request = self.common(None);
        request.params.add_json("consent", flags)?;
        Ok(request)
    }

    /// Merge notice carrying both identities.
    pub fn device_id_change(&self, new_id: &str, old_id: &str) -> Request {
        let mut request = self.common(None);
        request
            .params
            .add(PARAM_DEVICE_ID, new_id)
            .add(PARAM_OLD_DEVICE_ID, old_id);
        request
    }

    /// Push token registration for the push-token realm.
    pub fn push_token(&self, token: &str) -> Request {
        let mut request = self.common(None);
        request.params.add("token_session", 1).add("token", token);
        request
    }
}

fn add_events(params: &mut Params, events: &[String]) {
    if !events.is_empty() {
        params.add("events", format!("[{}]", events.join(",")));
    }
}

/// Parameters every request must carry before it goes on the wire.
#[derive(Clone)]
pub struct RequiredParams {
    app_key: String,
    sdk_name: String,
    sdk_version: String,
    device_id: Arc<RwLock<Option<String>>>,
}

impl RequiredParams {
    pub fn new(app_key: &str, sdk_name: &str, sdk_version: &str) -> Self {
        RequiredParams {
            app_key: app_key.to_string(),
            sdk_name: sdk_name.to_string(),
            sdk_version: sdk_version.to_string(),
            device_id: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared slot the identity subsystem keeps current.
    pub fn device_id_slot(&self) -> Arc<RwLock<Option<String>>> {
        Arc::clone(&self.device_id)
    }

    pub fn device_id(&self) -> Option<String> {
        self.device_id.read().clone()
    }

    /// Adds whatever is missing. Returns `false` while the request still
    /// lacks a device id and therefore cannot be sent.
    pub fn complete(&self, params: &mut Params) -> bool {
        if !params.has("app_key") {
            params.add("app_key", &self.app_key);
        }
        if !params.has("sdk_name") {
            params.add("sdk_name", &self.sdk_name);
        }
        if !params.has("sdk_version") {
            params.add("sdk_version", &self.sdk_version);
        }
        if !params.has(PARAM_DEVICE_ID) {
            match self.device_id.read().as_deref() {
                Some(id) => {
                    params.add(PARAM_DEVICE_ID, id);
                }
                None => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> RequestFactory {
        RequestFactory::new(Arc::new(TimeGenerator::new()))
    }

    #[test]
    fn test_common_params_and_unique_ids() {
        let factory = factory();
        let a = factory.common(None);
        let b = factory.common(None);
        assert!(b.id() > a.id());
        for key in ["timestamp", "hour", "dow", "tz"] {
            assert!(a.params.has(key), "missing {}", key);
        }
        assert_eq!(a.params.get("timestamp"), Some(a.id().to_string().as_str()));
    }

    #[test]
    fn test_zero_duration_omitted() {
        let factory = factory();
        let update = factory.session_update(1, 0, &[]);
        assert!(!update.params.has("session_duration"));
        assert!(!update.params.has("events"));

        let end = factory.session_end(1, 19, &[r#"{"key":"a","count":1}"#.to_string()]);
        assert_eq!(end.params.get("end_session"), Some("1"));
        assert_eq!(end.params.get("session_duration"), Some("19"));
        assert_eq!(end.params.get("events"), Some(r#"[{"key":"a","count":1}]"#));
        assert_eq!(end.feature(), Some(Feature::Sessions));
    }

    #[test]
    fn test_consent_request_is_unowned() {
        let mut flags = BTreeMap::new();
        flags.insert(Feature::Events, true);
        let request = factory().consent(&flags).unwrap();
        assert_eq!(request.feature(), None);
        assert_eq!(request.params.get("consent"), Some(r#"{"events":true}"#));
    }

    #[test]
    fn test_required_params_wait_for_device_id() {
        let required = RequiredParams::new("key", "pulse-rust", "1.0");
        let mut params = Params::new().with("events", "[]");
        assert!(!required.complete(&mut params));

        *required.device_id_slot().write() = Some("D1".into());
        let mut params = Params::new().with("events", "[]");
        assert!(required.complete(&mut params));
        assert_eq!(params.get("app_key"), Some("key"));
        assert_eq!(params.get("device_id"), Some("D1"));
    }

    #[test]
    fn test_required_params_keep_explicit_device_id() {
        let required = RequiredParams::new("key", "pulse-rust", "1.0");
        *required.device_id_slot().write() = Some("B".into());
        let mut params = Params::new()
            .with(PARAM_DEVICE_ID, "A")
            .with("end_session", 1);
        assert!(required.complete(&mut params));
        assert_eq!(params.get_all(PARAM_DEVICE_ID).collect::<Vec<_>>(), vec!["A"]);
    }
}
