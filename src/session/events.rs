//! Custom events and view tracking.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::consent::Feature;
use crate::error::{AgentError, Result};
use crate::types::{now_ms, CalendarStamp};

pub const VIEW_EVENT_KEY: &str = "[CLY]_view";
pub const ORIENTATION_EVENT_KEY: &str = "[CLY]_orientation";

pub type Segmentation = BTreeMap<String, Value>;

/// Consent feature that owns an event with `key`.
pub fn feature_of_key(key: &str) -> Feature {
    if key == VIEW_EVENT_KEY {
        Feature::Views
    } else {
        Feature::Events
    }
}

/// Consent feature that owns one serialized event. Unparseable entries count
/// as custom events.
pub fn feature_of_json(event: &Value) -> Feature {
    event
        .get("key")
        .and_then(Value::as_str)
        .map(feature_of_key)
        .unwrap_or(Feature::Events)
}

/// One custom event as it appears in an `events` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub key: String,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    /// Duration in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub segmentation: Segmentation,
    pub timestamp: i64,
    pub hour: u32,
    pub dow: u32,
}

impl Event {
    /// Event with `count = 1` stamped now. Empty keys are rejected.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(AgentError::invalid("event key must not be empty"));
        }
        let timestamp = now_ms();
        let stamp = CalendarStamp::at(timestamp);
        Ok(Event {
            key,
            count: 1,
            sum: None,
            dur: None,
            segmentation: Segmentation::new(),
            timestamp,
            hour: stamp.hour,
            dow: stamp.dow,
        })
    }

    pub fn count(mut self, count: u32) -> Result<Self> {
        if count == 0 {
            return Err(AgentError::invalid("event count must be positive"));
        }
        self.count = count;
        Ok(self)
    }

    pub fn sum(mut self, sum: f64) -> Self {
        self.sum = Some(sum);
        self
    }

    pub fn duration(mut self, secs: f64) -> Self {
        self.dur = Some(secs);
        self
    }

    pub fn segment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.segmentation.insert(key.into(), value.into());
        self
    }

    pub fn segments(mut self, segmentation: Segmentation) -> Self {
        self.segmentation.extend(segmentation);
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Tracks the currently displayed view within a session.
#[derive(Debug, Default)]
pub struct ViewTracker {
    current: Option<(String, i64)>,
    started_in_session: bool,
}

impl ViewTracker {
    /// Switches to `name`. Returns the closing event of the previous view, if
    /// any, followed by the opening event of the new one.
    pub fn open(&mut self, name: &str, segment: &str, extra: Segmentation) -> Result<Vec<Event>> {
        if name.trim().is_empty() {
            return Err(AgentError::invalid("view name must not be empty"));
        }
        let mut events = Vec::with_capacity(2);
        if let Some(closing) = self.close_at(now_ms())? {
            events.push(closing);
        }

        let mut opening = Event::new(VIEW_EVENT_KEY)?
            .segment("name", name)
            .segment("visit", 1)
            .segment("segment", segment)
            .segments(extra);
        if !self.started_in_session {
            opening = opening.segment("start", 1);
            self.started_in_session = true;
        }
        self.current = Some((name.to_string(), opening.timestamp));
        events.push(opening);
        Ok(events)
    }

    /// Closes the open view, returning its duration event.
    pub fn close(&mut self) -> Result<Option<Event>> {
        self.close_at(now_ms())
    }

    fn close_at(&mut self, now: i64) -> Result<Option<Event>> {
        let Some((name, opened_at)) = self.current.take() else {
            return Ok(None);
        };
        let secs = (now - opened_at).max(0) as f64 / 1000.0;
        Ok(Some(
            Event::new(VIEW_EVENT_KEY)?
                .segment("name", name)
                .duration(secs.round()),
        ))
    }

    /// Forgets session-scoped state when a session ends.
    pub fn reset_session(&mut self) {
        self.current = None;
        self.started_in_session = false;
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_ref().map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = Event::new("purchase")
            .unwrap()
            .count(2)
            .unwrap()
            .sum(9.99)
            .segment("tier", "gold");
        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["key"], "purchase");
        assert_eq!(json["count"], 2);
        assert_eq!(json["sum"], 9.99);
        assert_eq!(json["segmentation"]["tier"], "gold");
        assert!(json.get("dur").is_none());
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_event_contract_violations() {
        assert!(matches!(Event::new(""), Err(AgentError::InvalidArgument(_))));
        assert!(Event::new("k").unwrap().count(0).is_err());
    }

    #[test]
    fn test_view_sequence() {
        let mut views = ViewTracker::default();
        let first = views.open("home", "Linux", Segmentation::new()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key, VIEW_EVENT_KEY);
        assert_eq!(first[0].segmentation["start"], 1);
        assert_eq!(views.current(), Some("home"));

        let second = views.open("settings", "Linux", Segmentation::new()).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].segmentation["name"], "home");
        assert!(second[0].dur.is_some());
        assert!(second[1].segmentation.get("start").is_none());

        assert!(views.close().unwrap().is_some());
        assert!(views.close().unwrap().is_none());
    }

    #[test]
    fn test_event_owner_feature() {
        let view = Event::new(VIEW_EVENT_KEY).unwrap().to_json().unwrap();
        let custom = Event::new(ORIENTATION_EVENT_KEY).unwrap().to_json().unwrap();
        assert_eq!(feature_of_json(&serde_json::from_str(&view).unwrap()), Feature::Views);
        assert_eq!(feature_of_json(&serde_json::from_str(&custom).unwrap()), Feature::Events);
        assert_eq!(feature_of_json(&Value::Null), Feature::Events);
    }

    #[test]
    fn test_view_start_flag_resets_per_session() {
        let mut views = ViewTracker::default();
        views.open("a", "Linux", Segmentation::new()).unwrap();
        views.reset_session();
        let events = views.open("b", "Linux", Segmentation::new()).unwrap();
        assert_eq!(events[0].segmentation["start"], 1);
    }
}
