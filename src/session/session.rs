//! Session state machine.
//!
//! A session moves `NotBegun -> Active -> Ended`. Timestamps are wall-clock
//! nanoseconds supplied by the caller, which keeps every transition
//! deterministic and lets recovery reason about sessions written by a
//! previous process.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::Storable;
use crate::types::ns_to_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotBegun,
    Active,
    Ended,
}

/// What start-up recovery does with a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Never begun or already ended: delete the record
    Discard,
    /// Abandoned by a dead process: end it at this timestamp (ns)
    EndAt(i64),
    /// Still inside the cooldown window: leave it alone
    Keep,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: i64,
    began: Option<i64>,
    updated: Option<i64>,
    ended: Option<i64>,
    device_id: Option<String>,
    events: Vec<String>,
    leading: bool,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    began: Option<i64>,
    updated: Option<i64>,
    ended: Option<i64>,
    device_id: Option<String>,
    events: Vec<String>,
    leading: bool,
}

impl Session {
    pub fn new(id: i64) -> Self {
        Session {
            id,
            began: None,
            updated: None,
            ended: None,
            device_id: None,
            events: Vec::new(),
            leading: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match (self.began, self.ended) {
            (None, _) => SessionState::NotBegun,
            (Some(_), None) => SessionState::Active,
            (Some(_), Some(_)) => SessionState::Ended,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn began(&self) -> Option<i64> {
        self.began
    }

    pub fn updated(&self) -> Option<i64> {
        self.updated
    }

    pub fn ended(&self) -> Option<i64> {
        self.ended
    }

    /// Identity the session's requests are sent under.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn set_device_id(&mut self, device_id: Option<String>) {
        self.device_id = device_id;
    }

    pub fn is_leading(&self) -> bool {
        self.leading
    }

    pub fn set_leading(&mut self, leading: bool) {
        self.leading = leading;
    }

    /// Starts the session. Returns `false` when it was already begun.
    pub fn begin(&mut self, ts: i64) -> bool {
        if self.began.is_some() {
            return false;
        }
        self.began = Some(ts);
        true
    }

    /// Records a heartbeat and returns whole seconds since the previous
    /// heartbeat, or since `begin` for the first one. `None` unless active.
    pub fn update(&mut self, ts: i64) -> Option<i64> {
        if !self.is_active() {
            return None;
        }
        let since = self.last_activity()?;
        let ts = ts.max(since);
        self.updated = Some(ts);
        Some(ns_to_secs(ts - since))
    }

    /// Ends the session and returns the seconds not yet reported by an
    /// update. `None` unless active, so a second call is a no-op.
    pub fn end(&mut self, ts: i64) -> Option<i64> {
        if !self.is_active() {
            return None;
        }
        let since = self.last_activity()?;
        let ts = ts.max(since);
        self.ended = Some(ts);
        Some(ns_to_secs(ts - since))
    }

    /// `updated` if set, otherwise `began`.
    pub fn last_activity(&self) -> Option<i64> {
        self.updated.or(self.began)
    }

    pub fn add_event(&mut self, event_json: String) {
        self.events.push(event_json);
    }

    pub fn pending_events(&self) -> &[String] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<String> {
        std::mem::take(&mut self.events)
    }

    pub fn recovery(&self, now: i64, cooldown_ns: i64) -> Recovery {
        match self.state() {
            SessionState::NotBegun | SessionState::Ended => Recovery::Discard,
            SessionState::Active => match self.last_activity() {
                Some(last) if now - last > cooldown_ns => Recovery::EndAt(last),
                Some(_) => Recovery::Keep,
                None => Recovery::Discard,
            },
        }
    }
}

impl Storable for Session {
    const PREFIX: &'static str = "session";

    fn storage_id(&self) -> i64 {
        self.id
    }

    fn store(&self) -> Result<Vec<u8>> {
        let record = SessionRecord {
            began: self.began,
            updated: self.updated,
            ended: self.ended,
            device_id: self.device_id.clone(),
            events: self.events.clone(),
            leading: self.leading,
        };
        Ok(bincode::serialize(&record)?)
    }

    fn restore(id: i64, data: &[u8]) -> Result<Self> {
        let record: SessionRecord = bincode::deserialize(data)?;
        Ok(Session {
            id,
            began: record.began,
            updated: record.updated,
            ended: record.ended,
            device_id: record.device_id,
            events: record.events,
            leading: record.leading,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NS_IN_SECOND;

    #[test]
    fn test_begin_is_idempotent() {
        let mut session = Session::new(1);
        assert!(session.begin(10));
        assert!(!session.begin(20));
        assert_eq!(session.began(), Some(10));
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut session = Session::new(1);
        session.begin(0);
        assert_eq!(session.end(5 * NS_IN_SECOND), Some(5));
        assert_eq!(session.end(9 * NS_IN_SECOND), None);
        assert_eq!(session.ended(), Some(5 * NS_IN_SECOND));
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn test_not_begun_ignores_update_and_end() {
        let mut session = Session::new(1);
        assert_eq!(session.update(100), None);
        assert_eq!(session.end(100), None);
        assert_eq!(session.state(), SessionState::NotBegun);
    }

    #[test]
    fn test_durations_measure_from_previous_update() {
        let mut session = Session::new(1);
        session.begin(0);
        assert_eq!(session.update(123 * NS_IN_SECOND), Some(123));
        assert_eq!(session.end(142 * NS_IN_SECOND), Some(19));
    }

    #[test]
    fn test_update_after_end_ignored() {
        let mut session = Session::new(1);
        session.begin(0);
        session.end(NS_IN_SECOND);
        assert_eq!(session.update(2 * NS_IN_SECOND), None);
        assert_eq!(session.updated(), None);
    }

    #[test]
    fn test_timestamps_stay_monotonic_on_clock_rollback() {
        let mut session = Session::new(1);
        session.begin(100 * NS_IN_SECOND);
        assert_eq!(session.update(90 * NS_IN_SECOND), Some(0));
        assert_eq!(session.updated(), Some(100 * NS_IN_SECOND));
    }

    #[test]
    fn test_recovery_decisions() {
        let cooldown = 60 * NS_IN_SECOND;
        let now = 1_000 * NS_IN_SECOND;

        assert_eq!(Session::new(1).recovery(now, cooldown), Recovery::Discard);

        let mut ended = Session::new(2);
        ended.begin(0);
        ended.end(NS_IN_SECOND);
        assert_eq!(ended.recovery(now, cooldown), Recovery::Discard);

        let mut abandoned = Session::new(3);
        abandoned.begin(100 * NS_IN_SECOND);
        abandoned.update(200 * NS_IN_SECOND);
        assert_eq!(
            abandoned.recovery(now, cooldown),
            Recovery::EndAt(200 * NS_IN_SECOND)
        );

        let mut fresh = Session::new(4);
        fresh.begin(now - NS_IN_SECOND);
        assert_eq!(fresh.recovery(now, cooldown), Recovery::Keep);
    }

    #[test]
    fn test_store_restore() {
        let mut session = Session::new(77);
        session.begin(1);
        session.update(NS_IN_SECOND);
        session.set_device_id(Some("A".into()));
        session.set_leading(true);
        session.add_event(r#"{"key":"a","count":1}"#.into());

        let restored = Session::restore(77, &session.store().unwrap()).unwrap();
        assert_eq!(restored, session);
    }
}
