//! Sessions, events and views.

pub mod events;
pub mod manager;
#[allow(clippy::module_inception)]
pub mod session;

pub use events::{
    feature_of_json, feature_of_key, Event, Segmentation, ViewTracker, ORIENTATION_EVENT_KEY,
    VIEW_EVENT_KEY,
};
pub use manager::{Clock, SessionManager, SessionSettings};
pub use session::{Recovery, Session, SessionState};
