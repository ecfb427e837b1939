//! Network payloads and the durable queue they wait in.

pub mod builder;
pub mod params;
pub mod queue;
#[allow(clippy::module_inception)]
pub mod request;

pub use builder::{RequestFactory, RequiredParams};
pub use params::{Params, PARAM_CHECKSUM, PARAM_DEVICE_ID, PARAM_OLD_DEVICE_ID};
pub use queue::RequestQueue;
pub use request::{Attachment, Request, GET_LENGTH_LIMIT};
