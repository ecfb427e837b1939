//! Delivery of queued requests to the collector.
//!
//! - [`http`]: request preparation, checksum, reply classification
//! - [`pinning`]: rustls verifier enforcing key/certificate pins
//! - [`backoff`]: capped exponential retry delay
//! - [`networking`]: the drain loop tying queue and transport together

pub mod backoff;
pub mod http;
pub mod networking;
pub mod pinning;

pub use backoff::Backoff;
pub use http::{
    checksum256, classify, Body, Exchange, ExchangeFuture, HttpReply, Outcome, PreparedRequest,
    ReqwestExchange, Transport,
};
pub use networking::{NetworkStats, Networking};
pub use pinning::{pinned_tls_config, PinSet, PinningVerifier};
