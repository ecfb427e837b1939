//! Request transport.
//!
//! Turns a queued [`Request`] into one HTTP exchange with the collector and
//! classifies the reply. The wire call itself sits behind [`Exchange`] so the
//! networking loop can be driven by a scripted double in tests.

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::pinning::{pinned_tls_config, PinSet};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::request::{Attachment, Request, PARAM_CHECKSUM};

/// Characters reserved in a GET line for `&checksum256=<64 hex>`.
const CHECKSUM_ADDITION: usize = 1 + PARAM_CHECKSUM.len() + 1 + 64;

/// What to do with a request after one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered, remove from the queue
    Ok,
    /// Transient failure, keep and try again later
    Retry,
    /// Rejected for good, remove without retrying
    Remove,
}

/// Maps an HTTP status to an [`Outcome`].
pub fn classify(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Ok,
        400..=499 => Outcome::Remove,
        _ => Outcome::Retry,
    }
}

/// SHA-256 hex digest of `payload` followed by `salt`.
pub fn checksum256(payload: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hasher.update(salt.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// GET, everything is in the URL
    Empty,
    /// `application/x-www-form-urlencoded`
    Form(String),
    /// `multipart/form-data` with text fields and one file part
    Multipart {
        fields: Vec<(String, String)>,
        attachment: Attachment,
    },
}

/// A request ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub request_id: i64,
    pub url: String,
    pub body: Body,
}

impl PreparedRequest {
    pub fn is_get(&self) -> bool {
        self.body == Body::Empty
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

pub type ExchangeFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpReply>> + Send + 'a>>;

/// One HTTP round trip. Errors are transport failures (connect, TLS, pin
/// mismatch, timeout), not HTTP error statuses.
pub trait Exchange: Send + Sync {
    fn exchange(&self, request: PreparedRequest) -> ExchangeFuture<'_>;
}

/// Production exchange over reqwest with rustls.
pub struct ReqwestExchange {
    client: reqwest::Client,
}

impl ReqwestExchange {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout() + config.read_timeout());

        if config.has_pins() {
            let pins = PinSet::from_sources(&config.public_key_pins, &config.certificate_pins)?;
            info!("[transport] certificate pinning enabled");
            builder = builder.use_preconfigured_tls(pinned_tls_config(pins));
        }

        let client = builder
            .build()
            .map_err(|e| AgentError::Transport(format!("cannot build HTTP client: {}", e)))?;
        Ok(ReqwestExchange { client })
    }

    async fn round_trip(&self, request: PreparedRequest) -> Result<HttpReply> {
        let builder = match request.body {
            Body::Empty => self.client.get(&request.url),
            Body::Form(body) => self
                .client
                .post(&request.url)
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(body),
            Body::Multipart { fields, attachment } => {
                let mut form = reqwest::multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key, value);
                }
                let part = reqwest::multipart::Part::bytes(attachment.data)
                    .file_name(attachment.file_name)
                    .mime_str(&attachment.content_type)
                    .map_err(|e| AgentError::Transport(format!("bad content type: {}", e)))?;
                self.client
                    .post(&request.url)
                    .multipart(form.part(attachment.name, part))
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(HttpReply { status, body })
    }
}

impl Exchange for ReqwestExchange {
    fn exchange(&self, request: PreparedRequest) -> ExchangeFuture<'_> {
        Box::pin(self.round_trip(request))
    }
}

/// Prepares and sends requests to `<server_url>/i`.
pub struct Transport {
    exchange: Arc<dyn Exchange>,
    base_url: String,
    force_post: bool,
    salt: String,
}

impl Transport {
    pub fn new(config: &AgentConfig, exchange: Arc<dyn Exchange>) -> Self {
        Transport {
            exchange,
            base_url: config.base_url().to_string(),
            force_post: config.force_post,
            salt: config.checksum_salt.clone().unwrap_or_default(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/i", self.base_url)
    }

    /// Read endpoint answering `method=` queries such as remote config.
    pub fn sdk_endpoint(&self) -> String {
        format!("{}/o/sdk", self.base_url)
    }

    /// Chooses GET, form POST or multipart POST and appends the checksum as
    /// the final parameter.
    pub fn prepare(&self, request: &Request) -> PreparedRequest {
        self.prepare_for(request, self.endpoint())
    }

    fn prepare_for(&self, request: &Request, url: String) -> PreparedRequest {

        if let Some(attachment) = request.attachment() {
            let mut fields: Vec<(String, String)> = request
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let joined = fields
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&");
            fields.push((PARAM_CHECKSUM.to_string(), checksum256(&joined, &self.salt)));
            return PreparedRequest {
                request_id: request.id(),
                url,
                body: Body::Multipart {
                    fields,
                    attachment: attachment.clone(),
                },
            };
        }

        let mut params = request.params.clone();
        let checksum = checksum256(&params.to_query(), &self.salt);
        params.add(PARAM_CHECKSUM, checksum);
        let query = params.to_query();

        if !self.force_post && request.is_gettable(&self.base_url, CHECKSUM_ADDITION) {
            PreparedRequest {
                request_id: request.id(),
                url: format!("{}?{}", url, query),
                body: Body::Empty,
            }
        } else {
            PreparedRequest {
                request_id: request.id(),
                url,
                body: Body::Form(query),
            }
        }
    }

    /// Sends `request` to the read endpoint and returns the reply body.
    /// Anything but a 2xx status is an error.
    pub async fn fetch(&self, request: &Request) -> Result<String> {
        let prepared = self.prepare_for(request, self.sdk_endpoint());
        debug!("[transport] fetching {} from {}", request.id(), self.sdk_endpoint());
        let reply = self.exchange.exchange(prepared).await?;
        if classify(reply.status) != Outcome::Ok {
            return Err(AgentError::Transport(format!(
                "server returned {}: {}",
                reply.status, reply.body
            )));
        }
        Ok(reply.body)
    }

    /// One send attempt. Transport failures classify as [`Outcome::Retry`].
    pub async fn send(&self, request: &Request) -> Outcome {
        let prepared = self.prepare(request);
        debug!(
            "[transport] sending {} via {}",
            request.id(),
            if prepared.is_get() { "GET" } else { "POST" }
        );

        match self.exchange.exchange(prepared).await {
            Ok(reply) => {
                let outcome = classify(reply.status);
                match outcome {
                    Outcome::Ok => debug!("[transport] {} delivered ({})", request.id(), reply.status),
                    Outcome::Remove => warn!(
                        "[transport] {} rejected with {}, dropping: {}",
                        request.id(),
                        reply.status,
                        reply.body
                    ),
                    Outcome::Retry => warn!(
                        "[transport] {} got {}, will retry",
                        request.id(),
                        reply.status
                    ),
                }
                outcome
            }
            Err(e) => {
                warn!("[transport] {} failed, will retry: {}", request.id(), e);
                Outcome::Retry
            }
        }
    }
}
