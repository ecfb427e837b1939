//! Queued network request.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::params::{Params, PARAM_DEVICE_ID};
use crate::consent::Feature;
use crate::error::Result;
use crate::storage::Storable;

/// GET is used only while `url + "/i?" + query` stays below this length.
pub const GET_LENGTH_LIMIT: usize = 1024;

/// Binary payload sent as a multipart file part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A request waiting in storage to be shipped to the collector.
///
/// The `feature` tag records which consent feature produced the request so a
/// later revocation can purge it. It is persisted with the record and never
/// sent over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    id: i64,
    pub params: Params,
    feature: Option<Feature>,
    attachment: Option<Attachment>,
}

#[derive(Serialize, Deserialize)]
struct RequestRecord {
    query: String,
    feature: Option<Feature>,
    attachment: Option<Attachment>,
}

impl Request {
    pub fn new(id: i64) -> Self {
        Self::with_params(id, Params::new())
    }

    pub fn with_params(id: i64, params: Params) -> Self {
        Request {
            id,
            params,
            feature: None,
            attachment: None,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn owned_by(mut self, feature: Feature) -> Self {
        self.feature = Some(feature);
        self
    }

    pub fn feature(&self) -> Option<Feature> {
        self.feature
    }

    pub fn attach(&mut self, attachment: Attachment) {
        self.attachment = Some(attachment);
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// True when the request carries nothing but (at most) a device id.
    pub fn is_empty(&self) -> bool {
        self.attachment.is_none()
            && self.params.iter().all(|(k, _)| k == PARAM_DEVICE_ID)
    }

    /// Whether the encoded request fits a GET line for `server_url`, reserving
    /// `addition` characters for parameters appended at send time.
    pub fn is_gettable(&self, server_url: &str, addition: usize) -> bool {
        self.attachment.is_none()
            && server_url.len() + 3 + self.params.encoded_len() + addition < GET_LENGTH_LIMIT
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.params)
    }
}

impl Storable for Request {
    const PREFIX: &'static str = "request";

    fn storage_id(&self) -> i64 {
        self.id
    }

    fn store(&self) -> Result<Vec<u8>> {
        let record = RequestRecord {
            query: self.params.to_query(),
            feature: self.feature,
            attachment: self.attachment.clone(),
        };
        Ok(bincode::serialize(&record)?)
    }

    fn restore(id: i64, data: &[u8]) -> Result<Self> {
        let record: RequestRecord = bincode::deserialize(data)?;
        Ok(Request {
            id,
            params: Params::from_query(&record.query),
            feature: record.feature,
            attachment: record.attachment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_restore_round_trip() {
        let mut request = Request::with_params(
            42,
            Params::new()
                .with("begin_session", 1)
                .with("events", r#"[{"key":"k","count":1}]"#),
        )
        .owned_by(Feature::Sessions);
        request.attach(Attachment {
            name: "profilePicture".into(),
            file_name: "image".into(),
            content_type: "image/png".into(),
            data: vec![0, 1, 2, 255],
        });

        let restored = Request::restore(42, &request.store().unwrap()).unwrap();
        assert_eq!(restored, request);
    }

    #[test]
    fn test_empty_round_trip() {
        let request = Request::new(7);
        let restored = Request::restore(7, &request.store().unwrap()).unwrap();
        assert_eq!(restored.params, Params::new());
        assert!(restored.is_empty());
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let request = Request::with_params(1, Params::new().with("a", "b"));
        let bytes = request.store().unwrap();
        assert!(Request::restore(1, &bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_gettable_limit() {
        let url = "https://collector.example.com";
        let short = Request::with_params(1, Params::new().with("a", "b"));
        assert!(short.is_gettable(url, 0));

        let long = Request::with_params(2, Params::new().with("a", "x".repeat(1000)));
        assert!(!long.is_gettable(url, 0));

        let edge_len = GET_LENGTH_LIMIT - url.len() - 3 - "a=".len() - 1;
        let edge = Request::with_params(3, Params::new().with("a", "x".repeat(edge_len)));
        assert!(edge.is_gettable(url, 0));
        assert!(!edge.is_gettable(url, 1));
    }

    #[test]
    fn test_only_device_id_is_empty() {
        let request = Request::with_params(1, Params::new().with(PARAM_DEVICE_ID, "abc"));
        assert!(request.is_empty());
    }
}
