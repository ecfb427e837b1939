//! Crash report record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::host::DeviceMetadata;
use crate::storage::Storable;

pub const ANR_TYPE: &str = "anr";

/// One crash as it travels under the `crash` request parameter.
///
/// Persisted as `crash_<id>` before it is turned into a request, so a crash
/// recorded right before the process dies is still shipped on the next start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    #[serde(skip)]
    id: i64,
    #[serde(rename = "_error")]
    pub error: String,
    #[serde(rename = "_nonfatal")]
    pub nonfatal: bool,
    #[serde(rename = "_name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "_logs", default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(rename = "_custom", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
    #[serde(rename = "_type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Seconds the process had been running
    #[serde(rename = "_run", default)]
    pub run: u64,
    #[serde(rename = "_os", default)]
    pub os: String,
    #[serde(rename = "_os_version", default)]
    pub os_version: String,
    #[serde(rename = "_app_version", default)]
    pub app_version: String,
}

impl CrashReport {
    /// Non-fatal report of `error`.
    pub fn new(id: i64, error: impl Into<String>) -> Self {
        CrashReport {
            id,
            error: error.into(),
            nonfatal: true,
            ..Default::default()
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn fatal(mut self, fatal: bool) -> Self {
        self.nonfatal = !fatal;
        self
    }

    pub fn is_fatal(&self) -> bool {
        !self.nonfatal
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn custom(mut self, segments: BTreeMap<String, String>) -> Self {
        self.custom.extend(segments);
        self
    }

    /// Breadcrumbs, oldest first, one per line.
    pub fn logs<S: AsRef<str>>(mut self, lines: &[S]) -> Self {
        if !lines.is_empty() {
            let joined: Vec<&str> = lines.iter().map(AsRef::as_ref).collect();
            self.logs = Some(joined.join("\n"));
        }
        self
    }

    /// Marks the report as a main-loop stall.
    pub fn anr(mut self) -> Self {
        self.kind = Some(ANR_TYPE.to_string());
        self
    }

    pub fn environment(mut self, metadata: &dyn DeviceMetadata, run_secs: u64) -> Self {
        self.os = metadata.os();
        self.os_version = metadata.os_version();
        self.app_version = metadata.app_version();
        self.run = run_secs;
        self
    }
}

impl Storable for CrashReport {
    const PREFIX: &'static str = "crash";

    fn storage_id(&self) -> i64 {
        self.id
    }

    fn store(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn restore(id: i64, data: &[u8]) -> Result<Self> {
        let mut report: CrashReport = serde_json::from_slice(data)?;
        report.id = id;
        Ok(report)
    }
}
