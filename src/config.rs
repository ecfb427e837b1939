//! Agent configuration.
//!
//! `AgentConfig` is consumed by the agent at construction time. It can be
//! built in code, loaded from a JSON file, and overlaid with environment
//! variables for deployment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::consent::Feature;
use crate::error::{AgentError, Result};

pub const ENV_SERVER_URL: &str = "PULSE_SERVER_URL";
pub const ENV_APP_KEY: &str = "PULSE_APP_KEY";
pub const ENV_STORAGE_DIR: &str = "PULSE_STORAGE_DIR";

/// How the device id is produced when none is stored yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceIdStrategy {
    /// Random UUID generated on first run
    #[default]
    Uuid,
    /// Platform advertising id from the injected provider
    Advertising,
    /// Developer-supplied `custom_device_id`
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector base URL, requests go to `<server_url>/i`
    pub server_url: String,
    pub app_key: String,
    /// Directory holding the record store
    pub storage_dir: PathBuf,
    pub sdk_name: String,
    pub sdk_version: String,

    /// Features compiled into this agent instance
    pub features: BTreeSet<Feature>,
    pub require_consent: bool,
    /// Consents granted at start when consent is required
    pub initial_consents: Vec<Feature>,
    pub consent_groups: BTreeMap<String, Vec<Feature>>,

    pub device_id_strategy: DeviceIdStrategy,
    pub custom_device_id: Option<String>,
    /// Fall back to a UUID when the advertising id is unavailable
    pub device_id_fallback_allowed: bool,
    /// Properties file left by a previous SDK installation
    pub legacy_id_file: Option<PathBuf>,

    /// PEM/DER public keys, inline or as file paths
    pub public_key_pins: Vec<String>,
    /// PEM/DER certificates, inline or as file paths
    pub certificate_pins: Vec<String>,
    pub force_post: bool,
    pub checksum_salt: Option<String>,

    /// Pending events that trigger a session update
    pub events_buffer_size: usize,
    pub update_interval_secs: u64,
    pub session_cooldown_secs: u64,

    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_ceiling_secs: u64,

    /// Main-loop stall detection period, 0 disables the watchdog
    pub anr_timeout_secs: u64,
    /// Record panics as fatal crashes
    pub crash_reporting_hook: bool,
    pub max_breadcrumbs: usize,

    /// Fetch remote config once the device id is known at start
    pub remote_config_automatic_update: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            server_url: String::new(),
            app_key: String::new(),
            storage_dir: PathBuf::from("pulse-data"),
            sdk_name: "pulse-rust".to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            features: Feature::ALL.into_iter().collect(),
            require_consent: false,
            initial_consents: Vec::new(),
            consent_groups: BTreeMap::new(),
            device_id_strategy: DeviceIdStrategy::Uuid,
            custom_device_id: None,
            device_id_fallback_allowed: true,
            legacy_id_file: None,
            public_key_pins: Vec::new(),
            certificate_pins: Vec::new(),
            force_post: false,
            checksum_salt: None,
            events_buffer_size: 10,
            update_interval_secs: 60,
            session_cooldown_secs: 60,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            backoff_base_secs: 5,
            backoff_ceiling_secs: 300,
            anr_timeout_secs: 5,
            crash_reporting_hook: true,
            max_breadcrumbs: 100,
            remote_config_automatic_update: false,
        }
    }
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>, app_key: impl Into<String>) -> Self {
        AgentConfig {
            server_url: server_url.into(),
            app_key: app_key.into(),
            ..Default::default()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Overlays `PULSE_SERVER_URL`, `PULSE_APP_KEY` and `PULSE_STORAGE_DIR`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var(ENV_SERVER_URL) {
            self.server_url = url;
        }
        if let Ok(key) = std::env::var(ENV_APP_KEY) {
            self.app_key = key;
        }
        if let Ok(dir) = std::env::var(ENV_STORAGE_DIR) {
            self.storage_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| AgentError::Config(format!("server_url '{}': {}", self.server_url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(AgentError::Config(format!(
                "server_url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.app_key.trim().is_empty() {
            return Err(AgentError::Config("app_key must not be empty".into()));
        }
        if self.events_buffer_size == 0 {
            return Err(AgentError::Config("events_buffer_size must be positive".into()));
        }
        if self.backoff_base_secs == 0 || self.backoff_ceiling_secs < self.backoff_base_secs {
            return Err(AgentError::Config(format!(
                "backoff must satisfy 0 < base ({}) <= ceiling ({})",
                self.backoff_base_secs, self.backoff_ceiling_secs
            )));
        }
        if self.device_id_strategy == DeviceIdStrategy::Custom
            && self.custom_device_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(AgentError::Config(
                "custom device id strategy needs custom_device_id".into(),
            ));
        }
        for feature in &self.initial_consents {
            if !self.features.contains(feature) {
                return Err(AgentError::Config(format!(
                    "initial consent for disabled feature '{}'",
                    feature
                )));
            }
        }
        Ok(())
    }

    /// Server URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn session_cooldown(&self) -> Duration {
        Duration::from_secs(self.session_cooldown_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_ceiling_secs)
    }

    pub fn anr_timeout(&self) -> Duration {
        Duration::from_secs(self.anr_timeout_secs)
    }

    pub fn has_pins(&self) -> bool {
        !self.public_key_pins.is_empty() || !self.certificate_pins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate_once_endpoint_set() {
        assert!(AgentConfig::default().validate().is_err());
        let config = AgentConfig::new("https://collector.example.com/", "app-key");
        config.validate().unwrap();
        assert_eq!(config.base_url(), "https://collector.example.com");
        assert_eq!(config.features.len(), Feature::ALL.len());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = AgentConfig::new("https://collector.example.com", "key");

        let mut c = base.clone();
        c.server_url = "not a url".into();
        assert!(matches!(c.validate(), Err(AgentError::Config(_))));

        let mut c = base.clone();
        c.app_key = "  ".into();
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.events_buffer_size = 0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.backoff_ceiling_secs = 1;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.device_id_strategy = DeviceIdStrategy::Custom;
        assert!(c.validate().is_err());
        c.custom_device_id = Some("dev-1".into());
        assert!(c.validate().is_ok());

        let mut c = base;
        c.features = [Feature::Sessions].into_iter().collect();
        c.initial_consents = vec![Feature::Crashes];
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_from_json_file_with_partial_fields() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pulse.json");
        std::fs::write(
            &path,
            r#"{
                "server_url": "https://collector.example.com",
                "app_key": "abc",
                "require_consent": true,
                "initial_consents": ["sessions", "crashes"],
                "device_id_strategy": "custom",
                "custom_device_id": "tester"
            }"#,
        )
        .unwrap();

        let config = AgentConfig::from_json_file(&path).unwrap();
        assert!(config.require_consent);
        assert_eq!(config.initial_consents, vec![Feature::Sessions, Feature::Crashes]);
        assert_eq!(config.device_id_strategy, DeviceIdStrategy::Custom);
        assert_eq!(config.events_buffer_size, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json_file_reports_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = AgentConfig::from_json_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
