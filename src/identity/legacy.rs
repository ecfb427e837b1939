//! Import of a device id left by a previous SDK installation.

use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const LEGACY_ID_KEY: &str = "device_id";

/// Old-format storage that may hold a device id from an earlier install.
pub trait LegacyIdSource: Send + Sync {
    fn legacy_device_id(&self) -> Option<String>;

    /// Called once the id has been migrated so it is not imported twice.
    fn forget(&self) -> Result<()> {
        Ok(())
    }
}

/// `key=value` properties file with a `device_id=` entry.
#[derive(Debug, Clone)]
pub struct PropertiesFile {
    path: PathBuf,
}

impl PropertiesFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        PropertiesFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn parse(text: &str) -> Option<String> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#') && !line.starts_with('!'))
            .filter_map(|line| line.split_once(['=', ':']))
            .find(|(key, _)| key.trim() == LEGACY_ID_KEY)
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

impl LegacyIdSource for PropertiesFile {
    fn legacy_device_id(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                debug!("[device-id] no legacy file at {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Rewrites the file without the id entry.
    fn forget(&self) -> Result<()> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => return Ok(()),
        };
        let kept: Vec<&str> = text
            .lines()
            .filter(|line| {
                line.split_once(['=', ':'])
                    .map_or(true, |(key, _)| key.trim() != LEGACY_ID_KEY)
            })
            .collect();

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            for line in &kept {
                writeln!(file, "{}", line)?;
            }
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            warn!("[device-id] cannot rewrite legacy file: {}", e);
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_properties() {
        let text = "# old sdk\nserver = https://x\ndevice_id = 123legacy\n";
        assert_eq!(PropertiesFile::parse(text), Some("123legacy".into()));
        assert_eq!(PropertiesFile::parse("device_id=\n"), None);
        assert_eq!(PropertiesFile::parse("#device_id=a\n"), None);
        assert_eq!(PropertiesFile::parse("device_id:abc"), Some("abc".into()));
    }

    #[test]
    fn test_forget_removes_only_the_id() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("legacy.properties");
        fs::write(&path, "a=1\ndevice_id=old\nb=2\n").unwrap();

        let source = PropertiesFile::new(&path);
        assert_eq!(source.legacy_device_id(), Some("old".into()));
        source.forget().unwrap();

        assert_eq!(source.legacy_device_id(), None);
        assert_eq!(fs::read_to_string(&path).unwrap(), "a=1\nb=2\n");
    }

    #[test]
    fn test_missing_file() {
        let source = PropertiesFile::new("/nonexistent/pulse/legacy.properties");
        assert_eq!(source.legacy_device_id(), None);
        assert!(source.forget().is_ok());
    }
}
