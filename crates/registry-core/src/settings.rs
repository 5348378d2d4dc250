use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub audit_query_limit: usize,
    /// Enforced by the operator surfaces, not by the store.
    pub min_reason_chars: usize,
    pub log_filter: String,
    pub backups_dir: Option<PathBuf>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            audit_query_limit: 100,
            min_reason_chars: 10,
            log_filter: "info".into(),
            backups_dir: None,
        }
    }
}

impl RegistrySettings {
    /// Missing file means defaults; a malformed one is an error.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, data_dir: impl AsRef<Path>) -> Result<()> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SETTINGS_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        assert_eq!(RegistrySettings::load(dir.path()).unwrap(), RegistrySettings::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), r#"{"audit_query_limit": 25}"#).unwrap();
        let settings = RegistrySettings::load(dir.path()).unwrap();
        assert_eq!(settings.audit_query_limit, 25);
        assert_eq!(settings.min_reason_chars, 10);
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let settings = RegistrySettings {
            log_filter: "registry_core=debug".into(),
            ..RegistrySettings::default()
        };
        settings.save(dir.path()).unwrap();
        assert_eq!(RegistrySettings::load(dir.path()).unwrap(), settings);
    }
}
