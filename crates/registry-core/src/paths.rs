use crate::error::Result;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "it";
pub const APP_ORG: &str = "municipality";
pub const APP_NAME: &str = "permit-registry";

pub const DATA_DIR_ENV: &str = "PERMIT_REGISTRY_DATA_DIR";
pub const DB_FILE: &str = "registry.db";

/// Where the engine keeps its files. Path resolution ends here; the core
/// never guesses locations on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub db_path: PathBuf,
    pub keys_dir: PathBuf,
    pub safety_root: PathBuf,
    pub backups_dir: PathBuf,
}

impl StorageLayout {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            db_path: dir.join(DB_FILE),
            keys_dir: dir.join("keys"),
            safety_root: dir.join("safety"),
            backups_dir: dir.join("backups"),
        }
    }

    pub fn default_location() -> Result<Self> {
        Ok(Self::in_dir(data_dir()?))
    }
}

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "cannot determine data directory")
    })?;
    Ok(dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_in_dir() {
        let layout = StorageLayout::in_dir("/srv/registry");
        assert_eq!(layout.db_path, PathBuf::from("/srv/registry/registry.db"));
        assert_eq!(layout.keys_dir, PathBuf::from("/srv/registry/keys"));
        assert!(layout.safety_root.starts_with("/srv/registry"));
    }
}
