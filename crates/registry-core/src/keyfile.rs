//! On-disk key files: 32 raw bytes, written via staging file + rename.

use crate::crypto::{random_key, KEY_LEN};
use crate::error::{RegistryError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Load the key at `path`, generating and persisting a fresh one if absent.
pub(crate) fn load_or_generate(path: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if path.exists() {
        return read_key(path);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        restrict_permissions(parent, 0o700);
    }
    let key = random_key();
    write_atomic(path, key.as_ref())?;
    info!(path = %path.display(), "generated new key file");
    Ok(key)
}

pub(crate) fn read_key(path: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let bytes = Zeroizing::new(fs::read(path)?);
    if bytes.len() != KEY_LEN {
        return Err(RegistryError::InvalidKeyMaterial {
            path: path.display().to_string(),
            reason: format!("expected {KEY_LEN} bytes, found {}", bytes.len()),
        });
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Write `bytes` to `dest` without ever exposing a partially written file.
/// On unix the staging file is created owner-only, before any byte lands in it.
pub(crate) fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = parent.join(format!(".{}.staging", Uuid::new_v4()));
    let written = (|| -> std::io::Result<()> {
        let mut file = owner_only().open(&staging)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written.and_then(|_| fs::rename(&staging, dest)) {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }
    fsync_dir(parent);
    Ok(())
}

fn owner_only() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

pub(crate) fn restrict_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}

fn fsync_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Ok(dir) = OpenOptions::new().read(true).open(path) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_once_then_reuses() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("k.key");
        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.as_ref(), second.as_ref());
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k.key");
        fs::write(&path, b"short").unwrap();
        assert!(matches!(
            read_key(&path),
            Err(RegistryError::InvalidKeyMaterial { .. })
        ));
    }

    #[test]
    fn atomic_write_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("k.key");
        write_atomic(&path, &[7u8; KEY_LEN]).unwrap();
        write_atomic(&path, &[9u8; KEY_LEN]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![9u8; KEY_LEN]);
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".staging"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[test]
    fn replaced_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("k.key");
        fs::write(&path, [1u8; KEY_LEN]).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_atomic(&path, &[2u8; KEY_LEN]).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read(&path).unwrap(), vec![2u8; KEY_LEN]);
    }
}
