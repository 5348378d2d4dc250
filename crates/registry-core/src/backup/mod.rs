//! Encrypted, passphrase-protected backup and restore of the whole registry.
//!
//! A backup snapshots the storage file with SQLite's online backup API,
//! packages it with both key files and seals the package under a
//! PBKDF2-derived key. Restore runs the inverse and replaces the live files
//! only after everything has been decrypted and verified. A pre-restore
//! safety copy is taken first and used to roll back if replacement fails
//! partway.
//!
//! The engine shares the store's `AccessGate`. Backups hold it shared; restore
//! holds it exclusively from the safety copy until the keys are reloaded.
//!
//! Every operation reports `Progress` over an optional `mpsc::Sender`; the
//! `spawn_*` helpers run an operation on a worker thread and hand back the
//! receiving end. There is no cancellation once an operation has started.

pub mod archive;
pub mod package;

use crate::crypto::KEY_LEN;
use crate::error::{RegistryError, Result as RegistryResult};
use crate::gate::AccessGate;
use crate::integrity::IntegrityGuard;
use crate::kdf::{self, PassphraseError};
use crate::keyfile;
use crate::paths::StorageLayout;
use crate::store::{schema, RecordStore};
use crate::vault::SymmetricVault;
use archive::ArchiveKind;
use chrono::Local;
use package::Package;
use rusqlite::{Connection, DatabaseName, OpenFlags};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

const SNAPSHOT_FILE: &str = "database.db";
const SAFETY_KEYS_DIR: &str = "keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    DeriveKey,
    SnapshotStorage,
    PackageArchive,
    EncryptArchive,
    WriteOutputFile,
    Cleanup,
    ReadFile,
    ValidateHeader,
    DecryptArchive,
    ExtractPackage,
    SafetyCopy,
    ReplaceLiveFiles,
    ReloadKeyHolders,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::DeriveKey => "key derivation",
            Step::SnapshotStorage => "storage snapshot",
            Step::PackageArchive => "packaging",
            Step::EncryptArchive => "encryption",
            Step::WriteOutputFile => "writing archive",
            Step::Cleanup => "cleanup",
            Step::ReadFile => "reading archive",
            Step::ValidateHeader => "header validation",
            Step::DecryptArchive => "decryption",
            Step::ExtractPackage => "extraction",
            Step::SafetyCopy => "safety copy",
            Step::ReplaceLiveFiles => "replacing live files",
            Step::ReloadKeyHolders => "reloading keys",
        })
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Passphrase(#[from] PassphraseError),
    #[error("Archive not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Not a registry archive")]
    NotAnArchive,
    #[error("Unsupported archive version 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("This file is a {found}, expected a {expected}")]
    WrongArchiveKind { expected: ArchiveKind, found: ArchiveKind },
    #[error("Wrong passphrase or corrupted file")]
    WrongPassphraseOrCorrupted,
    #[error("Archive contents are invalid: {0}")]
    MalformedPackage(String),
    #[error("Failed during {step}: {message}")]
    Step { step: Step, message: String },
    #[error("Restore failed and the registry was rolled back: {message} (safety copy: {})", .safety_copy.display())]
    RolledBack { message: String, safety_copy: PathBuf },
    #[error("Restore failed and rollback failed too: {message}. Recover manually from {}", .safety_copy.display())]
    RollbackFailed { message: String, safety_copy: PathBuf },
    #[error("Backup worker stopped unexpectedly")]
    WorkerPanicked,
}

fn at_step<E: fmt::Display>(step: Step) -> impl FnOnce(E) -> BackupError {
    move |e| BackupError::Step {
        step,
        message: e.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub step: Step,
    /// 1-based position of `step` in the running operation.
    pub index: usize,
    pub total: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub kind: ArchiveKind,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub kind: ArchiveKind,
    pub safety_copy: PathBuf,
}

struct Reporter<'a> {
    tx: Option<&'a Sender<Progress>>,
    index: usize,
    total: usize,
}

impl<'a> Reporter<'a> {
    fn new(tx: Option<&'a Sender<Progress>>, total: usize) -> Self {
        Self { tx, index: 0, total }
    }

    fn step(&mut self, step: Step, message: &str) {
        self.index += 1;
        info!(step = %step, index = self.index, total = self.total, "{}", message);
        if let Some(tx) = self.tx {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(Progress {
                step,
                index: self.index,
                total: self.total,
                message: message.to_string(),
            });
        }
    }
}

/// What the safety copy knows about the storage file.
enum SavedDatabase {
    /// Keys-only restores never touch storage.
    Untouched,
    /// No storage file existed. Rollback removes whatever the restore created.
    Absent,
    Snapshot(PathBuf),
}

/// Live files captured before a restore touches anything.
struct SafetyCopy {
    dir: PathBuf,
    database: SavedDatabase,
    vault_key: Option<PathBuf>,
    integrity_key: Option<PathBuf>,
}

pub struct BackupEngine {
    layout: StorageLayout,
    vault: Arc<SymmetricVault>,
    guard: Arc<IntegrityGuard>,
    gate: Arc<AccessGate>,
    #[cfg(test)]
    fail_after_storage_replace: AtomicBool,
}

impl BackupEngine {
    /// `gate` must be the one every `RecordStore` on `layout` uses; see
    /// [`RecordStore::access_gate`].
    pub fn new(
        layout: StorageLayout,
        vault: Arc<SymmetricVault>,
        guard: Arc<IntegrityGuard>,
        gate: Arc<AccessGate>,
    ) -> Self {
        Self {
            layout,
            vault,
            guard,
            gate,
            #[cfg(test)]
            fail_after_storage_replace: AtomicBool::new(false),
        }
    }

    /// Engine sharing the key holders and the access gate of `store`.
    pub fn for_store(layout: StorageLayout, store: &RecordStore) -> Self {
        Self::new(
            layout,
            Arc::clone(store.vault()),
            Arc::clone(store.guard()),
            store.access_gate(),
        )
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Full backup into `output_dir`. The passphrase is checked before any file is touched.
    pub fn create_backup(
        &self,
        output_dir: &Path,
        passphrase: &str,
        progress: Option<&Sender<Progress>>,
    ) -> Result<BackupReport, BackupError> {
        kdf::validate_passphrase(passphrase)?;
        let _gate = self.gate.shared();
        let mut report = Reporter::new(progress, 6);

        report.step(Step::DeriveKey, "Deriving archive key");
        let derived = kdf::derive(passphrase, None)?;

        report.step(Step::SnapshotStorage, "Taking storage snapshot");
        let work = self.work_dir().map_err(at_step(Step::SnapshotStorage))?;
        let snapshot = work.path().join(SNAPSHOT_FILE);
        self.snapshot_database(&snapshot).map_err(at_step(Step::SnapshotStorage))?;
        let database = fs::read(&snapshot).map_err(at_step(Step::SnapshotStorage))?;

        report.step(Step::PackageArchive, "Packaging snapshot and keys");
        let (vault_key, integrity_key) = self.live_keys().map_err(at_step(Step::PackageArchive))?;
        let package = package::build(ArchiveKind::Full, Some(database.as_slice()), vault_key.as_ref(), integrity_key.as_ref())
            .map_err(at_step(Step::PackageArchive))?;
        drop(database);

        report.step(Step::EncryptArchive, "Encrypting archive");
        let sealed = archive::seal(ArchiveKind::Full, &derived, &package)?;

        report.step(Step::WriteOutputFile, "Writing archive file");
        let path = self.write_archive(output_dir, ArchiveKind::Full, &sealed)?;

        report.step(Step::Cleanup, "Removing temporary files");
        if let Err(e) = work.close() {
            warn!("cannot remove backup working directory: {}", e);
        }

        info!(path = %path.display(), "backup created");
        Ok(BackupReport {
            kind: ArchiveKind::Full,
            path,
            size: sealed.len() as u64,
        })
    }

    /// Keys-only export (version 0x02). Storage is not read.
    pub fn export_keys(
        &self,
        output_dir: &Path,
        passphrase: &str,
        progress: Option<&Sender<Progress>>,
    ) -> Result<BackupReport, BackupError> {
        kdf::validate_passphrase(passphrase)?;
        let _gate = self.gate.shared();
        let mut report = Reporter::new(progress, 4);

        report.step(Step::DeriveKey, "Deriving archive key");
        let derived = kdf::derive(passphrase, None)?;

        report.step(Step::PackageArchive, "Packaging keys");
        let (vault_key, integrity_key) = self.live_keys().map_err(at_step(Step::PackageArchive))?;
        let package = package::build(ArchiveKind::KeysOnly, None, vault_key.as_ref(), integrity_key.as_ref())
            .map_err(at_step(Step::PackageArchive))?;

        report.step(Step::EncryptArchive, "Encrypting archive");
        let sealed = archive::seal(ArchiveKind::KeysOnly, &derived, &package)?;

        report.step(Step::WriteOutputFile, "Writing archive file");
        let path = self.write_archive(output_dir, ArchiveKind::KeysOnly, &sealed)?;

        info!(path = %path.display(), "keys exported");
        Ok(BackupReport {
            kind: ArchiveKind::KeysOnly,
            path,
            size: sealed.len() as u64,
        })
    }

    /// Replace storage and keys with the contents of a full backup.
    pub fn restore_backup(
        &self,
        archive_path: &Path,
        passphrase: &str,
        progress: Option<&Sender<Progress>>,
    ) -> Result<RestoreReport, BackupError> {
        self.restore(ArchiveKind::Full, archive_path, passphrase, progress)
    }

    /// Replace only the key files with the contents of a keys-only export.
    pub fn import_keys(
        &self,
        archive_path: &Path,
        passphrase: &str,
        progress: Option<&Sender<Progress>>,
    ) -> Result<RestoreReport, BackupError> {
        self.restore(ArchiveKind::KeysOnly, archive_path, passphrase, progress)
    }

    fn restore(
        &self,
        kind: ArchiveKind,
        archive_path: &Path,
        passphrase: &str,
        progress: Option<&Sender<Progress>>,
    ) -> Result<RestoreReport, BackupError> {
        kdf::validate_passphrase(passphrase)?;
        let mut report = Reporter::new(progress, 8);

        report.step(Step::ReadFile, "Reading archive");
        let data = match fs::read(archive_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(archive_path.to_path_buf()))
            }
            Err(e) => return Err(at_step(Step::ReadFile)(e)),
        };

        report.step(Step::ValidateHeader, "Validating archive header");
        let (header, ciphertext) = archive::parse(&data)?;
        if header.kind != kind {
            return Err(BackupError::WrongArchiveKind {
                expected: kind,
                found: header.kind,
            });
        }

        report.step(Step::DeriveKey, "Deriving archive key");
        let derived = kdf::derive(passphrase, Some(&header.salt))?;

        report.step(Step::DecryptArchive, "Decrypting archive");
        let plaintext = archive::open(&header, &derived.key, ciphertext)?;

        report.step(Step::ExtractPackage, "Verifying archive contents");
        let package =
            package::extract(&plaintext, kind).map_err(|e| BackupError::MalformedPackage(e.to_string()))?;
        drop(plaintext);
        let work = self.work_dir().map_err(at_step(Step::ExtractPackage))?;
        let staged_db = match &package.database {
            Some(db) => {
                let path = work.path().join(SNAPSHOT_FILE);
                fs::write(&path, db).map_err(at_step(Step::ExtractPackage))?;
                schema::check_readable(&path).map_err(|e| BackupError::MalformedPackage(e.to_string()))?;
                Some(path)
            }
            None => None,
        };

        // Held until the keys are reloaded or rolled back.
        let _exclusive = self.gate.exclusive();
        report.step(Step::SafetyCopy, "Saving current registry state");
        let safety = self
            .take_safety_copy(staged_db.is_some())
            .map_err(at_step(Step::SafetyCopy))?;

        report.step(Step::ReplaceLiveFiles, "Replacing live files");
        if let Err(e) = self.replace_live(staged_db.as_deref(), &package) {
            return Err(self.roll_back(&safety, e));
        }

        report.step(Step::ReloadKeyHolders, "Reloading keys");
        if let Err(e) = self.reload_key_holders() {
            return Err(self.roll_back(&safety, e));
        }

        if let Err(e) = work.close() {
            warn!("cannot remove restore working directory: {}", e);
        }
        info!(kind = %kind, safety_copy = %safety.dir.display(), "restore completed");
        Ok(RestoreReport {
            kind,
            safety_copy: safety.dir,
        })
    }

    pub fn spawn_backup(
        self: &Arc<Self>,
        output_dir: PathBuf,
        passphrase: Zeroizing<String>,
    ) -> io::Result<BackupTask<BackupReport>> {
        self.spawn("registry-backup", move |engine, tx| {
            engine.create_backup(&output_dir, &passphrase, Some(tx))
        })
    }

    pub fn spawn_restore(
        self: &Arc<Self>,
        archive_path: PathBuf,
        passphrase: Zeroizing<String>,
    ) -> io::Result<BackupTask<RestoreReport>> {
        self.spawn("registry-restore", move |engine, tx| {
            engine.restore_backup(&archive_path, &passphrase, Some(tx))
        })
    }

    pub fn spawn_export_keys(
        self: &Arc<Self>,
        output_dir: PathBuf,
        passphrase: Zeroizing<String>,
    ) -> io::Result<BackupTask<BackupReport>> {
        self.spawn("registry-export-keys", move |engine, tx| {
            engine.export_keys(&output_dir, &passphrase, Some(tx))
        })
    }

    pub fn spawn_import_keys(
        self: &Arc<Self>,
        archive_path: PathBuf,
        passphrase: Zeroizing<String>,
    ) -> io::Result<BackupTask<RestoreReport>> {
        self.spawn("registry-import-keys", move |engine, tx| {
            engine.import_keys(&archive_path, &passphrase, Some(tx))
        })
    }

    fn spawn<T, F>(self: &Arc<Self>, name: &str, job: F) -> io::Result<BackupTask<T>>
    where
        T: Send + 'static,
        F: FnOnce(&BackupEngine, &Sender<Progress>) -> Result<T, BackupError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || job(&*engine, &tx))?;
        Ok(BackupTask { progress: rx, handle })
    }

    fn work_dir(&self) -> io::Result<TempDir> {
        fs::create_dir_all(&self.layout.safety_root)?;
        keyfile::restrict_permissions(&self.layout.safety_root, 0o700);
        tempfile::Builder::new()
            .prefix(".work-")
            .tempdir_in(&self.layout.safety_root)
    }

    /// Consistent copy of the live storage file, safe while other connections are open.
    fn snapshot_database(&self, dest: &Path) -> RegistryResult<()> {
        let conn = Connection::open_with_flags(
            &self.layout.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.backup(DatabaseName::Main, dest, None)?;
        keyfile::restrict_permissions(dest, 0o600);
        Ok(())
    }

    /// Copy `source` page by page into the live database. Open readers see the new content.
    fn load_database_from(&self, source: &Path) -> RegistryResult<()> {
        let mut conn = Connection::open(&self.layout.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.restore(DatabaseName::Main, source, None::<fn(rusqlite::backup::Progress)>)?;
        Ok(())
    }

    fn live_keys(&self) -> RegistryResult<(Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>)> {
        Ok((
            keyfile::read_key(self.vault.key_path())?,
            keyfile::read_key(self.guard.key_path())?,
        ))
    }

    fn write_archive(&self, output_dir: &Path, kind: ArchiveKind, sealed: &[u8]) -> Result<PathBuf, BackupError> {
        let name = format!(
            "{}_{}.enc",
            kind.file_prefix(),
            Local::now().format("%Y%m%d_%H%M%S_%3f")
        );
        let path = output_dir.join(name);
        keyfile::write_atomic(&path, sealed).map_err(at_step(Step::WriteOutputFile))?;
        Ok(path)
    }

    fn take_safety_copy(&self, include_database: bool) -> RegistryResult<SafetyCopy> {
        let dir = self
            .layout
            .safety_root
            .join(format!("pre_restore_{}", Local::now().format("%Y%m%d_%H%M%S_%3f")));
        let keys_dir = dir.join(SAFETY_KEYS_DIR);
        fs::create_dir_all(&keys_dir)?;
        keyfile::restrict_permissions(&dir, 0o700);

        let database = if !include_database {
            SavedDatabase::Untouched
        } else if self.layout.db_path.exists() {
            let dest = dir.join(SNAPSHOT_FILE);
            self.snapshot_database(&dest)?;
            SavedDatabase::Snapshot(dest)
        } else {
            SavedDatabase::Absent
        };
        let vault_key = copy_key(self.vault.key_path(), &keys_dir)?;
        let integrity_key = copy_key(self.guard.key_path(), &keys_dir)?;

        info!(path = %dir.display(), "safety copy taken");
        Ok(SafetyCopy {
            dir,
            database,
            vault_key,
            integrity_key,
        })
    }

    /// Storage first, then the key files.
    fn replace_live(&self, staged_db: Option<&Path>, package: &Package) -> RegistryResult<()> {
        if let Some(db) = staged_db {
            self.load_database_from(db)?;
        }
        #[cfg(test)]
        if self.fail_after_storage_replace.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected failure after storage replacement").into());
        }
        keyfile::write_atomic(self.vault.key_path(), package.vault_key.as_ref())?;
        keyfile::write_atomic(self.guard.key_path(), package.integrity_key.as_ref())?;
        Ok(())
    }

    fn reload_key_holders(&self) -> RegistryResult<()> {
        self.vault.reload()?;
        self.guard.reload()?;
        Ok(())
    }

    fn roll_back(&self, safety: &SafetyCopy, cause: RegistryError) -> BackupError {
        let message = cause.to_string();
        error!(safety_copy = %safety.dir.display(), "restore failed, rolling back: {}", message);
        match self.restore_safety_copy(safety) {
            Ok(()) => {
                info!("registry rolled back to pre-restore state");
                BackupError::RolledBack {
                    message,
                    safety_copy: safety.dir.clone(),
                }
            }
            Err(rollback) => {
                error!(safety_copy = %safety.dir.display(), "rollback failed: {}", rollback);
                BackupError::RollbackFailed {
                    message: format!("{message}; rollback: {rollback}"),
                    safety_copy: safety.dir.clone(),
                }
            }
        }
    }

    fn restore_safety_copy(&self, safety: &SafetyCopy) -> RegistryResult<()> {
        match &safety.database {
            SavedDatabase::Snapshot(db) => self.load_database_from(db)?,
            SavedDatabase::Absent => remove_database_files(&self.layout.db_path)?,
            SavedDatabase::Untouched => {}
        }
        restore_key(safety.vault_key.as_deref(), self.vault.key_path())?;
        restore_key(safety.integrity_key.as_deref(), self.guard.key_path())?;
        self.reload_key_holders()
    }
}

fn copy_key(live: &Path, keys_dir: &Path) -> RegistryResult<Option<PathBuf>> {
    let Some(name) = live.file_name() else {
        return Ok(None);
    };
    if !live.exists() {
        return Ok(None);
    }
    let dest = keys_dir.join(name);
    fs::copy(live, &dest)?;
    keyfile::restrict_permissions(&dest, 0o600);
    Ok(Some(dest))
}

/// Put a saved key back, or remove the live one if none existed before.
fn restore_key(saved: Option<&Path>, live: &Path) -> RegistryResult<()> {
    match saved {
        Some(saved) => {
            let bytes = Zeroizing::new(fs::read(saved)?);
            keyfile::write_atomic(live, &bytes)
        }
        None => remove_if_present(live),
    }
}

/// The storage file and its WAL sidecars.
fn remove_database_files(db_path: &Path) -> RegistryResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        remove_if_present(&sidecar(db_path, suffix))?;
    }
    Ok(())
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> RegistryResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// A backup operation running on its own thread.
pub struct BackupTask<T> {
    pub progress: Receiver<Progress>,
    handle: JoinHandle<Result<T, BackupError>>,
}

impl<T> BackupTask<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn wait(self) -> Result<T, BackupError> {
        self.handle.join().unwrap_or(Err(BackupError::WorkerPanicked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::SubscriptionFields;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tempfile::tempdir;

    const PASS: &str = "correct horse battery staple";

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: StorageLayout,
        vault: Arc<SymmetricVault>,
        store: RecordStore,
        engine: Arc<BackupEngine>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::in_dir(dir.path());
        let vault = Arc::new(SymmetricVault::open(&layout.keys_dir).unwrap());
        let guard = Arc::new(IntegrityGuard::open(&layout.keys_dir).unwrap());
        let store = RecordStore::open(&layout.db_path, vault.clone(), guard).unwrap();
        let engine = Arc::new(BackupEngine::for_store(layout.clone(), &store));
        Fixture {
            _dir: dir,
            layout,
            vault,
            store,
            engine,
        }
    }

    fn fields(plate: &str, email: &str) -> SubscriptionFields {
        SubscriptionFields {
            owner_name: "Mario Rossi".into(),
            license_plate: plate.into(),
            email: email.into(),
            address: "Via Roma 1".into(),
            mobile: "3331234567".into(),
            subscription_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            subscription_end: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
            payment_amount: "25.00".parse().unwrap(),
            payment_method: "POS".into(),
        }
    }

    #[test]
    fn weak_passphrase_is_rejected_before_io() {
        let fx = fixture();
        let out = fx.layout.backups_dir.clone();
        let err = fx.engine.create_backup(&out, "short", None).unwrap_err();
        assert!(matches!(err, BackupError::Passphrase(PassphraseError::WeakPassphrase { .. })));
        assert!(!out.exists());
    }

    #[test]
    fn progress_is_reported_per_step() {
        let fx = fixture();
        fx.store.add_subscription(&fields("AB123CD", "a@b.it"), "initial load").unwrap();
        let (tx, rx) = mpsc::channel();
        fx.engine
            .create_backup(&fx.layout.backups_dir, PASS, Some(&tx))
            .unwrap();
        drop(tx);
        let steps: Vec<Progress> = rx.iter().collect();
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[0].step, Step::DeriveKey);
        assert_eq!(steps[5].step, Step::Cleanup);
        assert!(steps.iter().all(|p| p.total == 6));
        assert_eq!(steps.last().unwrap().index, 6);
    }

    #[test]
    fn failure_after_storage_replace_rolls_back() {
        let fx = fixture();
        let id = fx.store.add_subscription(&fields("AB123CD", "before@x.it"), "initial load").unwrap();
        let report = fx.engine.create_backup(&fx.layout.backups_dir, PASS, None).unwrap();

        fx.store
            .update_subscription(&id, &fields("AB123CD", "after@x.it"), "email corrected")
            .unwrap();
        let added = fx.store.add_subscription(&fields("ZZ999ZZ", "new@x.it"), "second record").unwrap();
        let fingerprint = fx.vault.fingerprint();

        fx.engine.fail_after_storage_replace.store(true, Ordering::SeqCst);
        let err = fx.engine.restore_backup(&report.path, PASS, None).unwrap_err();
        let safety_copy = match err {
            BackupError::RolledBack { safety_copy, .. } => safety_copy,
            other => panic!("unexpected error: {other}"),
        };
        assert!(safety_copy.join(SNAPSHOT_FILE).exists());

        assert_eq!(fx.vault.fingerprint(), fingerprint);
        let current = fx.store.get_subscription(&id).unwrap().unwrap();
        assert_eq!(current.fields.email, "after@x.it");
        assert!(fx.store.get_subscription(&added).unwrap().is_some());
        assert!(fx.store.verify_data_integrity().unwrap().all_valid);
    }

    #[test]
    fn rollback_into_fresh_target_removes_restored_storage() {
        let source = fixture();
        source.store.add_subscription(&fields("AB123CD", "a@b.it"), "initial load").unwrap();
        let report = source.engine.create_backup(&source.layout.backups_dir, PASS, None).unwrap();

        // Key holders only: nothing has created the storage file yet.
        let dir = tempdir().unwrap();
        let layout = StorageLayout::in_dir(dir.path());
        let vault = Arc::new(SymmetricVault::open(&layout.keys_dir).unwrap());
        let guard = Arc::new(IntegrityGuard::open(&layout.keys_dir).unwrap());
        let fingerprint = vault.fingerprint();
        let engine = BackupEngine::new(layout.clone(), vault.clone(), guard.clone(), Arc::new(AccessGate::new()));
        assert!(!layout.db_path.exists());

        engine.fail_after_storage_replace.store(true, Ordering::SeqCst);
        let err = engine.restore_backup(&report.path, PASS, None).unwrap_err();
        let safety_copy = match err {
            BackupError::RolledBack { safety_copy, .. } => safety_copy,
            other => panic!("unexpected error: {other}"),
        };
        assert!(!safety_copy.join(SNAPSHOT_FILE).exists());
        for suffix in ["", "-wal", "-shm"] {
            assert!(!sidecar(&layout.db_path, suffix).exists(), "left behind {suffix:?}");
        }
        assert_eq!(vault.fingerprint(), fingerprint);

        let store = RecordStore::open(&layout.db_path, vault, guard).unwrap();
        assert!(store.get_all_subscriptions().unwrap().is_empty());
        assert!(store.verify_data_integrity().unwrap().all_valid);
    }

    #[test]
    fn store_waits_while_restore_holds_the_gate() {
        let fx = fixture();
        assert!(Arc::ptr_eq(&fx.engine.gate, &fx.store.access_gate()));
        let (tx, rx) = mpsc::channel();

        let held = fx.engine.gate.exclusive();
        thread::scope(|s| {
            let store = &fx.store;
            s.spawn(move || {
                let added = store.add_subscription(&fields("AB123CD", "a@b.it"), "during restore");
                let listed = store.get_all_subscriptions().map(|all| all.len());
                tx.send((added.is_ok(), listed.ok())).unwrap();
            });
            assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
            drop(held);
            let (added, listed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert!(added);
            assert_eq!(listed, Some(1));
        });
    }

    #[test]
    fn restore_reverts_later_changes() {
        let fx = fixture();
        let id = fx.store.add_subscription(&fields("AB123CD", "before@x.it"), "initial load").unwrap();
        let report = fx.engine.create_backup(&fx.layout.backups_dir, PASS, None).unwrap();
        fx.store.delete_subscription(&id, "removed by mistake").unwrap();

        let restored = fx.engine.restore_backup(&report.path, PASS, None).unwrap();
        assert!(restored.safety_copy.starts_with(&fx.layout.safety_root));
        let back = fx.store.get_subscription(&id).unwrap().unwrap();
        assert_eq!(back.fields.email, "before@x.it");
        assert!(fx.store.verify_data_integrity().unwrap().all_valid);
    }

    #[test]
    fn spawned_task_streams_progress() {
        let fx = fixture();
        let task = fx
            .engine
            .spawn_export_keys(fx.layout.backups_dir.clone(), Zeroizing::new(PASS.to_string()))
            .unwrap();
        let steps: Vec<Step> = task.progress.iter().map(|p| p.step).collect();
        assert_eq!(
            steps,
            vec![Step::DeriveKey, Step::PackageArchive, Step::EncryptArchive, Step::WriteOutputFile]
        );
        let report = task.wait().unwrap();
        assert_eq!(report.kind, ArchiveKind::KeysOnly);
        assert!(report.path.file_name().unwrap().to_string_lossy().starts_with("registry_keys_"));
    }
}
