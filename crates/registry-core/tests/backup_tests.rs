use chrono::NaiveDate;
use registry_core::actor::ActorInfo;
use registry_core::backup::archive::ArchiveKind;
use registry_core::backup::{BackupEngine, BackupError, Step};
use registry_core::kdf::PassphraseError;
use registry_core::store::models::SubscriptionFields;
use registry_core::{IntegrityGuard, RecordStore, StorageLayout, SymmetricVault};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use zeroize::Zeroizing;

const PASSPHRASE: &str = "seventeen chars!!";

struct Registry {
    _dir: TempDir,
    layout: StorageLayout,
    vault: Arc<SymmetricVault>,
    store: RecordStore,
    engine: Arc<BackupEngine>,
}

impl Registry {
    fn open() -> Self {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::in_dir(dir.path());
        let vault = Arc::new(SymmetricVault::open(&layout.keys_dir).unwrap());
        let guard = Arc::new(IntegrityGuard::open(&layout.keys_dir).unwrap());
        let store = RecordStore::open(&layout.db_path, vault.clone(), guard)
            .unwrap()
            .with_actor(ActorInfo {
                user: "archivist".into(),
                host: None,
                ip: None,
            });
        let engine = Arc::new(BackupEngine::for_store(layout.clone(), &store));
        Self {
            _dir: dir,
            layout,
            vault,
            store,
            engine,
        }
    }

    fn pre_restore_dirs(&self) -> usize {
        self.safety_entries("pre_restore_")
    }

    fn safety_entries(&self, prefix: &str) -> usize {
        match fs::read_dir(&self.layout.safety_root) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
                .count(),
            Err(_) => 0,
        }
    }
}

fn permit(owner: &str, plate: &str, amount: &str) -> SubscriptionFields {
    SubscriptionFields {
        owner_name: owner.into(),
        license_plate: plate.into(),
        email: "resident@example.it".into(),
        address: "Piazza Castello 1".into(),
        mobile: "3471112233".into(),
        subscription_start: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
        subscription_end: NaiveDate::from_ymd_opt(2027, 3, 31).unwrap(),
        payment_amount: amount.parse().unwrap(),
        payment_method: "pos".into(),
    }
}

fn rewrite_version_byte(path: &Path, version: u8) {
    let mut bytes = fs::read(path).unwrap();
    bytes[5] = version;
    fs::write(path, bytes).unwrap();
}

#[test]
fn backup_restores_into_empty_registry() {
    let source = Registry::open();
    source.store.add_subscription(&permit("Giulia Bianchi", "AB123CD", "120.00"), "new resident permit").unwrap();
    source.store.add_subscription(&permit("Luca Verdi", "EF456GH", "60.50"), "new resident permit").unwrap();
    let report = source
        .engine
        .create_backup(&source.layout.backups_dir, PASSPHRASE, None)
        .unwrap();
    assert_eq!(report.kind, ArchiveKind::Full);
    assert!(report.path.starts_with(&source.layout.backups_dir));
    let name = report.path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("registry_backup_") && name.ends_with(".enc"));
    assert_eq!(&fs::read(&report.path).unwrap()[..6], b"87029\x01");

    let target = Registry::open();
    assert_ne!(target.vault.fingerprint(), source.vault.fingerprint());
    let restored = target.engine.restore_backup(&report.path, PASSPHRASE, None).unwrap();
    assert_eq!(restored.kind, ArchiveKind::Full);
    assert!(restored.safety_copy.exists());

    assert_eq!(target.vault.fingerprint(), source.vault.fingerprint());
    assert_eq!(
        target.store.get_all_subscriptions().unwrap(),
        source.store.get_all_subscriptions().unwrap()
    );
    assert_eq!(
        target.store.verify_data_integrity().unwrap(),
        source.store.verify_data_integrity().unwrap()
    );
    assert_eq!(target.store.audit_log(None, 10).unwrap().len(), 2);
}

#[test]
fn wrong_passphrase_leaves_registry_untouched() {
    let source = Registry::open();
    source.store.add_subscription(&permit("Giulia Bianchi", "AB123CD", "120.00"), "new resident permit").unwrap();
    let report = source
        .engine
        .create_backup(&source.layout.backups_dir, PASSPHRASE, None)
        .unwrap();

    let target = Registry::open();
    let own = target.store.add_subscription(&permit("Anna Neri", "IJ789KL", "30.00"), "new resident permit").unwrap();
    let before = target.store.get_all_subscriptions().unwrap();
    let fingerprint = target.vault.fingerprint();

    let err = target
        .engine
        .restore_backup(&report.path, "definitely the wrong one", None)
        .unwrap_err();
    assert!(matches!(err, BackupError::WrongPassphraseOrCorrupted));
    assert_eq!(err.to_string(), "Wrong passphrase or corrupted file");

    assert_eq!(target.store.get_all_subscriptions().unwrap(), before);
    assert_eq!(target.vault.fingerprint(), fingerprint);
    assert!(target.store.get_subscription(&own).unwrap().is_some());
    assert_eq!(target.pre_restore_dirs(), 0);
}

#[test]
fn failed_backup_leaves_no_partial_output_or_temporaries() {
    let registry = Registry::open();
    registry.store.add_subscription(&permit("Giulia Bianchi", "AB123CD", "120.00"), "new resident permit").unwrap();

    // A regular file where the output directory should be.
    let dir = tempdir().unwrap();
    let blocked = dir.path().join("exports");
    fs::write(&blocked, b"not a directory").unwrap();
    let output_dir = blocked.join("registry");

    let err = registry.engine.create_backup(&output_dir, PASSPHRASE, None).unwrap_err();
    assert!(matches!(err, BackupError::Step { step: Step::WriteOutputFile, .. }));

    let leftovers: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["exports".to_string()]);
    assert_eq!(fs::read(&blocked).unwrap(), b"not a directory");
    assert_eq!(registry.safety_entries(".work-"), 0);

    // The registry keeps working and the next backup succeeds.
    let report = registry.engine.create_backup(&registry.layout.backups_dir, PASSPHRASE, None).unwrap();
    let written: Vec<String> = fs::read_dir(&registry.layout.backups_dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(written, vec![report.path.file_name().unwrap().to_string_lossy().into_owned()]);
}

#[test]
fn corrupted_ciphertext_is_reported_like_a_wrong_passphrase() {
    let registry = Registry::open();
    let report = registry
        .engine
        .create_backup(&registry.layout.backups_dir, PASSPHRASE, None)
        .unwrap();
    let mut bytes = fs::read(&report.path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    fs::write(&report.path, bytes).unwrap();

    let err = registry.engine.restore_backup(&report.path, PASSPHRASE, None).unwrap_err();
    assert!(matches!(err, BackupError::WrongPassphraseOrCorrupted));
}

#[test]
fn passphrase_problems_are_rejected_before_any_file_io() {
    let registry = Registry::open();
    let missing = registry.layout.backups_dir.join("never-written.enc");
    let err = registry.engine.restore_backup(&missing, "too short", None).unwrap_err();
    assert!(matches!(
        err,
        BackupError::Passphrase(PassphraseError::WeakPassphrase { min_chars: 16 })
    ));
    let err = registry.engine.restore_backup(&missing, PASSPHRASE, None).unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));
}

#[test]
fn header_validation_distinguishes_foreign_files_from_new_versions() {
    let registry = Registry::open();
    let dir = tempdir().unwrap();

    let foreign = dir.path().join("holiday.zip");
    fs::write(&foreign, b"PK\x03\x04 not ours at all, just some other archive").unwrap();
    let err = registry.engine.restore_backup(&foreign, PASSPHRASE, None).unwrap_err();
    assert!(matches!(err, BackupError::NotAnArchive));

    let report = registry
        .engine
        .create_backup(&registry.layout.backups_dir, PASSPHRASE, None)
        .unwrap();
    rewrite_version_byte(&report.path, 0x09);
    let err = registry.engine.restore_backup(&report.path, PASSPHRASE, None).unwrap_err();
    assert!(matches!(err, BackupError::UnsupportedVersion(0x09)));
    assert_eq!(registry.pre_restore_dirs(), 0);
}

#[test]
fn archive_kinds_cannot_be_swapped() {
    let registry = Registry::open();
    let keys = registry
        .engine
        .export_keys(&registry.layout.backups_dir, PASSPHRASE, None)
        .unwrap();
    let full = registry
        .engine
        .create_backup(&registry.layout.backups_dir, PASSPHRASE, None)
        .unwrap();

    let err = registry.engine.restore_backup(&keys.path, PASSPHRASE, None).unwrap_err();
    assert!(matches!(
        err,
        BackupError::WrongArchiveKind {
            expected: ArchiveKind::Full,
            found: ArchiveKind::KeysOnly
        }
    ));
    let err = registry.engine.import_keys(&full.path, PASSPHRASE, None).unwrap_err();
    assert!(matches!(
        err,
        BackupError::WrongArchiveKind {
            expected: ArchiveKind::KeysOnly,
            found: ArchiveKind::Full
        }
    ));

    // Relabelling a full backup as keys-only breaks authentication.
    rewrite_version_byte(&full.path, 0x02);
    let err = registry.engine.import_keys(&full.path, PASSPHRASE, None).unwrap_err();
    assert!(matches!(err, BackupError::WrongPassphraseOrCorrupted));
}

#[test]
fn keys_export_moves_only_key_material() {
    let source = Registry::open();
    let id = source.store.add_subscription(&permit("Giulia Bianchi", "AB123CD", "120.00"), "new resident permit").unwrap();
    let export = source
        .engine
        .export_keys(&source.layout.backups_dir, PASSPHRASE, None)
        .unwrap();
    assert_eq!(&fs::read(&export.path).unwrap()[..6], b"87029\x02");

    let target = Registry::open();
    target.engine.import_keys(&export.path, PASSPHRASE, None).unwrap();
    assert_eq!(target.vault.fingerprint(), source.vault.fingerprint());
    assert!(target.store.get_subscription(&id).unwrap().is_none());
    assert!(target.store.get_all_subscriptions().unwrap().is_empty());
}

#[test]
fn worker_thread_reports_progress_over_channel() {
    let registry = Registry::open();
    registry.store.add_subscription(&permit("Giulia Bianchi", "AB123CD", "120.00"), "new resident permit").unwrap();
    let backup = registry
        .engine
        .spawn_backup(registry.layout.backups_dir.clone(), Zeroizing::new(PASSPHRASE.to_string()))
        .unwrap();
    let steps: Vec<(usize, usize)> = backup.progress.iter().map(|p| (p.index, p.total)).collect();
    assert_eq!(steps, (1..=6).map(|i| (i, 6)).collect::<Vec<_>>());
    let report = backup.wait().unwrap();

    let restore = registry
        .engine
        .spawn_restore(report.path.clone(), Zeroizing::new(PASSPHRASE.to_string()))
        .unwrap();
    let messages: Vec<String> = restore.progress.iter().map(|p| p.message).collect();
    assert_eq!(messages.len(), 8);
    restore.wait().unwrap();
    assert_eq!(registry.store.get_all_subscriptions().unwrap().len(), 1);
}
