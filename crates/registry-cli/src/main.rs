use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use registry_core::audit::{AuditLogEntry, OperationType};
use registry_core::backup::{BackupEngine, BackupTask};
use registry_core::kdf;
use registry_core::paths;
use registry_core::settings::RegistrySettings;
use registry_core::store::analytics::StatsFilter;
use registry_core::store::models::{Subscription, SubscriptionFields};
use registry_core::{IntegrityGuard, RecordStore, StorageLayout, SymmetricVault};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const PASSPHRASE_ENV: &str = "REGISTRY_BACKUP_PASSPHRASE";
const PASSPHRASE_CONFIRM_ENV: &str = "REGISTRY_BACKUP_PASSPHRASE_CONFIRM";

#[derive(Parser)]
#[command(name = "registry-cli")]
#[command(about = "Operator CLI for the encrypted permit registry", long_about = None)]
struct Cli {
    /// Registry data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create keys, storage and settings
    Init,

    /// Add a subscription
    Add {
        #[command(flatten)]
        fields: FieldArgs,
        #[arg(long)]
        reason: String,
    },

    /// Replace every field of a subscription
    Update {
        protocol_id: String,
        #[command(flatten)]
        fields: FieldArgs,
        #[arg(long)]
        reason: String,
    },

    /// Delete a subscription
    Delete {
        protocol_id: String,
        #[arg(long)]
        reason: String,
    },

    /// Import subscriptions from a JSON array, all or nothing
    Import {
        file: PathBuf,
        #[arg(long)]
        reason: String,
    },

    /// Show one subscription as JSON
    Show { protocol_id: String },

    /// List all subscriptions
    List,

    /// Search by protocol ID, owner name or plate
    Search { query: String },

    /// Check permits for a licence plate
    Plate {
        plate: String,
        /// Validity date to check (defaults to today)
        #[arg(long)]
        on: Option<NaiveDate>,
    },

    /// Verify every record's integrity signature
    Verify,

    /// Show audit entries, newest first
    Audit {
        /// INSERT, UPDATE or DELETE
        #[arg(long)]
        operation: Option<OperationType>,
        /// Entries for one protocol ID only
        #[arg(long)]
        protocol_id: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Payment statistics
    Stats {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },

    /// Write an encrypted full backup
    Backup {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the registry with a full backup
    Restore { archive: PathBuf },

    /// Write an encrypted keys-only export
    ExportKeys {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the key files with a keys-only export
    ImportKeys { archive: PathBuf },
}

#[derive(Args)]
struct FieldArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    plate: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    address: String,
    #[arg(long)]
    mobile: String,
    #[arg(long)]
    start: NaiveDate,
    #[arg(long)]
    end: NaiveDate,
    #[arg(long)]
    amount: Decimal,
    /// POS, BOLLETTINO or any other method
    #[arg(long)]
    method: String,
}

impl From<FieldArgs> for SubscriptionFields {
    fn from(a: FieldArgs) -> Self {
        SubscriptionFields {
            owner_name: a.owner,
            license_plate: a.plate,
            email: a.email,
            address: a.address,
            mobile: a.mobile,
            subscription_start: a.start,
            subscription_end: a.end,
            payment_amount: a.amount,
            payment_method: a.method,
        }
    }
}

/// Resolved paths, settings and key holders for one invocation.
struct Registry {
    layout: StorageLayout,
    settings: RegistrySettings,
    vault: Arc<SymmetricVault>,
    guard: Arc<IntegrityGuard>,
}

impl Registry {
    fn open(data_dir: &Path, settings: RegistrySettings) -> Result<Self> {
        let layout = StorageLayout::in_dir(data_dir);
        let vault = Arc::new(SymmetricVault::open(&layout.keys_dir).context("opening vault key")?);
        let guard = Arc::new(IntegrityGuard::open(&layout.keys_dir).context("opening integrity key")?);
        Ok(Self {
            layout,
            settings,
            vault,
            guard,
        })
    }

    fn store(&self) -> Result<RecordStore> {
        RecordStore::open(&self.layout.db_path, self.vault.clone(), self.guard.clone())
            .context("opening registry storage")
    }

    /// The engine shares the store's access gate, so it is built from an open store.
    fn engine(&self) -> Result<Arc<BackupEngine>> {
        let store = self.store()?;
        Ok(Arc::new(BackupEngine::for_store(self.layout.clone(), &store)))
    }

    fn output_dir(&self, explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| self.settings.backups_dir.clone())
            .unwrap_or_else(|| self.layout.backups_dir.clone())
    }

    fn require_reason(&self, reason: &str) -> Result<()> {
        let min = self.settings.min_reason_chars;
        if reason.trim().chars().count() < min {
            bail!("reason must be at least {min} characters");
        }
        Ok(())
    }
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => paths::data_dir()?,
    };
    let settings = RegistrySettings::load(&data_dir).context("loading settings")?;
    init_logging(&settings.log_filter);

    let registry = Registry::open(&data_dir, settings)?;

    match cli.command {
        Commands::Init => init_command(&registry, &data_dir)?,

        Commands::Add { fields, reason } => {
            registry.require_reason(&reason)?;
            let id = registry.store()?.add_subscription(&SubscriptionFields::from(fields), &reason)?;
            println!("{id}");
        }

        Commands::Update { protocol_id, fields, reason } => {
            registry.require_reason(&reason)?;
            if !registry.store()?.update_subscription(&protocol_id, &SubscriptionFields::from(fields), &reason)? {
                bail!("no subscription {protocol_id}");
            }
            println!("updated {protocol_id}");
        }

        Commands::Delete { protocol_id, reason } => {
            registry.require_reason(&reason)?;
            if !registry.store()?.delete_subscription(&protocol_id, &reason)? {
                bail!("no subscription {protocol_id}");
            }
            println!("deleted {protocol_id}");
        }

        Commands::Import { file, reason } => {
            registry.require_reason(&reason)?;
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let rows: Vec<SubscriptionFields> = serde_json::from_str(&text).context("parsing import file")?;
            let mut report = |done: usize, total: usize| eprintln!("[{done}/{total}] imported");
            let ids = registry
                .store()?
                .bulk_add_subscriptions(&rows, &reason, Some(&mut report))?;
            println!("imported {} subscriptions ({} .. {})", ids.len(), first(&ids), last(&ids));
        }

        Commands::Show { protocol_id } => {
            let sub = registry
                .store()?
                .get_subscription(&protocol_id)?
                .ok_or_else(|| anyhow!("no subscription {protocol_id}"))?;
            println!("{}", serde_json::to_string_pretty(&sub)?);
        }

        Commands::List => print_rows(&registry.store()?.get_all_subscriptions()?),

        Commands::Search { query } => print_rows(&registry.store()?.search_subscriptions(&query)?),

        Commands::Plate { plate, on } => {
            let on = on.unwrap_or_else(|| Local::now().date_naive());
            let lookups = registry.store()?.get_subscriptions_by_plate(&plate)?;
            if lookups.is_empty() {
                println!("no permits for {}", plate.trim().to_uppercase());
            }
            for l in &lookups {
                let status = if l.is_active_on(on) { "VALID" } else { "not valid" };
                println!(
                    "{}  {}  {}  {} .. {}  {status} on {on}",
                    l.protocol_id, l.license_plate, l.owner_name, l.subscription_start, l.subscription_end
                );
            }
        }

        Commands::Verify => {
            let report = registry.store()?.verify_data_integrity()?;
            if report.all_valid {
                println!("all records verified");
            } else {
                for issue in &report.issues {
                    println!("{issue}");
                }
                bail!("{} integrity issue(s) found", report.issues.len());
            }
        }

        Commands::Audit { operation, protocol_id, limit } => {
            let store = registry.store()?;
            let entries = match protocol_id {
                Some(id) => store.audit_history(&id)?,
                None => store.audit_log(operation, limit.unwrap_or(registry.settings.audit_query_limit))?,
            };
            for entry in &entries {
                print_audit(entry);
            }
        }

        Commands::Stats { year, month, from, to } => {
            let filter = StatsFilter {
                year,
                month,
                date_range: from.zip(to),
            };
            let store = registry.store()?;
            let summary = serde_json::json!({
                "statistics": store.payment_statistics(&filter)?,
                "monthly_revenue": store.monthly_revenue(&filter)?,
                "subscriptions_per_month": store.subscriptions_per_month(&filter)?,
                "payment_methods": store.payment_methods_breakdown(&filter)?,
                "revenue_trend": store.revenue_trend(&filter)?,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Backup { output } => {
            let passphrase = prompt_passphrase_twice("Backup passphrase: ")?;
            let task = registry.engine()?.spawn_backup(registry.output_dir(output), passphrase)?;
            let report = follow(task)?;
            println!("backup written to {} ({} bytes)", report.path.display(), report.size);
        }

        Commands::Restore { archive } => {
            let passphrase = prompt_passphrase_once("Backup passphrase: ")?;
            let report = follow(registry.engine()?.spawn_restore(archive, passphrase)?)?;
            println!("registry restored; previous state kept in {}", report.safety_copy.display());
        }

        Commands::ExportKeys { output } => {
            let passphrase = prompt_passphrase_twice("Export passphrase: ")?;
            let task = registry
                .engine()?
                .spawn_export_keys(registry.output_dir(output), passphrase)?;
            let report = follow(task)?;
            println!("keys exported to {}", report.path.display());
            println!("store this file and its passphrase separately");
        }

        Commands::ImportKeys { archive } => {
            let passphrase = prompt_passphrase_once("Export passphrase: ")?;
            let report = follow(registry.engine()?.spawn_import_keys(archive, passphrase)?)?;
            println!(
                "keys imported (vault {}); previous keys kept in {}",
                registry.vault.fingerprint(),
                report.safety_copy.display()
            );
        }
    }

    Ok(())
}

fn init_command(registry: &Registry, data_dir: &Path) -> Result<()> {
    if !data_dir.join(registry_core::settings::SETTINGS_FILE).exists() {
        registry.settings.save(data_dir)?;
    }
    registry.store()?;
    info!(data_dir = %data_dir.display(), "registry initialised");
    println!("registry ready in {}", data_dir.display());
    println!("vault key fingerprint: {}", registry.vault.fingerprint());
    println!("losing {} makes every encrypted field unrecoverable;", registry.vault.key_path().display());
    println!("run `registry-cli export-keys` and keep the export offline");
    Ok(())
}

fn follow<T>(task: BackupTask<T>) -> Result<T> {
    for step in task.progress.iter() {
        eprintln!("[{}/{}] {}", step.index, step.total, step.message);
    }
    Ok(task.wait()?)
}

fn print_rows(rows: &[Subscription]) {
    for s in rows {
        println!(
            "{}  {:<10}  {:<30}  {} .. {}  {} {}",
            s.protocol_id,
            s.fields.license_plate,
            s.fields.owner_name,
            s.fields.subscription_start,
            s.fields.subscription_end,
            s.fields.payment_amount,
            s.fields.payment_method
        );
    }
    eprintln!("{} record(s)", rows.len());
}

fn print_audit(entry: &AuditLogEntry) {
    let host = entry.actor.host.as_deref().unwrap_or("?");
    println!(
        "#{} {} {:<6} {} by {}@{}: {}",
        entry.id,
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.operation().as_str(),
        entry.protocol_id,
        entry.actor.user,
        host,
        entry.reason
    );
}

fn first(ids: &[String]) -> &str {
    ids.first().map(String::as_str).unwrap_or("-")
}

fn last(ids: &[String]) -> &str {
    ids.last().map(String::as_str).unwrap_or("-")
}

fn prompt_passphrase_once(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(p) = std::env::var(PASSPHRASE_ENV) {
        if !p.is_empty() {
            return Ok(Zeroizing::new(p));
        }
    }
    let p = rpassword::prompt_password(prompt).map_err(|e| anyhow!("passphrase prompt: {e}"))?;
    Ok(Zeroizing::new(p))
}

/// Confirmation is checked here, before the engine touches any file.
fn prompt_passphrase_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(p) = std::env::var(PASSPHRASE_ENV) {
        if !p.is_empty() {
            let confirm = std::env::var(PASSPHRASE_CONFIRM_ENV).unwrap_or_else(|_| p.clone());
            kdf::confirm_passphrase(&p, &confirm)?;
            return Ok(Zeroizing::new(p));
        }
    }
    let first = Zeroizing::new(rpassword::prompt_password(prompt).map_err(|e| anyhow!("passphrase prompt: {e}"))?);
    kdf::validate_passphrase(&first)?;
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm passphrase: ").map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    );
    kdf::confirm_passphrase(&first, &second)?;
    Ok(first)
}
