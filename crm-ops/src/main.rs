use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use crm_sync::persistence::open_snapshot_store;
use crm_sync::store::KindSummary;
use crm_sync::{
    EntityKind, RestBackend, SnapshotBackend, StoreSnapshot, SweepReport, SyncConfig, SyncEngine,
    SyncStatus,
};
use crm_telemetry::{init_tracing, LogConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// CRM offline store operations
#[derive(Parser, Debug)]
#[command(name = "crmsync", version)]
#[command(about = "Inspect and sync CRM offline store snapshots")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true, env = "CRM_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record counts per collection and sync status
    Status(SnapshotArgs),

    /// List records waiting for the backend
    Pending {
        #[command(flatten)]
        snapshot: SnapshotArgs,

        /// Only show one collection, e.g. `contacts`
        #[arg(long, value_parser = parse_kind)]
        kind: Option<EntityKind>,
    },

    /// Push every pending record to the REST backend once and save the result
    Sync(SnapshotArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct SnapshotArgs {
    /// Snapshot location; defaults to the configured path
    snapshot: Option<PathBuf>,

    /// Snapshot format; defaults to the configured backend
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum FormatArg {
    Json,
    Sqlite,
}

impl SnapshotArgs {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(path) = &self.snapshot {
            config.snapshot_path = path.clone();
        }
        match self.format {
            Some(FormatArg::Json) => config.snapshot_backend = SnapshotBackend::Json,
            Some(FormatArg::Sqlite) => config.snapshot_backend = SnapshotBackend::Sqlite,
            None => {}
        }
        config
    }
}

fn parse_kind(name: &str) -> std::result::Result<EntityKind, String> {
    EntityKind::from_table(name).ok_or_else(|| {
        let known: Vec<_> = EntityKind::ALL.iter().map(EntityKind::table).collect();
        format!("unknown collection `{name}`, expected one of: {}", known.join(", "))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig::from_env(cli.verbose))?;

    let config = SyncConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Status(args) => status(args.apply(config)).await,
        Command::Pending { snapshot, kind } => pending(snapshot.apply(config), kind).await,
        Command::Sync(args) => sync(args.apply(config)).await,
        Command::Config => print_config(config),
    }
}

async fn load_snapshot(config: &SyncConfig) -> Result<Option<StoreSnapshot>> {
    let snapshots = open_snapshot_store(config)
        .await
        .with_context(|| format!("Failed to open {}", config.snapshot_path.display()))?;
    let snapshot = snapshots
        .load()
        .await
        .with_context(|| format!("Failed to read {}", config.snapshot_path.display()))?;
    if snapshot.is_none() {
        println!(
            "{} {}",
            "No snapshot at".yellow(),
            config.snapshot_path.display()
        );
    }
    Ok(snapshot)
}

async fn status(config: SyncConfig) -> Result<()> {
    let Some(snapshot) = load_snapshot(&config).await? else {
        return Ok(());
    };

    println!(
        "{} {} (saved {})",
        "Snapshot".bright_cyan(),
        config.snapshot_path.display(),
        snapshot.saved_at.to_rfc3339()
    );
    print!("{}", render_status(&snapshot));
    Ok(())
}

fn render_status(snapshot: &StoreSnapshot) -> String {
    let summary = snapshot.summary();
    let mut out = format!(
        "{:<16} {:>7} {:>7} {:>7} {:>7}\n",
        "collection", "synced", "pending", "error", "delete"
    );
    for (kind, counts) in &summary.kinds {
        if counts.total() > 0 {
            out.push_str(&status_row(kind.table(), counts));
        }
    }
    let unsynced = summary.unsynced();
    let footer = format!("{unsynced} record(s) waiting for the backend");
    let footer = if unsynced == 0 { footer.green() } else { footer.yellow() };
    out.push_str(&format!("{footer}\n"));
    out
}

fn status_row(name: &str, counts: &KindSummary) -> String {
    let error = counts.error.to_string();
    let error = if counts.error > 0 { error.red() } else { error.normal() };
    format!(
        "{:<16} {:>7} {:>7} {:>7} {:>7}\n",
        name, counts.synced, counts.pending, error, counts.pending_delete
    )
}

async fn pending(config: SyncConfig, kind: Option<EntityKind>) -> Result<()> {
    let Some(snapshot) = load_snapshot(&config).await? else {
        return Ok(());
    };
    print!("{}", render_pending(&snapshot, kind));
    Ok(())
}

fn render_pending(snapshot: &StoreSnapshot, only: Option<EntityKind>) -> String {
    let mut out = String::new();
    for (kind, records) in &snapshot.collections {
        if only.is_some_and(|only| only != *kind) {
            continue;
        }
        for record in records.iter().filter(|r| r.needs_sync()) {
            let status = match record.sync_status {
                SyncStatus::Error => record.sync_status.as_str().red(),
                _ => record.sync_status.as_str().yellow(),
            };
            let action = match (record.pending_delete, record.id.is_local()) {
                (true, true) => "drop",
                (true, false) => "delete",
                (false, true) => "create",
                (false, false) => "update",
            };
            out.push_str(&format!(
                "{:<16} {:<40} {:<8} {:<7} attempts={}",
                kind.table(),
                record.id.to_string(),
                status,
                action,
                record.attempts
            ));
            if let Some(error) = &record.last_error {
                out.push_str(&format!("  {}", error.bright_black()));
            }
            out.push('\n');
        }
    }
    if out.is_empty() {
        out.push_str(&format!("{}\n", "Nothing pending".green()));
    }
    out
}

async fn sync(config: SyncConfig) -> Result<()> {
    let backend = Arc::new(
        RestBackend::new(config.rest.clone()).context("Failed to create REST backend")?,
    );
    let engine = SyncEngine::with_config(&config, backend)
        .await
        .context("Failed to start sync engine")?;

    tracing::info!(base_url = %config.rest.base_url, "Syncing snapshot");
    let report = engine.sync_now().await;
    let remaining = engine.store().summary().unsynced();
    engine.shutdown().await.context("Failed to save snapshot")?;

    print!("{}", render_report(&report, remaining));
    Ok(())
}

fn render_report(report: &SweepReport, remaining: usize) -> String {
    let mut out = format!(
        "created {}  updated {}  deleted {}  dropped {}\n",
        report.created, report.updated, report.deleted, report.dropped
    );
    if report.failed > 0 {
        out.push_str(&format!("{}\n", format!("failed {}", report.failed).red()));
    }
    let footer = format!("{remaining} record(s) still waiting for the backend");
    let footer = if remaining == 0 { footer.green() } else { footer.yellow() };
    out.push_str(&format!("{footer}\n"));
    out
}

fn print_config(config: SyncConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&redacted(config))?);
    Ok(())
}

fn redacted(mut config: SyncConfig) -> SyncConfig {
    let mask = |secret: &mut Option<String>| {
        if secret.is_some() {
            *secret = Some("********".to_string());
        }
    };
    mask(&mut config.rest.api_key);
    mask(&mut config.rest.auth_token);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_sync::{Identity, Payload, StoredRecord};
    use std::collections::BTreeMap;

    fn snapshot() -> StoreSnapshot {
        let mut failed = StoredRecord::pending(Identity::local("deal-1"), Payload::new());
        failed.sync_status = SyncStatus::Error;
        failed.attempts = 2;
        failed.last_error = Some("Network error: offline".to_string());

        let mut collections = BTreeMap::new();
        collections.insert(
            EntityKind::Contact,
            vec![StoredRecord::synced(Identity::remote("c-1"), Payload::new())],
        );
        collections.insert(EntityKind::Deal, vec![failed]);
        StoreSnapshot {
            collections,
            ..StoreSnapshot::empty()
        }
    }

    #[test]
    fn test_parse_pending_with_kind() {
        let cli = Cli::try_parse_from(["crmsync", "pending", "store.json", "--kind", "deals"]).unwrap();
        match cli.command {
            Command::Pending { snapshot, kind } => {
                assert_eq!(snapshot.snapshot, Some(PathBuf::from("store.json")));
                assert_eq!(kind, Some(EntityKind::Deal));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = Cli::try_parse_from(["crmsync", "pending", "--kind", "patients"]).unwrap_err();
        assert!(err.to_string().contains("unknown collection"));
    }

    #[test]
    fn test_snapshot_args_override_config() {
        let args = SnapshotArgs {
            snapshot: Some(PathBuf::from("/tmp/crm.db")),
            format: Some(FormatArg::Sqlite),
        };
        let config = args.apply(SyncConfig::default());
        assert_eq!(config.snapshot_path, PathBuf::from("/tmp/crm.db"));
        assert_eq!(config.snapshot_backend, SnapshotBackend::Sqlite);
    }

    #[test]
    fn test_render_status_and_pending() {
        colored::control::set_override(false);
        let snapshot = snapshot();

        let status = render_status(&snapshot);
        assert!(status.contains("contacts"));
        assert!(status.contains("1 record(s) waiting"));

        let pending = render_pending(&snapshot, None);
        assert!(pending.contains("temp-deal-1"));
        assert!(pending.contains("create"));
        assert!(pending.contains("attempts=2"));
        assert!(render_pending(&snapshot, Some(EntityKind::Contact)).contains("Nothing pending"));
    }

    #[test]
    fn test_config_secrets_are_masked() {
        let mut config = SyncConfig::default();
        config.rest.auth_token = Some("secret".to_string());

        let printed = serde_json::to_string(&redacted(config)).unwrap();
        assert!(!printed.contains("secret"));
        assert!(printed.contains("********"));
    }

    #[tokio::test]
    async fn test_status_of_json_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("crm.json");
        std::fs::write(&path, serde_json::to_vec(&snapshot()).unwrap()).unwrap();
        let config = SnapshotArgs {
            snapshot: Some(path),
            format: Some(FormatArg::Json),
        }
        .apply(SyncConfig::default());

        let loaded = load_snapshot(&config).await.unwrap().unwrap();
        assert_eq!(loaded.collections.len(), 2);
        status(config).await.unwrap();
    }
}
