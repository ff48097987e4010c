//! Local persistence of store snapshots
//!
//! Provides:
//! - [`SnapshotStore`]: save/load of a whole [`StoreSnapshot`]
//! - JSON file, SQLite and in-memory implementations
//! - a background worker that saves after every store change
//!
//! Saving is best effort. A failed save is logged and the next change tries
//! again; nothing is reported back to the coordinator or the UI.

use crate::config::{SnapshotBackend, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::store::{EntityStore, StoreSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &StoreSnapshot) -> SyncResult<()>;

    /// Last saved snapshot, or `None` when nothing was saved yet.
    async fn load(&self) -> SyncResult<Option<StoreSnapshot>>;
}

/// Open the snapshot store selected by `config`.
pub async fn open_snapshot_store(config: &SyncConfig) -> SyncResult<Arc<dyn SnapshotStore>> {
    let store: Arc<dyn SnapshotStore> = match config.snapshot_backend {
        SnapshotBackend::Json => Arc::new(JsonFileStore::new(&config.snapshot_path)),
        SnapshotBackend::Sqlite => Arc::new(SqliteSnapshotStore::open(&config.snapshot_path).await?),
    };
    Ok(store)
}

/// Snapshot kept in a single JSON file, replaced atomically on save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save(&self, snapshot: &StoreSnapshot) -> SyncResult<()> {
        let body = serde_json::to_vec(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, body).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn load(&self) -> SyncResult<Option<StoreSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Snapshot kept as one row of a local SQLite database.
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    const SLOT: &'static str = "current";

    pub async fn open(path: &Path) -> SyncResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_snapshot (
                slot TEXT PRIMARY KEY,
                format INTEGER NOT NULL,
                body TEXT NOT NULL,
                saved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &StoreSnapshot) -> SyncResult<()> {
        let body = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO store_snapshot (slot, format, body, saved_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(slot) DO UPDATE SET
                format = excluded.format,
                body = excluded.body,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(Self::SLOT)
        .bind(i64::from(snapshot.format))
        .bind(body)
        .bind(snapshot.saved_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self) -> SyncResult<Option<StoreSnapshot>> {
        let row = sqlx::query("SELECT body FROM store_snapshot WHERE slot = ?")
            .bind(Self::SLOT)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }
}

/// Snapshot held in memory; survives an engine restart within one process.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<StoreSnapshot>>,
    saves: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock()
    }

    pub fn current(&self) -> Option<StoreSnapshot> {
        self.snapshot.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &StoreSnapshot) -> SyncResult<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    async fn load(&self) -> SyncResult<Option<StoreSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }
}

/// Rehydrate a store, falling back to an empty one if the snapshot is
/// missing or unreadable.
pub async fn load_store(snapshots: &dyn SnapshotStore) -> EntityStore {
    match snapshots.load().await {
        Ok(Some(snapshot)) => {
            let summary = snapshot.summary();
            tracing::info!(
                saved_at = %snapshot.saved_at,
                unsynced = summary.unsynced(),
                "Restored store snapshot"
            );
            EntityStore::from_snapshot(snapshot)
        }
        Ok(None) => {
            tracing::info!("No store snapshot found, starting empty");
            EntityStore::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Store snapshot unreadable, starting empty");
            EntityStore::new()
        }
    }
}

/// Background task saving the store after every change.
pub struct PersistenceWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PersistenceWorker {
    pub fn spawn(store: Arc<EntityStore>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let mut versions = store.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = versions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        save_quietly(&store, snapshots.as_ref()).await;
                    }
                    _ = stop.changed() => {
                        if versions.has_changed().unwrap_or(false) {
                            save_quietly(&store, snapshots.as_ref()).await;
                        }
                        break;
                    }
                }
            }
            tracing::debug!("Persistence worker stopped");
        });

        Self { shutdown, handle }
    }

    /// Flush pending changes and stop.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| SyncError::Internal(format!("persistence worker panicked: {e}")))
    }
}

async fn save_quietly(store: &EntityStore, snapshots: &dyn SnapshotStore) {
    let snapshot = store.snapshot();
    let started = Utc::now();
    match snapshots.save(&snapshot).await {
        Ok(()) => tracing::trace!(
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "Saved store snapshot"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to save store snapshot"),
    }
}
