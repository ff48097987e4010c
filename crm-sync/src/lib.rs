//! Offline-first synchronization layer for the CRM
//!
//! Provides:
//! - In-memory entity store with optimistic, immediately visible mutations
//! - Sync coordinator pushing pending changes to a remote backend
//! - Reconnect trigger sweeping on network restore, mutations and a timer
//! - Snapshot persistence (JSON file or SQLite) so pending work survives restarts

pub mod config;
pub mod coordinator;
pub mod entities;
pub mod error;
pub mod persistence;
pub mod record;
pub mod remote;
pub mod repository;
pub mod store;
pub mod trigger;

pub use config::{RetryPolicy, SnapshotBackend, SyncConfig};
pub use coordinator::{SweepMode, SweepReport, SyncCoordinator};
pub use error::{SyncError, SyncFailure, SyncResult};
pub use persistence::{
    JsonFileStore, MemorySnapshotStore, PersistenceWorker, SnapshotStore, SqliteSnapshotStore,
};
pub use record::{Entity, EntityKind, EntityRecord, Identity, Payload, StoredRecord, SyncStatus};
pub use remote::{MemoryBackend, RemoteBackend, RemoteRecord, RestBackend, RestConfig};
pub use repository::Repository;
pub use store::{EntityStore, StoreChange, StoreEvent, StoreSnapshot, StoreSummary};
pub use trigger::{ReconnectTrigger, TriggerHandle, TriggerStatus};

use std::sync::Arc;

/// Sync engine wiring store, coordinator, trigger and persistence together
pub struct SyncEngine {
    store: Arc<EntityStore>,
    coordinator: Arc<SyncCoordinator>,
    trigger: TriggerHandle,
    persistence: PersistenceWorker,
}

impl SyncEngine {
    /// Restore the last snapshot and start the background workers.
    ///
    /// Connectivity starts as `config.start_online`; later changes arrive
    /// through [`SyncEngine::network_restored`] and [`SyncEngine::network_lost`].
    pub async fn start(
        config: &SyncConfig,
        backend: Arc<dyn RemoteBackend>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> SyncResult<Self> {
        let store = Arc::new(persistence::load_store(snapshots.as_ref()).await);
        let coordinator = Arc::new(SyncCoordinator::new(store.clone(), backend, config));
        let persistence = PersistenceWorker::spawn(store.clone(), snapshots);
        let trigger = ReconnectTrigger::spawn(
            coordinator.clone(),
            config.sweep_interval(),
            config.start_online,
        );

        let summary = store.summary();
        tracing::info!(
            unsynced = summary.unsynced(),
            online = config.start_online,
            sweep_interval_ms = crate::config::millis(config.sweep_interval),
            "Sync engine started"
        );

        Ok(Self {
            store,
            coordinator,
            trigger,
            persistence,
        })
    }

    /// Start with the snapshot store named in `config`.
    pub async fn with_config(config: &SyncConfig, backend: Arc<dyn RemoteBackend>) -> SyncResult<Self> {
        let snapshots = persistence::open_snapshot_store(config).await?;
        Self::start(config, backend, snapshots).await
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Typed repository for entities of type `E`.
    pub fn repo<E: Entity>(&self) -> Repository<'_, E> {
        self.store.repo::<E>()
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn trigger(&self) -> &TriggerHandle {
        &self.trigger
    }

    pub fn network_restored(&self) {
        self.trigger.network_restored();
    }

    pub fn network_lost(&self) {
        self.trigger.network_lost();
    }

    /// Run one forced sweep now, regardless of connectivity state.
    pub async fn sync_now(&self) -> SweepReport {
        self.coordinator.sync_all().await
    }

    /// Stop the workers and write a final snapshot.
    pub async fn shutdown(self) -> SyncResult<()> {
        self.trigger.shutdown().await?;
        self.persistence.shutdown().await?;
        tracing::info!("Sync engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Contact;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sync_engine_resumes_pending_work_after_restart() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let backend = Arc::new(MemoryBackend::new());
        let config = SyncConfig {
            sweep_interval: Duration::ZERO,
            start_online: false,
            ..SyncConfig::default()
        };

        let engine = SyncEngine::start(&config, backend.clone(), snapshots.clone())
            .await
            .unwrap();
        let id = engine
            .repo::<Contact>()
            .add(&Contact {
                name: "Ana".to_string(),
                ..Contact::default()
            })
            .unwrap();
        engine.shutdown().await.unwrap();
        assert_eq!(backend.calls().total(), 0);

        let engine = SyncEngine::start(&config, backend.clone(), snapshots.clone())
            .await
            .unwrap();
        let restored = engine.repo::<Contact>().get(&id).unwrap().unwrap();
        assert_eq!(restored.sync_status, SyncStatus::Pending);

        let report = engine.sync_now().await;
        assert_eq!(report.created, 1);
        assert_eq!(backend.rows(EntityKind::Contact).len(), 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_started_engine_syncs_mutations_without_restore() {
        let backend = Arc::new(MemoryBackend::new());
        let config = SyncConfig {
            sweep_interval: Duration::from_millis(20),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::start(&config, backend.clone(), Arc::new(MemorySnapshotStore::new()))
            .await
            .unwrap();
        assert!(engine.trigger().is_online());

        engine
            .repo::<Contact>()
            .add(&Contact {
                name: "Ana".to_string(),
                ..Contact::default()
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.store().summary().unsynced() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(backend.calls().creates, 1);
        assert_eq!(backend.rows(EntityKind::Contact).len(), 1);
        let contacts = engine.repo::<Contact>().list().unwrap();
        assert_eq!(contacts[0].sync_status, SyncStatus::Synced);
        engine.shutdown().await.unwrap();
    }
}
