//! Reconnect trigger
//!
//! Background worker deciding when the coordinator sweeps:
//! - network restored: forced sweep of everything unsynchronized
//! - local mutation while online: sweep of due records
//! - periodic tick while online: sweep of due records
//! - manual retry: forced sweep
//!
//! Sweeps run on the worker task one after another. Overlap with sweeps
//! started elsewhere is handled by the coordinator's in-flight set.

use crate::coordinator::{SweepReport, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::record::{EntityKind, Identity};
use crate::store::StoreEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TriggerCommand {
    NetworkRestored,
    NetworkLost,
    Retry { kind: EntityKind, id: Identity },
    Shutdown,
}

/// Observable state of the trigger worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerStatus {
    pub online: bool,
    /// Sweeps run by this worker so far
    pub sweeps: u64,
    pub last_report: Option<SweepReport>,
}

pub struct ReconnectTrigger;

impl ReconnectTrigger {
    /// Start the worker. `online` is the connectivity assumed until the
    /// first network notification.
    pub fn spawn(
        coordinator: Arc<SyncCoordinator>,
        sweep_interval: Option<Duration>,
        online: bool,
    ) -> TriggerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(TriggerStatus {
            online,
            ..TriggerStatus::default()
        });
        let events = coordinator.store().events();

        let worker = Worker {
            coordinator,
            commands: commands_rx,
            events,
            status: status_tx,
            ticker: sweep_interval.map(ticker),
        };
        let task = tokio::spawn(worker.run());

        TriggerHandle {
            commands: commands_tx,
            status: status_rx,
            task: Mutex::new(Some(task)),
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Control surface for a running trigger worker.
pub struct TriggerHandle {
    commands: mpsc::UnboundedSender<TriggerCommand>,
    status: watch::Receiver<TriggerStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerHandle {
    /// Connectivity came back: go online and sweep everything.
    pub fn network_restored(&self) {
        self.send(TriggerCommand::NetworkRestored);
    }

    /// Connectivity lost: automatic sweeps pause until restored.
    pub fn network_lost(&self) {
        self.send(TriggerCommand::NetworkLost);
    }

    /// Manual retry of a failed record. Runs a forced sweep of every
    /// collection, not just this record.
    pub fn retry(&self, kind: EntityKind, id: Identity) {
        self.send(TriggerCommand::Retry { kind, id });
    }

    pub fn is_online(&self) -> bool {
        self.status.borrow().online
    }

    pub fn status(&self) -> TriggerStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TriggerStatus> {
        self.status.clone()
    }

    /// Stop the worker after the sweep in progress, if any.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(TriggerCommand::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| SyncError::Internal(format!("trigger worker failed: {e}")))?;
        }
        Ok(())
    }

    fn send(&self, command: TriggerCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Trigger worker already stopped");
        }
    }
}

struct Worker {
    coordinator: Arc<SyncCoordinator>,
    commands: mpsc::UnboundedReceiver<TriggerCommand>,
    events: broadcast::Receiver<StoreEvent>,
    status: watch::Sender<TriggerStatus>,
    ticker: Option<Interval>,
}

impl Worker {
    async fn run(mut self) {
        tracing::debug!(online = self.online(), "Reconnect trigger started");

        loop {
            let online = self.online();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(TriggerCommand::NetworkRestored) => {
                        tracing::info!("Network restored, syncing pending changes");
                        self.status.send_modify(|s| s.online = true);
                        // Mutations made offline are covered by this sweep.
                        self.events = self.events.resubscribe();
                        self.sweep_all().await;
                    }
                    Some(TriggerCommand::NetworkLost) => {
                        tracing::info!("Network lost, pausing automatic sync");
                        self.status.send_modify(|s| s.online = false);
                    }
                    Some(TriggerCommand::Retry { kind, id }) => {
                        tracing::info!(kind = %kind, id = %id, "Manual retry requested");
                        self.sweep_all().await;
                    }
                    Some(TriggerCommand::Shutdown) | None => break,
                },
                event = self.events.recv(), if online => match event {
                    Ok(event) if event.is_local_mutation() => self.sweep_due().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "Store events lagged, sweeping");
                        self.sweep_due().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = next_tick(&mut self.ticker), if online => self.sweep_due().await,
            }
        }

        tracing::debug!("Reconnect trigger stopped");
    }

    fn online(&self) -> bool {
        self.status.borrow().online
    }

    async fn sweep_all(&self) {
        let report = self.coordinator.sync_all().await;
        self.record(report);
    }

    async fn sweep_due(&self) {
        let report = self.coordinator.sync_due().await;
        self.record(report);
    }

    fn record(&self, report: SweepReport) {
        self.status.send_modify(|s| {
            s.sweeps += 1;
            s.last_report = Some(report);
        });
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::entities::Contact;
    use crate::record::SyncStatus;
    use crate::remote::MemoryBackend;
    use crate::store::EntityStore;

    fn setup(online: bool, interval: Option<Duration>) -> (Arc<EntityStore>, Arc<MemoryBackend>, TriggerHandle) {
        let store = Arc::new(EntityStore::new());
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = Arc::new(SyncCoordinator::with_policy(
            store.clone(),
            backend.clone(),
            Duration::from_secs(5),
            RetryPolicy::default(),
        ));
        let trigger = ReconnectTrigger::spawn(coordinator, interval, online);
        (store, backend, trigger)
    }

    async fn wait_for_sweeps(trigger: &TriggerHandle, sweeps: u64) -> TriggerStatus {
        let mut status = trigger.watch();
        let current = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.sweeps >= sweeps))
            .await
            .unwrap()
            .unwrap()
            .clone();
        current
    }

    #[tokio::test]
    async fn test_mutation_while_online_triggers_sweep() {
        let (store, backend, trigger) = setup(true, None);

        let id = store
            .repo::<Contact>()
            .add(&Contact {
                name: "Ana".to_string(),
                ..Contact::default()
            })
            .unwrap();

        let status = wait_for_sweeps(&trigger, 1).await;
        assert_eq!(status.last_report.unwrap().created, 1);
        assert!(store.get(EntityKind::Contact, &id).is_none());
        assert_eq!(backend.rows(EntityKind::Contact).len(), 1);

        trigger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_mutations_wait_for_restore() {
        let (store, backend, trigger) = setup(false, None);

        store
            .repo::<Contact>()
            .add(&Contact {
                name: "Ana".to_string(),
                ..Contact::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.calls().total(), 0);
        assert_eq!(trigger.status().sweeps, 0);

        trigger.network_restored();
        let status = wait_for_sweeps(&trigger, 1).await;

        assert!(status.online);
        assert_eq!(status.last_report.unwrap().created, 1);
        assert!(store.records(EntityKind::Contact)[0].sync_status == SyncStatus::Synced);

        trigger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_network_lost_pauses_automatic_sweeps() {
        let (store, backend, trigger) = setup(true, Some(Duration::from_millis(10)));

        trigger.network_lost();
        let mut status = trigger.watch();
        status.wait_for(|s| !s.online).await.unwrap();
        let sweeps = trigger.status().sweeps;

        store
            .repo::<Contact>()
            .add(&Contact::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(trigger.status().sweeps, sweeps);
        assert_eq!(backend.calls().total(), 0);
        trigger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_forces_sweep_past_backoff() {
        let (store, backend, trigger) = setup(true, None);
        backend.set_failure(Some(crate::error::SyncFailure::Network("offline".to_string())));

        let id = store
            .repo::<Contact>()
            .add(&Contact::default())
            .unwrap();
        wait_for_sweeps(&trigger, 1).await;
        assert_eq!(store.get(EntityKind::Contact, &id).unwrap().sync_status, SyncStatus::Error);

        backend.set_failure(None);
        trigger.retry(EntityKind::Contact, id.clone());
        let status = wait_for_sweeps(&trigger, 2).await;

        assert_eq!(status.last_report.unwrap().created, 1);
        assert!(store.get(EntityKind::Contact, &id).is_none());
        trigger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_tick_sweeps() {
        let (_store, _backend, trigger) = setup(true, Some(Duration::from_millis(10)));

        let status = wait_for_sweeps(&trigger, 2).await;
        assert!(status.last_report.unwrap().is_idle());
        trigger.shutdown().await.unwrap();
    }
}
