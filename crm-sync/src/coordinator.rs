//! Sync coordinator
//!
//! Pushes every Pending/Error record toward the backend:
//! - local identity: create, then swap the record for the server's copy
//! - remote identity: update
//! - soft-deleted: remote delete (local-only records are just dropped)
//!
//! Collections are swept concurrently; within one collection records go in
//! collection order. A record already being synced by another sweep is
//! skipped, so overlapping triggers never issue the same create twice.

use crate::config::{millis, RetryPolicy, SyncConfig};
use crate::error::SyncFailure;
use crate::record::{EntityKind, Identity};
use crate::remote::RemoteBackend;
use crate::store::{CreateApplied, Dispatch, EntityStore};
use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which records a sweep considers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Every Pending/Error record, backoff ignored
    All,
    /// Pending records and Error records whose backoff has elapsed
    Due,
}

/// Outcome counts of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Local-only records removed without a remote call
    pub dropped: usize,
    pub failed: usize,
    /// Remote call finished but a newer local edit keeps the record pending
    pub superseded: usize,
    pub skipped_in_flight: usize,
    /// Error records still inside their backoff window
    pub deferred: usize,
}

impl SweepReport {
    fn merge(&mut self, other: &SweepReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.dropped += other.dropped;
        self.failed += other.failed;
        self.superseded += other.superseded;
        self.skipped_in_flight += other.skipped_in_flight;
        self.deferred += other.deferred;
    }

    /// Records this sweep acted on.
    pub fn attempted(&self) -> usize {
        self.created + self.updated + self.deleted + self.dropped + self.failed + self.superseded
    }

    pub fn is_idle(&self) -> bool {
        self.attempted() == 0
    }
}

type FlightKey = (EntityKind, Identity);

/// Claim on one record; released on drop, including when a sweep is cancelled.
struct InFlight<'a> {
    set: &'a DashSet<FlightKey>,
    key: FlightKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

pub struct SyncCoordinator {
    store: Arc<EntityStore>,
    backend: Arc<dyn RemoteBackend>,
    request_timeout: Duration,
    retry: RetryPolicy,
    in_flight: DashSet<FlightKey>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<EntityStore>, backend: Arc<dyn RemoteBackend>, config: &SyncConfig) -> Self {
        Self::with_policy(store, backend, config.request_timeout, config.retry.clone())
    }

    pub fn with_policy(
        store: Arc<EntityStore>,
        backend: Arc<dyn RemoteBackend>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            backend,
            request_timeout,
            retry,
            in_flight: DashSet::new(),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Number of records currently being synced.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Sweep every unsynchronized record, ignoring backoff.
    pub async fn sync_all(&self) -> SweepReport {
        self.sweep(SweepMode::All).await
    }

    /// Sweep records that are due according to the retry policy.
    pub async fn sync_due(&self) -> SweepReport {
        self.sweep(SweepMode::Due).await
    }

    pub async fn sweep(&self, mode: SweepMode) -> SweepReport {
        let started = Instant::now();
        let reports = futures::future::join_all(
            EntityKind::ALL
                .into_iter()
                .map(|kind| self.sync_kind(kind, mode)),
        )
        .await;

        let mut report = SweepReport::default();
        for kind_report in &reports {
            report.merge(kind_report);
        }

        if report.is_idle() {
            tracing::debug!(
                mode = ?mode,
                skipped_in_flight = report.skipped_in_flight,
                deferred = report.deferred,
                "Sweep found nothing to sync"
            );
        } else {
            tracing::info!(
                mode = ?mode,
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                dropped = report.dropped,
                failed = report.failed,
                superseded = report.superseded,
                skipped_in_flight = report.skipped_in_flight,
                deferred = report.deferred,
                elapsed_ms = millis(started.elapsed()),
                "Sweep completed"
            );
        }
        report
    }

    async fn sync_kind(&self, kind: EntityKind, mode: SweepMode) -> SweepReport {
        let mut report = SweepReport::default();
        let due_before = (mode == SweepMode::Due).then(Utc::now);
        let (candidates, deferred) = self.store.sync_candidates(kind, due_before);
        report.deferred = deferred;

        for id in candidates {
            let Some(_claim) = self.claim(kind, &id) else {
                tracing::debug!(kind = %kind, id = %id, "Record already in flight, skipping");
                report.skipped_in_flight += 1;
                continue;
            };
            // Re-read under the claim: the record may have synced or vanished.
            let Some(dispatch) = self.store.dispatch(kind, &id) else {
                continue;
            };
            self.sync_record(kind, dispatch, &mut report).await;
        }
        report
    }

    fn claim(&self, kind: EntityKind, id: &Identity) -> Option<InFlight<'_>> {
        let key = (kind, id.clone());
        self.in_flight.insert(key.clone()).then(|| InFlight {
            set: &self.in_flight,
            key,
        })
    }

    async fn sync_record(&self, kind: EntityKind, dispatch: Dispatch, report: &mut SweepReport) {
        match (&dispatch.id, dispatch.pending_delete) {
            (Identity::Local(_), true) => {
                if self.store.purge(kind, &dispatch.id) {
                    tracing::debug!(kind = %kind, id = %dispatch.id, "Dropped never-created record");
                    report.dropped += 1;
                }
            }
            (Identity::Local(_), false) => self.push_create(kind, dispatch, report).await,
            (Identity::Remote(remote_id), true) => {
                let remote_id = remote_id.clone();
                self.push_delete(kind, &remote_id, dispatch, report).await;
            }
            (Identity::Remote(remote_id), false) => {
                let remote_id = remote_id.clone();
                self.push_update(kind, &remote_id, dispatch, report).await;
            }
        }
    }

    async fn push_create(&self, kind: EntityKind, dispatch: Dispatch, report: &mut SweepReport) {
        let result = self
            .bounded(self.backend.create(kind, dispatch.payload.clone()))
            .await;

        match result {
            Ok(remote) => {
                let remote_id = remote.id.clone();
                match self
                    .store
                    .complete_create(kind, &dispatch.id, dispatch.revision, remote)
                {
                    CreateApplied::Rewritten { edited_meanwhile } => {
                        tracing::debug!(
                            kind = %kind,
                            local_id = %dispatch.id,
                            remote_id = %remote_id,
                            edited_meanwhile,
                            "Created remote record"
                        );
                        if edited_meanwhile {
                            report.superseded += 1;
                        } else {
                            report.created += 1;
                        }
                    }
                    CreateApplied::Deduplicated { edited_meanwhile } => {
                        tracing::debug!(
                            kind = %kind,
                            local_id = %dispatch.id,
                            remote_id = %remote_id,
                            edited_meanwhile,
                            "Server record already present, dropped local copy"
                        );
                        if edited_meanwhile {
                            report.superseded += 1;
                        } else {
                            report.created += 1;
                        }
                    }
                    CreateApplied::Missing => {
                        tracing::warn!(
                            kind = %kind,
                            local_id = %dispatch.id,
                            remote_id = %remote_id,
                            "Local record disappeared during create"
                        );
                    }
                }
            }
            Err(failure) => self.record_failure(kind, &dispatch, &failure, report),
        }
    }

    async fn push_update(
        &self,
        kind: EntityKind,
        remote_id: &str,
        dispatch: Dispatch,
        report: &mut SweepReport,
    ) {
        let result = self
            .bounded(self.backend.update(kind, remote_id, dispatch.payload.clone()))
            .await;

        match result {
            Ok(()) => {
                if self.store.complete_update(kind, &dispatch.id, dispatch.revision) {
                    tracing::debug!(kind = %kind, id = %remote_id, "Updated remote record");
                    report.updated += 1;
                } else {
                    report.superseded += 1;
                }
            }
            Err(failure) => self.record_failure(kind, &dispatch, &failure, report),
        }
    }

    async fn push_delete(
        &self,
        kind: EntityKind,
        remote_id: &str,
        dispatch: Dispatch,
        report: &mut SweepReport,
    ) {
        match self.bounded(self.backend.delete(kind, remote_id)).await {
            // Already gone remotely counts as confirmed.
            Ok(()) | Err(SyncFailure::NotFound) => {
                if self.store.purge(kind, &dispatch.id) {
                    tracing::debug!(kind = %kind, id = %remote_id, "Deleted remote record");
                    report.deleted += 1;
                }
            }
            Err(failure) => self.record_failure(kind, &dispatch, &failure, report),
        }
    }

    fn record_failure(
        &self,
        kind: EntityKind,
        dispatch: &Dispatch,
        failure: &SyncFailure,
        report: &mut SweepReport,
    ) {
        let attempts = dispatch.attempts.saturating_add(1);
        let retry_at = self.retry.retry_at(Utc::now(), attempts);

        if self
            .store
            .fail(kind, &dispatch.id, dispatch.revision, failure, retry_at)
        {
            tracing::warn!(
                kind = %kind,
                id = %dispatch.id,
                attempts,
                retry_at = %retry_at,
                error = %failure,
                "Record sync failed"
            );
            report.failed += 1;
        } else {
            report.superseded += 1;
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, SyncFailure>>,
    ) -> Result<T, SyncFailure> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .unwrap_or(Err(SyncFailure::Timeout(self.request_timeout)))
    }
}
