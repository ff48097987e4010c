//! In-memory entity store
//!
//! Holds one ordered collection per [`EntityKind`]. Every operation takes the
//! lock, applies the change and releases it before returning, so a mutation is
//! visible to the very next read. The lock is synchronous and is never held
//! across an `.await`.
//!
//! Observers:
//! - [`EntityStore::subscribe`] yields a version counter bumped on every change
//!   (UI refresh, snapshot persistence)
//! - [`EntityStore::events`] broadcasts what changed (sweep scheduling)

use crate::error::SyncFailure;
use crate::record::{EntityKind, Identity, Payload, StoredRecord, SyncStatus};
use crate::remote::RemoteRecord;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{broadcast, watch};

/// Snapshot layout version written by [`EntityStore::snapshot`].
pub const SNAPSHOT_FORMAT: u32 = 1;

const EVENT_CAPACITY: usize = 256;

/// What happened to a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    /// Record appended by `add`
    Added,
    /// Record merged by `update`/`patch`
    Updated,
    /// Record soft-deleted by `remove`
    Removed,
    /// Whole collection replaced by `set_all`
    Replaced,
    /// Coordinator applied a remote outcome
    Reconciled,
    /// Record physically dropped after a confirmed (or unnecessary) delete
    Purged,
    /// Store rehydrated from a snapshot
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: Option<EntityKind>,
    pub id: Option<Identity>,
    pub change: StoreChange,
}

impl StoreEvent {
    /// Mutations that leave new local work for the coordinator.
    pub fn is_local_mutation(&self) -> bool {
        matches!(
            self.change,
            StoreChange::Added | StoreChange::Updated | StoreChange::Removed
        )
    }
}

/// Serialized form of the whole store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub format: u32,
    pub saved_at: DateTime<Utc>,
    pub collections: BTreeMap<EntityKind, Vec<StoredRecord>>,
}

impl StoreSnapshot {
    pub fn empty() -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            saved_at: Utc::now(),
            collections: BTreeMap::new(),
        }
    }

    pub fn summary(&self) -> StoreSummary {
        StoreSummary::from_collections(&self.collections)
    }
}

/// Record counts for one collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    pub synced: usize,
    pub pending: usize,
    pub error: usize,
    pub pending_delete: usize,
}

impl KindSummary {
    pub fn total(&self) -> usize {
        self.synced + self.pending + self.error
    }

    pub fn unsynced(&self) -> usize {
        self.pending + self.error
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub kinds: BTreeMap<EntityKind, KindSummary>,
}

impl StoreSummary {
    fn from_collections(collections: &BTreeMap<EntityKind, Vec<StoredRecord>>) -> Self {
        let mut kinds = BTreeMap::new();
        for (kind, records) in collections {
            let summary: &mut KindSummary = kinds.entry(*kind).or_default();
            for record in records {
                match record.sync_status {
                    SyncStatus::Synced => summary.synced += 1,
                    SyncStatus::Pending => summary.pending += 1,
                    SyncStatus::Error => summary.error += 1,
                }
                if record.pending_delete {
                    summary.pending_delete += 1;
                }
            }
        }
        Self { kinds }
    }

    pub fn unsynced(&self) -> usize {
        self.kinds.values().map(KindSummary::unsynced).sum()
    }
}

/// What the coordinator sends for one record, captured right before the call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dispatch {
    pub id: Identity,
    pub payload: Payload,
    pub revision: u64,
    pub attempts: u32,
    pub pending_delete: bool,
}

/// Result of applying a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CreateApplied {
    /// Local record replaced by the server record
    Rewritten { edited_meanwhile: bool },
    /// The server id was already present and the local duplicate was
    /// dropped. Edits made while the create was in flight are folded into
    /// the existing record, which goes back to pending.
    Deduplicated { edited_meanwhile: bool },
    /// The local record vanished while the call was in flight
    Missing,
}

pub struct EntityStore {
    collections: RwLock<BTreeMap<EntityKind, Vec<StoredRecord>>>,
    version: watch::Sender<u64>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            collections: RwLock::new(BTreeMap::new()),
            version,
            events,
        }
    }

    /// Store rehydrated from a persisted snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        *store.collections.write() = snapshot.collections;
        store
    }

    /// Version counter, bumped after every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    fn notify(&self, kind: Option<EntityKind>, id: Option<Identity>, change: StoreChange) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
        // No subscribers is fine.
        let _ = self.events.send(StoreEvent { kind, id, change });
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn records(&self, kind: EntityKind) -> Vec<StoredRecord> {
        self.collections
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, kind: EntityKind, id: &Identity) -> Option<StoredRecord> {
        self.collections
            .read()
            .get(&kind)
            .and_then(|records| records.iter().find(|r| &r.id == id))
            .cloned()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.collections.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.collections.read().values().all(Vec::is_empty)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            format: SNAPSHOT_FORMAT,
            saved_at: Utc::now(),
            collections: self.collections.read().clone(),
        }
    }

    pub fn summary(&self) -> StoreSummary {
        StoreSummary::from_collections(&self.collections.read())
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Replace a collection wholesale. Sync status is taken as given.
    pub fn set_all(&self, kind: EntityKind, records: Vec<StoredRecord>) -> bool {
        {
            let mut collections = self.collections.write();
            let current = collections.entry(kind).or_default();
            let identical = current.len() == records.len()
                && current.iter().zip(&records).all(|(a, b)| a.same_state(b));
            if identical {
                return false;
            }
            *current = records;
        }
        self.notify(Some(kind), None, StoreChange::Replaced);
        true
    }

    /// Append a record as pending. No-op if the id is already present.
    pub fn insert(&self, kind: EntityKind, mut record: StoredRecord) -> bool {
        let id = record.id.clone();
        {
            let mut collections = self.collections.write();
            let records = collections.entry(kind).or_default();
            if records.iter().any(|r| r.id == id) {
                tracing::debug!(kind = %kind, id = %id, "Ignoring add of existing record");
                return false;
            }
            record.sync_status = SyncStatus::Pending;
            record.revision = record.revision.max(1);
            records.push(record);
        }
        tracing::debug!(kind = %kind, id = %id, "Added record");
        self.notify(Some(kind), Some(id), StoreChange::Added);
        true
    }

    /// Merge top-level fields into an existing record and mark it pending.
    ///
    /// No-op when the record is missing, already soft-deleted, or the merge
    /// leaves the payload unchanged.
    pub fn merge(&self, kind: EntityKind, id: &Identity, patch: Payload) -> bool {
        {
            let mut collections = self.collections.write();
            let Some(record) = collections
                .get_mut(&kind)
                .and_then(|records| records.iter_mut().find(|r| &r.id == id))
            else {
                return false;
            };
            if record.pending_delete {
                return false;
            }

            let mut merged = record.payload.clone();
            for (key, value) in patch {
                if key != "id" {
                    merged.insert(key, value);
                }
            }
            if merged == record.payload {
                return false;
            }

            record.payload = merged;
            record.touch();
        }
        tracing::debug!(kind = %kind, id = %id, "Updated record");
        self.notify(Some(kind), Some(id.clone()), StoreChange::Updated);
        true
    }

    /// Soft delete: keep the record, flag it and mark it pending.
    pub fn mark_deleted(&self, kind: EntityKind, id: &Identity) -> bool {
        {
            let mut collections = self.collections.write();
            let Some(record) = collections
                .get_mut(&kind)
                .and_then(|records| records.iter_mut().find(|r| &r.id == id))
            else {
                return false;
            };
            if record.pending_delete {
                return false;
            }
            record.pending_delete = true;
            record.touch();
        }
        tracing::debug!(kind = %kind, id = %id, "Marked record for deletion");
        self.notify(Some(kind), Some(id.clone()), StoreChange::Removed);
        true
    }

    /// Replace the whole store with a snapshot.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        *self.collections.write() = snapshot.collections;
        self.notify(None, None, StoreChange::Restored);
    }

    // ------------------------------------------------------------------
    // Coordinator hooks
    // ------------------------------------------------------------------

    /// Ids that need syncing, in collection order, plus how many were
    /// skipped because their backoff has not elapsed.
    pub(crate) fn sync_candidates(
        &self,
        kind: EntityKind,
        due_before: Option<DateTime<Utc>>,
    ) -> (Vec<Identity>, usize) {
        let collections = self.collections.read();
        let Some(records) = collections.get(&kind) else {
            return (Vec::new(), 0);
        };

        let mut deferred = 0;
        let ids = records
            .iter()
            .filter(|r| r.needs_sync())
            .filter(|r| match due_before {
                Some(now) if !r.is_due(now) => {
                    deferred += 1;
                    false
                }
                _ => true,
            })
            .map(|r| r.id.clone())
            .collect();
        (ids, deferred)
    }

    /// Current state of a record about to be sent, if it still needs sending.
    pub(crate) fn dispatch(&self, kind: EntityKind, id: &Identity) -> Option<Dispatch> {
        let collections = self.collections.read();
        let record = collections.get(&kind)?.iter().find(|r| &r.id == id)?;
        record.needs_sync().then(|| Dispatch {
            id: record.id.clone(),
            payload: record.payload.clone(),
            revision: record.revision,
            attempts: record.attempts,
            pending_delete: record.pending_delete,
        })
    }

    /// Swap a local record for the server's copy.
    pub(crate) fn complete_create(
        &self,
        kind: EntityKind,
        local_id: &Identity,
        revision: u64,
        remote: RemoteRecord,
    ) -> CreateApplied {
        let remote_id = Identity::Remote(remote.id);
        let applied = {
            let mut collections = self.collections.write();
            let records = collections.entry(kind).or_default();
            let Some(position) = records.iter().position(|r| &r.id == local_id) else {
                return CreateApplied::Missing;
            };

            if records.iter().any(|r| r.id == remote_id) {
                let local = records.remove(position);
                let edited_meanwhile = local.revision != revision;
                if edited_meanwhile {
                    if let Some(existing) = records.iter_mut().find(|r| r.id == remote_id) {
                        for (key, value) in local.payload {
                            if key != "id" {
                                existing.payload.insert(key, value);
                            }
                        }
                        existing.pending_delete |= local.pending_delete;
                        existing.touch();
                    }
                }
                CreateApplied::Deduplicated { edited_meanwhile }
            } else {
                let local = records.remove(position);
                let edited_meanwhile = local.revision != revision;
                let replacement = if edited_meanwhile {
                    // Keep the newer local edit; the next sweep sends it as an update.
                    StoredRecord {
                        id: remote_id.clone(),
                        attempts: 0,
                        next_attempt_at: None,
                        last_error: None,
                        ..local
                    }
                } else {
                    StoredRecord::synced(remote_id.clone(), remote.payload)
                };
                records.insert(position, replacement);
                CreateApplied::Rewritten { edited_meanwhile }
            }
        };
        self.notify(Some(kind), Some(remote_id), StoreChange::Reconciled);
        applied
    }

    /// Mark a record synced unless it was edited after `revision` was sent.
    pub(crate) fn complete_update(&self, kind: EntityKind, id: &Identity, revision: u64) -> bool {
        let synced = {
            let mut collections = self.collections.write();
            let Some(record) = collections
                .get_mut(&kind)
                .and_then(|records| records.iter_mut().find(|r| &r.id == id))
            else {
                return false;
            };
            if record.revision != revision {
                false
            } else {
                record.mark_synced();
                true
            }
        };
        if synced {
            self.notify(Some(kind), Some(id.clone()), StoreChange::Reconciled);
        }
        synced
    }

    /// Physically drop a soft-deleted record.
    pub(crate) fn purge(&self, kind: EntityKind, id: &Identity) -> bool {
        {
            let mut collections = self.collections.write();
            let Some(records) = collections.get_mut(&kind) else {
                return false;
            };
            let before = records.len();
            records.retain(|r| !(&r.id == id && r.pending_delete));
            if records.len() == before {
                return false;
            }
        }
        self.notify(Some(kind), Some(id.clone()), StoreChange::Purged);
        true
    }

    /// Record a failed attempt. An edit made while the call was in flight
    /// supersedes the failure and keeps the record pending.
    pub(crate) fn fail(
        &self,
        kind: EntityKind,
        id: &Identity,
        revision: u64,
        failure: &SyncFailure,
        retry_at: DateTime<Utc>,
    ) -> bool {
        {
            let mut collections = self.collections.write();
            let Some(record) = collections
                .get_mut(&kind)
                .and_then(|records| records.iter_mut().find(|r| &r.id == id))
            else {
                return false;
            };
            if record.revision != revision {
                return false;
            }
            record.mark_failed(failure, retry_at);
        }
        self.notify(Some(kind), Some(id.clone()), StoreChange::Reconciled);
        true
    }
}
