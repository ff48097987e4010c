//! In-process backend

use super::{RemoteBackend, RemoteRecord};
use crate::error::SyncFailure;
use crate::record::{EntityKind, Payload};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Remote call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

/// Backend that keeps its tables in memory.
///
/// Failures and latency can be switched on to simulate an unreachable or slow
/// server. Server ids are `<kind>-<n>`.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<BTreeMap<EntityKind, BTreeMap<String, Payload>>>,
    failure: Mutex<Option<SyncFailure>>,
    latency: Mutex<Option<Duration>>,
    next_id: AtomicU64,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with `failure` until cleared with `None`.
    pub fn set_failure(&self, failure: Option<SyncFailure>) {
        *self.failure.lock() = failure;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Put a row straight into a table.
    pub fn seed(&self, kind: EntityKind, id: impl Into<String>, payload: Payload) {
        self.tables
            .lock()
            .entry(kind)
            .or_default()
            .insert(id.into(), payload);
    }

    pub fn row(&self, kind: EntityKind, id: &str) -> Option<Payload> {
        self.tables.lock().get(&kind).and_then(|t| t.get(id)).cloned()
    }

    pub fn rows(&self, kind: EntityKind) -> BTreeMap<String, Payload> {
        self.tables.lock().get(&kind).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            creates: self.creates.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    async fn enter(&self, counter: &AtomicUsize) -> Result<(), SyncFailure> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.failure.lock().clone() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn create(&self, kind: EntityKind, payload: Payload) -> Result<RemoteRecord, SyncFailure> {
        self.enter(&self.creates).await?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}", kind.singular(), n);
        self.seed(kind, id.clone(), payload.clone());
        Ok(RemoteRecord { id, payload })
    }

    async fn update(&self, kind: EntityKind, id: &str, payload: Payload) -> Result<(), SyncFailure> {
        self.enter(&self.updates).await?;
        let mut tables = self.tables.lock();
        let row = tables
            .get_mut(&kind)
            .and_then(|t| t.get_mut(id))
            .ok_or(SyncFailure::NotFound)?;
        *row = payload;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), SyncFailure> {
        self.enter(&self.deletes).await?;
        self.tables
            .lock()
            .get_mut(&kind)
            .and_then(|t| t.remove(id))
            .map(|_| ())
            .ok_or(SyncFailure::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let backend = MemoryBackend::new();
        let first = backend
            .create(EntityKind::Contact, payload(json!({"name": "Ana"})))
            .await
            .unwrap();
        let second = backend
            .create(EntityKind::Task, payload(json!({"title": "Call"})))
            .await
            .unwrap();

        assert_eq!(first.id, "contact-1");
        assert_eq!(second.id, "task-2");
        assert_eq!(backend.rows(EntityKind::Contact).len(), 1);
        assert_eq!(backend.calls().creates, 2);
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_rows() {
        let backend = MemoryBackend::new();
        let err = backend
            .update(EntityKind::Task, "t-1", Payload::new())
            .await
            .unwrap_err();
        assert_eq!(err, SyncFailure::NotFound);

        backend.seed(EntityKind::Task, "t-1", payload(json!({"title": "A"})));
        backend
            .update(EntityKind::Task, "t-1", payload(json!({"title": "B"})))
            .await
            .unwrap();
        assert_eq!(backend.row(EntityKind::Task, "t-1").unwrap()["title"], "B");

        backend.delete(EntityKind::Task, "t-1").await.unwrap();
        assert_eq!(
            backend.delete(EntityKind::Task, "t-1").await.unwrap_err(),
            SyncFailure::NotFound
        );
    }

    #[tokio::test]
    async fn test_configured_failure_is_returned() {
        let backend = MemoryBackend::new();
        backend.set_failure(Some(SyncFailure::Network("offline".into())));

        let err = backend
            .create(EntityKind::Contact, Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncFailure::Network(_)));
        assert!(backend.rows(EntityKind::Contact).is_empty());
        assert_eq!(backend.calls().total(), 1);
    }
}
