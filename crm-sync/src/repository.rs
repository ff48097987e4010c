//! Typed access to one collection of the store

use crate::error::{SyncError, SyncResult};
use crate::record::{to_payload, Entity, EntityRecord, Identity, StoredRecord};
use crate::store::EntityStore;
use serde_json::Value;
use std::marker::PhantomData;

impl EntityStore {
    /// Typed repository for entities of type `E`.
    pub fn repo<E: Entity>(&self) -> Repository<'_, E> {
        Repository {
            store: self,
            _entity: PhantomData,
        }
    }
}

/// Typed view over the collection of `E::KIND`.
///
/// Mutations apply immediately and return `Ok(false)` when they were no-ops.
/// They never touch the network; the coordinator picks the changes up later.
pub struct Repository<'a, E> {
    store: &'a EntityStore,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Repository<'_, E> {
    /// Replace the collection, keeping each record's sync status as given.
    pub fn set_all(&self, records: Vec<EntityRecord<E>>) -> SyncResult<bool> {
        let stored = records
            .into_iter()
            .map(EntityRecord::into_stored)
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(self.store.set_all(E::KIND, stored))
    }

    /// Append a new record under a freshly minted local identity.
    pub fn add(&self, entity: &E) -> SyncResult<Identity> {
        let id = Identity::mint(E::KIND);
        self.store
            .insert(E::KIND, StoredRecord::pending(id.clone(), to_payload(entity)?));
        Ok(id)
    }

    /// Append a new record under a caller-chosen identity.
    pub fn add_with_id(&self, id: Identity, entity: &E) -> SyncResult<bool> {
        Ok(self
            .store
            .insert(E::KIND, StoredRecord::pending(id, to_payload(entity)?)))
    }

    pub fn update(&self, id: &Identity, entity: &E) -> SyncResult<bool> {
        Ok(self.store.merge(E::KIND, id, to_payload(entity)?))
    }

    /// Merge a partial JSON object into the record.
    pub fn patch(&self, id: &Identity, fields: Value) -> SyncResult<bool> {
        match fields {
            Value::Object(fields) => Ok(self.store.merge(E::KIND, id, fields)),
            other => Err(SyncError::InvalidPayload {
                kind: E::KIND.to_string(),
                reason: format!("patch must be a JSON object, got {other}"),
            }),
        }
    }

    /// Soft delete; the record stays visible to `list` until the backend
    /// confirms.
    pub fn remove(&self, id: &Identity) -> bool {
        self.store.mark_deleted(E::KIND, id)
    }

    pub fn get(&self, id: &Identity) -> SyncResult<Option<EntityRecord<E>>> {
        self.store
            .get(E::KIND, id)
            .map(|stored| EntityRecord::from_stored(&stored))
            .transpose()
    }

    /// Every record, including ones marked for deletion.
    pub fn list(&self) -> SyncResult<Vec<EntityRecord<E>>> {
        self.collect(|_| true)
    }

    /// Records not marked for deletion.
    pub fn active(&self) -> SyncResult<Vec<EntityRecord<E>>> {
        self.collect(StoredRecord::is_active)
    }

    /// Records waiting for the backend (Pending or Error).
    pub fn pending(&self) -> SyncResult<Vec<EntityRecord<E>>> {
        self.collect(StoredRecord::needs_sync)
    }

    pub fn len(&self) -> usize {
        self.store.len(E::KIND)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect(&self, keep: impl Fn(&StoredRecord) -> bool) -> SyncResult<Vec<EntityRecord<E>>> {
        self.store
            .records(E::KIND)
            .iter()
            .filter(|record| keep(*record))
            .map(EntityRecord::from_stored)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Contact, Task, TaskStatus};
    use crate::record::SyncStatus;
    use serde_json::json;

    fn contact(name: &str) -> Contact {
        Contact {
            name: name.to_string(),
            ..Contact::default()
        }
    }

    #[test]
    fn test_add_mints_local_pending_record() {
        let store = EntityStore::new();
        let contacts = store.repo::<Contact>();

        let id = contacts.add(&contact("Ana")).unwrap();

        assert!(id.is_local());
        let record = contacts.get(&id).unwrap().unwrap();
        assert_eq!(record.data.name, "Ana");
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(contacts.len(), 1);
    }

    #[test]
    fn test_add_with_existing_id_is_noop() {
        let store = EntityStore::new();
        let contacts = store.repo::<Contact>();
        let id = Identity::local("contact-1");

        assert!(contacts.add_with_id(id.clone(), &contact("Ana")).unwrap());
        assert!(!contacts.add_with_id(id.clone(), &contact("Bea")).unwrap());
        assert_eq!(contacts.get(&id).unwrap().unwrap().data.name, "Ana");
    }

    #[test]
    fn test_update_can_clear_optional_fields() {
        let store = EntityStore::new();
        let contacts = store.repo::<Contact>();
        let original = Contact {
            email: Some("ana@example.com".to_string()),
            ..contact("Ana")
        };
        contacts
            .set_all(vec![EntityRecord::synced("c-1", original)])
            .unwrap();
        let id = Identity::remote("c-1");

        assert!(contacts.update(&id, &contact("Ana")).unwrap());

        let record = contacts.get(&id).unwrap().unwrap();
        assert_eq!(record.data.email, None);
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_patch_merges_fields() {
        let store = EntityStore::new();
        let tasks = store.repo::<Task>();
        let id = tasks
            .add(&Task {
                title: "Call Ana".to_string(),
                ..Task::default()
            })
            .unwrap();

        assert!(tasks.patch(&id, json!({"status": "done"})).unwrap());
        let task = tasks.get(&id).unwrap().unwrap().data;
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.title, "Call Ana");

        assert!(tasks.patch(&id, json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_active_excludes_pending_deletes() {
        let store = EntityStore::new();
        let contacts = store.repo::<Contact>();
        contacts
            .set_all(vec![
                EntityRecord::synced("c-1", contact("Ana")),
                EntityRecord::synced("c-2", contact("Bea")),
            ])
            .unwrap();

        assert!(contacts.remove(&Identity::remote("c-1")));

        let active = contacts.active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].data.name, "Bea");
        assert_eq!(contacts.list().unwrap().len(), 2);
        assert_eq!(contacts.pending().unwrap().len(), 1);
    }
}
