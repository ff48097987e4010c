// Property tests: store invariants hold across random edits, failures and sweeps
use crm_sync::entities::Contact;
use crm_sync::{
    EntityKind, EntityStore, Identity, MemoryBackend, RetryPolicy, SyncCoordinator, SyncFailure,
    SyncStatus,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Add(String),
    Rename(usize, String),
    Remove(usize),
    Sweep { failing: bool },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[a-z]{1,6}".prop_map(Op::Add),
        (any::<usize>(), "[a-z]{1,6}").prop_map(|(i, name)| Op::Rename(i, name)),
        any::<usize>().prop_map(Op::Remove),
        any::<bool>().prop_map(|failing| Op::Sweep { failing }),
    ]
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn contact(name: &str) -> Contact {
    Contact {
        name: name.to_string(),
        ..Contact::default()
    }
}

fn pick(store: &EntityStore, index: usize) -> Option<Identity> {
    let records = store.records(EntityKind::Contact);
    if records.is_empty() {
        return None;
    }
    Some(records[index % records.len()].id.clone())
}

fn assert_invariants(store: &EntityStore) {
    for record in store.records(EntityKind::Contact) {
        assert!(matches!(
            record.sync_status,
            SyncStatus::Synced | SyncStatus::Pending | SyncStatus::Error
        ));
        if record.pending_delete {
            assert_ne!(record.sync_status, SyncStatus::Synced);
        }
        if record.id.is_local() {
            assert_ne!(record.sync_status, SyncStatus::Synced);
        }
    }
}

async fn run(ops: Vec<Op>) {
    let store = Arc::new(EntityStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let coordinator = SyncCoordinator::with_policy(
        store.clone(),
        backend.clone(),
        Duration::from_secs(5),
        RetryPolicy::default(),
    );
    let contacts = store.repo::<Contact>();

    for op in ops {
        match op {
            Op::Add(name) => {
                contacts.add(&contact(&name)).unwrap();
            }
            Op::Rename(index, name) => {
                if let Some(id) = pick(&store, index) {
                    contacts.update(&id, &contact(&name)).unwrap();
                }
            }
            Op::Remove(index) => {
                if let Some(id) = pick(&store, index) {
                    contacts.remove(&id);
                }
            }
            Op::Sweep { failing } => {
                backend.set_failure(failing.then(|| SyncFailure::Network("offline".to_string())));
                coordinator.sync_all().await;
            }
        }
        assert_invariants(&store);
    }

    // Once the backend is reachable, one sweep converges everything.
    backend.set_failure(None);
    coordinator.sync_all().await;

    let records = store.records(EntityKind::Contact);
    let rows = backend.rows(EntityKind::Contact);
    assert_eq!(records.len(), rows.len());
    for record in records {
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(!record.pending_delete);
        let remote_id = record.id.remote_id().unwrap();
        assert_eq!(rows[remote_id], record.payload);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_store_converges_after_random_history(ops in prop::collection::vec(op(), 0..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run(ops));
    }
}
