//! Remote backend seam
//!
//! The backend exposes one logical table per [`EntityKind`] with plain CRUD.
//! Implementations:
//! - [`RestBackend`]: PostgREST-style HTTP API
//! - [`MemoryBackend`]: in-process tables, for tests and demos

pub mod memory;
pub mod rest;

pub use memory::MemoryBackend;
pub use rest::{RestBackend, RestConfig};

use crate::error::SyncFailure;
use crate::record::{EntityKind, Payload};
use async_trait::async_trait;
use serde_json::Value;

/// A row as the backend returned it: server id plus domain fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub payload: Payload,
}

impl RemoteRecord {
    /// Split a returned row into its id and the remaining fields.
    pub fn from_row(row: Value) -> Result<Self, SyncFailure> {
        let Value::Object(mut payload) = row else {
            return Err(SyncFailure::Decode("row is not a JSON object".to_string()));
        };
        let id = match payload.remove("id") {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            Some(other) => {
                return Err(SyncFailure::Decode(format!("unsupported id value: {other}")))
            }
            None => return Err(SyncFailure::Decode("row has no id".to_string())),
        };
        Ok(Self { id, payload })
    }
}

/// CRUD access to the remote tables.
///
/// Payloads never carry sync bookkeeping; ids are server ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert a row and return it with its server-assigned id.
    async fn create(&self, kind: EntityKind, payload: Payload) -> Result<RemoteRecord, SyncFailure>;

    async fn update(&self, kind: EntityKind, id: &str, payload: Payload) -> Result<(), SyncFailure>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), SyncFailure>;
}
