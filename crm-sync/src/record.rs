//! Entity records and their synchronization bookkeeping
//!
//! A record is a JSON object payload plus:
//! - an [`Identity`] that says whether the backend has ever seen it
//! - a tri-state [`SyncStatus`]
//! - a soft-delete marker and retry bookkeeping

use crate::error::{SyncError, SyncFailure, SyncResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Domain fields of a record, without any sync bookkeeping.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Every business collection the store holds.
///
/// The declaration order is the order a sweep visits collections in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "contacts")]
    Contact,
    #[serde(rename = "leads")]
    Lead,
    #[serde(rename = "deals")]
    Deal,
    #[serde(rename = "tasks")]
    Task,
    #[serde(rename = "projects")]
    Project,
    #[serde(rename = "time_entries")]
    TimeEntry,
    #[serde(rename = "invoices")]
    Invoice,
    #[serde(rename = "calendar_events")]
    CalendarEvent,
    #[serde(rename = "chat_messages")]
    ChatMessage,
    #[serde(rename = "media_files")]
    MediaFile,
    #[serde(rename = "support_tickets")]
    SupportTicket,
    #[serde(rename = "team_members")]
    TeamMember,
    #[serde(rename = "email_templates")]
    EmailTemplate,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Contact,
        EntityKind::Lead,
        EntityKind::Deal,
        EntityKind::Task,
        EntityKind::Project,
        EntityKind::TimeEntry,
        EntityKind::Invoice,
        EntityKind::CalendarEvent,
        EntityKind::ChatMessage,
        EntityKind::MediaFile,
        EntityKind::SupportTicket,
        EntityKind::TeamMember,
        EntityKind::EmailTemplate,
    ];

    /// Collection (and remote table) name.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contacts",
            EntityKind::Lead => "leads",
            EntityKind::Deal => "deals",
            EntityKind::Task => "tasks",
            EntityKind::Project => "projects",
            EntityKind::TimeEntry => "time_entries",
            EntityKind::Invoice => "invoices",
            EntityKind::CalendarEvent => "calendar_events",
            EntityKind::ChatMessage => "chat_messages",
            EntityKind::MediaFile => "media_files",
            EntityKind::SupportTicket => "support_tickets",
            EntityKind::TeamMember => "team_members",
            EntityKind::EmailTemplate => "email_templates",
        }
    }

    /// Singular name, used when minting local tokens.
    pub fn singular(&self) -> &'static str {
        match self {
            EntityKind::Contact => "contact",
            EntityKind::Lead => "lead",
            EntityKind::Deal => "deal",
            EntityKind::Task => "task",
            EntityKind::Project => "project",
            EntityKind::TimeEntry => "time-entry",
            EntityKind::Invoice => "invoice",
            EntityKind::CalendarEvent => "event",
            EntityKind::ChatMessage => "message",
            EntityKind::MediaFile => "media",
            EntityKind::SupportTicket => "ticket",
            EntityKind::TeamMember => "member",
            EntityKind::EmailTemplate => "template",
        }
    }

    pub fn from_table(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.table() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Who issued a record's identifier.
///
/// `Local` records have never been created remotely. A successful create
/// replaces the whole record with a `Remote` one; a `Local` identity never
/// turns into a `Remote` one in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Local(String),
    Remote(String),
}

impl Identity {
    /// Mint a fresh client-side identity for a record of `kind`.
    pub fn mint(kind: EntityKind) -> Self {
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        Identity::Local(format!(
            "{}-{}-{}",
            kind.singular(),
            Utc::now().timestamp_millis(),
            suffix
        ))
    }

    pub fn local(token: impl Into<String>) -> Self {
        Identity::Local(token.into())
    }

    pub fn remote(id: impl Into<String>) -> Self {
        Identity::Remote(id.into())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Identity::Local(_))
    }

    /// Server id, if the backend has issued one.
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Identity::Remote(id) => Some(id),
            Identity::Local(_) => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Local(token) => write!(f, "temp-{token}"),
            Identity::Remote(id) => f.write_str(id),
        }
    }
}

/// Synchronization state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Matches the backend
    Synced,
    /// Local change not yet confirmed remotely
    Pending,
    /// Last remote attempt failed; retried by later sweeps
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untyped record as held by the store and written to snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Identity,

    pub payload: Payload,

    pub sync_status: SyncStatus,

    /// Logically deleted, waiting for the backend to confirm
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_delete: bool,

    /// Bumped on every local mutation
    #[serde(default)]
    pub revision: u64,

    /// Consecutive failed remote attempts
    #[serde(default)]
    pub attempts: u32,

    /// Earliest time an automatic sweep retries this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StoredRecord {
    /// Fresh local edit, not yet seen by the backend.
    pub fn pending(id: Identity, payload: Payload) -> Self {
        Self {
            id,
            payload,
            sync_status: SyncStatus::Pending,
            pending_delete: false,
            revision: 1,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Record exactly as the backend reported it.
    pub fn synced(id: Identity, payload: Payload) -> Self {
        Self {
            sync_status: SyncStatus::Synced,
            revision: 0,
            ..Self::pending(id, payload)
        }
    }

    pub fn needs_sync(&self) -> bool {
        matches!(self.sync_status, SyncStatus::Pending | SyncStatus::Error)
    }

    /// Visible to "active" queries.
    pub fn is_active(&self) -> bool {
        !self.pending_delete
    }

    /// Whether an automatic sweep may retry this record at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match (self.sync_status, self.next_attempt_at) {
            (SyncStatus::Error, Some(at)) => at <= now,
            _ => self.needs_sync(),
        }
    }

    /// Structural equality on what the UI can observe.
    pub fn same_state(&self, other: &StoredRecord) -> bool {
        self.id == other.id
            && self.payload == other.payload
            && self.sync_status == other.sync_status
            && self.pending_delete == other.pending_delete
    }

    /// A local edit: back to pending with retry state cleared.
    pub(crate) fn touch(&mut self) {
        self.sync_status = SyncStatus::Pending;
        self.revision = self.revision.saturating_add(1);
        self.attempts = 0;
        self.next_attempt_at = None;
    }

    pub(crate) fn mark_synced(&mut self) {
        self.sync_status = SyncStatus::Synced;
        self.attempts = 0;
        self.next_attempt_at = None;
        self.last_error = None;
    }

    pub(crate) fn mark_failed(&mut self, failure: &SyncFailure, retry_at: DateTime<Utc>) {
        self.sync_status = SyncStatus::Error;
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt_at = Some(retry_at);
        self.last_error = Some(failure.to_string());
    }
}

/// A business type that lives in one of the store's collections.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;
}

/// Typed view of a [`StoredRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord<E> {
    pub id: Identity,
    pub data: E,
    pub sync_status: SyncStatus,
    pub pending_delete: bool,
    pub last_error: Option<String>,
}

impl<E: Entity> EntityRecord<E> {
    /// Record as returned by a remote listing, already synced.
    pub fn synced(id: impl Into<String>, data: E) -> Self {
        Self {
            id: Identity::Remote(id.into()),
            data,
            sync_status: SyncStatus::Synced,
            pending_delete: false,
            last_error: None,
        }
    }

    pub fn from_stored(stored: &StoredRecord) -> SyncResult<Self> {
        let data = serde_json::from_value(serde_json::Value::Object(stored.payload.clone()))
            .map_err(|e| SyncError::InvalidPayload {
                kind: E::KIND.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            id: stored.id.clone(),
            data,
            sync_status: stored.sync_status,
            pending_delete: stored.pending_delete,
            last_error: stored.last_error.clone(),
        })
    }

    pub fn into_stored(self) -> SyncResult<StoredRecord> {
        let mut stored = StoredRecord::pending(self.id, to_payload(&self.data)?);
        stored.sync_status = self.sync_status;
        stored.pending_delete = self.pending_delete;
        stored.last_error = self.last_error;
        Ok(stored)
    }
}

/// Serialize an entity into its payload object.
pub fn to_payload<E: Entity>(entity: &E) -> SyncResult<Payload> {
    match serde_json::to_value(entity)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(SyncError::InvalidPayload {
            kind: E::KIND.to_string(),
            reason: format!("expected a JSON object, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_kind_tables_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_table(kind.table()), Some(kind));
        }
        assert_eq!(EntityKind::from_table("patients"), None);
    }

    #[test]
    fn test_kind_serializes_as_table_name() {
        let json = serde_json::to_string(&EntityKind::TimeEntry).unwrap();
        assert_eq!(json, "\"time_entries\"");
    }

    #[test]
    fn test_minted_identity_is_local_and_unique() {
        let a = Identity::mint(EntityKind::Contact);
        let b = Identity::mint(EntityKind::Contact);

        assert!(a.is_local());
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("temp-contact-"));
        assert_eq!(a.remote_id(), None);
    }

    #[test]
    fn test_identity_serialization_is_tagged() {
        let json = serde_json::to_value(Identity::remote("c-77")).unwrap();
        assert_eq!(json, serde_json::json!({"remote": "c-77"}));
    }

    #[test]
    fn test_failed_record_waits_for_backoff() {
        let now = Utc::now();
        let mut record = StoredRecord::pending(Identity::remote("t-1"), Payload::new());
        assert!(record.is_due(now));

        record.mark_failed(&SyncFailure::NotFound, now + Duration::seconds(30));
        assert_eq!(record.sync_status, SyncStatus::Error);
        assert_eq!(record.attempts, 1);
        assert!(!record.is_due(now));
        assert!(record.is_due(now + Duration::seconds(31)));

        record.touch();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.is_due(now));
    }

    #[test]
    fn test_bookkeeping_defaults_when_missing() {
        let record: StoredRecord = serde_json::from_value(serde_json::json!({
            "id": {"local": "task-1"},
            "payload": {"title": "Call Ana"},
            "sync_status": "error"
        }))
        .unwrap();

        assert!(!record.pending_delete);
        assert_eq!(record.revision, 0);
        assert!(record.needs_sync());
    }
}
