//! Business payloads held by the store
//!
//! Cross-collection references are denormalized display fields
//! (`contact_name`, `project_name`, ...) rather than foreign keys, so a record
//! never dangles when the record it mentions is still local or gone.

use crate::record::{Entity, EntityKind};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! impl_entity {
    ($($ty:ty => $kind:expr),+ $(,)?) => {
        $(
            impl Entity for $ty {
                const KIND: EntityKind = $kind;
            }
        )+
    };
}

impl_entity! {
    Contact => EntityKind::Contact,
    Lead => EntityKind::Lead,
    Deal => EntityKind::Deal,
    Task => EntityKind::Task,
    Project => EntityKind::Project,
    TimeEntry => EntityKind::TimeEntry,
    Invoice => EntityKind::Invoice,
    CalendarEvent => EntityKind::CalendarEvent,
    ChatMessage => EntityKind::ChatMessage,
    MediaFile => EntityKind::MediaFile,
    SupportTicket => EntityKind::SupportTicket,
    TeamMember => EntityKind::TeamMember,
    EmailTemplate => EntityKind::EmailTemplate,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Lead {
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub estimated_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Deal {
    pub title: String,
    pub value: f64,
    pub stage: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub expected_close: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub budget: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub description: String,
    #[serde(default)]
    pub project_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub minutes: u32,
    #[serde(default)]
    pub billable: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Invoice {
    pub number: String,
    pub client_name: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub channel: String,
    pub author: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Metadata only; blob upload happens elsewhere.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaFile {
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SupportTicket {
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TeamMember {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub name: String,
    pub subject: String,
    pub body: String,
}
