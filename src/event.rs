//! Core event types for Herald.
//!
//! The [`Event`] struct represents a project lifecycle event consumed from the
//! source stream. Its `event_type` is parsed into the closed [`EventKind`]
//! enum; the payload shapes each kind carries live alongside it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An inbound project lifecycle event.
///
/// # Example
///
/// ```json
/// {
///   "eventType": "project.draft-created",
///   "correlationId": "abc123",
///   "payload": {
///     "id": 1,
///     "name": "Landing page",
///     "members": [{ "userId": 7, "role": "customer", "isPrimary": true }]
///   }
/// }
/// ```
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Event {
    /// Routing key on the source exchange (e.g., "project.updated")
    #[serde(rename = "eventType")]
    pub event_type: String,

    /// Correlation ID for tracing only, never used for deduplication
    #[serde(rename = "correlationId", default)]
    pub correlation_id: String,

    /// Event-specific JSON payload
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Create a new event without a correlation id
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id: String::new(),
            payload,
        }
    }

    /// Set the correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// The parsed kind of this event.
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }
}

/// Every event type the bridge knows how to turn into notifications.
///
/// Anything else lands in [`EventKind::Unknown`], which produces no
/// notifications but is still acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    DraftCreated,
    Updated,
    ClaimReminder,
    MemberAdded,
    MemberRemoved,
    MemberUpdated,
    Unknown(String),
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "project.draft-created" => Self::DraftCreated,
            "project.updated" => Self::Updated,
            "project.claim.reminder" => Self::ClaimReminder,
            "project.member.added" => Self::MemberAdded,
            "project.member.removed" => Self::MemberRemoved,
            "project.member.updated" => Self::MemberUpdated,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::DraftCreated => "project.draft-created",
            Self::Updated => "project.updated",
            Self::ClaimReminder => "project.claim.reminder",
            Self::MemberAdded => "project.member.added",
            Self::MemberRemoved => "project.member.removed",
            Self::MemberUpdated => "project.member.updated",
            Self::Unknown(other) => other,
        }
    }
}

/// Project member role.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Manager,
    Copilot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Manager => "manager",
            Role::Copilot => "copilot",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Project lifecycle status.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Draft,
    #[serde(alias = "in-review")]
    InReview,
    Reviewed,
    Active,
    Completed,
    Cancelled,
    Paused,
    #[serde(other)]
    Other,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::InReview => "in_review",
            ProjectStatus::Reviewed => "reviewed",
            ProjectStatus::Active => "active",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Other => "other",
        }
    }
}

/// A project member as carried in project records.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: i64,
    pub role: Role,
    #[serde(default)]
    pub is_primary: bool,
}

/// A project record, either embedded in an event or fetched on demand.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub members: Vec<Member>,
}

/// A user record fetched on demand.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(alias = "id")]
    pub user_id: i64,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Payload of `project.updated`: before and after snapshots.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub original: Project,
    pub updated: Project,
    #[serde(default)]
    pub updated_by: Option<i64>,
}

/// Payload of `project.member.added`, `.removed` and `.updated`.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MemberChange {
    pub project_id: i64,
    pub user_id: i64,
    pub role: Role,
    #[serde(default)]
    pub is_primary: bool,
    /// Id of the user who performed the change
    pub updated_by: i64,
}
