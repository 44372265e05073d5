//! Incident instances and their append-only audit records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use actions::ActionKind;

use crate::models::RecordKind;

// ---------------------------------------------------------------------------
// Incident
// ---------------------------------------------------------------------------

/// A ticket bound to one workflow and occupying exactly one of its states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub current_state_id: Uuid,
    pub record_kind: RecordKind,
    pub title: String,
    pub classification_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub reporter_id: Uuid,
    pub assignee_id: Option<Uuid>,
    /// Additional assignees, filled by broadcast assignment.
    pub assignee_ids: Vec<Uuid>,
    pub due_date: Option<DateTime<Utc>>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub sla_breached: bool,
    /// Opaque custom-fields document.
    pub custom_fields: Value,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller input for opening a new incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIncident {
    /// Explicit workflow; the default workflow for `record_kind` otherwise.
    pub workflow_id: Option<Uuid>,
    pub record_kind: RecordKind,
    pub title: String,
    pub classification_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub reporter_id: Uuid,
    pub assignee_id: Option<Uuid>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub custom_fields: Value,
}

impl NewIncident {
    pub fn new(record_kind: RecordKind, title: impl Into<String>, reporter_id: Uuid) -> Self {
        Self {
            workflow_id: None,
            record_kind,
            title: title.into(),
            classification_id: None,
            location_id: None,
            department_id: None,
            reporter_id,
            assignee_id: None,
            due_date: None,
            custom_fields: Value::Object(Default::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

/// Old and new value of one field touched by a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Value,
    pub new: Value,
}

impl FieldChange {
    pub fn new(field: impl Into<String>, old: impl Serialize, new: impl Serialize) -> Self {
        Self {
            field: field.into(),
            old: serde_json::to_value(old).unwrap_or(Value::Null),
            new: serde_json::to_value(new).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    /// Handed to the dispatcher; the outcome is not known to the engine.
    Dispatched,
}

/// What happened to one configured action of a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub code: String,
    pub kind: ActionKind,
    pub execution_order: i32,
    pub synchronous: bool,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One row per executed transition. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentTransitionHistory {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub transition_id: Uuid,
    pub from_state_id: Uuid,
    pub to_state_id: Uuid,
    pub actor_id: Uuid,
    pub comment: Option<String>,
    pub attachment_ids: Vec<Uuid>,
    pub feedback: Option<Feedback>,
    pub changes: Vec<FieldChange>,
    pub action_results: Vec<ActionOutcome>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionKind {
    Created,
    FieldChanged,
    CommentAdded,
    CommentModified,
    CommentDeleted,
    AttachmentAdded,
    AttachmentRemoved,
    AssigneeChanged,
    StatusChanged,
}

impl fmt::Display for RevisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::FieldChanged => "field_changed",
            Self::CommentAdded => "comment_added",
            Self::CommentModified => "comment_modified",
            Self::CommentDeleted => "comment_deleted",
            Self::AttachmentAdded => "attachment_added",
            Self::AttachmentRemoved => "attachment_removed",
            Self::AssigneeChanged => "assignee_changed",
            Self::StatusChanged => "status_changed",
        };
        f.write_str(s)
    }
}

impl FromStr for RevisionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created"            => Ok(Self::Created),
            "field_changed"      => Ok(Self::FieldChanged),
            "comment_added"      => Ok(Self::CommentAdded),
            "comment_modified"   => Ok(Self::CommentModified),
            "comment_deleted"    => Ok(Self::CommentDeleted),
            "attachment_added"   => Ok(Self::AttachmentAdded),
            "attachment_removed" => Ok(Self::AttachmentRemoved),
            "assignee_changed"   => Ok(Self::AssigneeChanged),
            "status_changed"     => Ok(Self::StatusChanged),
            other                => Err(format!("unknown revision kind: {other}")),
        }
    }
}

/// One numbered, immutable entry in an incident's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRevision {
    pub id: Uuid,
    pub incident_id: Uuid,
    /// Starts at 1, gapless per incident.
    pub revision_number: i64,
    pub kind: RevisionKind,
    pub description: String,
    pub actor_id: Uuid,
    pub changes: Vec<FieldChange>,
    pub created_at: DateTime<Utc>,
}

/// A revision before the store has numbered it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRevision {
    pub incident_id: Uuid,
    /// `Some` pins the number the caller expects to receive.
    pub revision_number: Option<i64>,
    pub kind: RevisionKind,
    pub description: String,
    pub actor_id: Uuid,
    pub changes: Vec<FieldChange>,
    pub created_at: DateTime<Utc>,
}

impl NewRevision {
    /// Number the revision, producing the stored row.
    pub fn numbered(self, revision_number: i64) -> IncidentRevision {
        IncidentRevision {
            id: Uuid::new_v4(),
            incident_id: self.incident_id,
            revision_number,
            kind: self.kind,
            description: self.description,
            actor_id: self.actor_id,
            changes: self.changes,
            created_at: self.created_at,
        }
    }
}
