//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models and carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow template row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub is_active: bool,
    pub is_default: bool,
    /// Record kinds this workflow applies to (`incident`, `request`, `complaint`).
    pub applies_to: Vec<String>,
    pub required_fields: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// workflow_states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowStateRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub code: String,
    pub name: String,
    /// `initial`, `normal` or `terminal`.
    pub kind: String,
    pub sla_hours: Option<i32>,
    pub visible_to: Vec<String>,
}

// ---------------------------------------------------------------------------
// workflow_transitions
// ---------------------------------------------------------------------------

/// A persisted transition. Requirements and actions are JSON arrays; the
/// assignment policy is spread over flag columns and validated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowTransitionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub code: String,
    pub name: String,
    pub from_state_id: Uuid,
    pub to_state_id: Uuid,
    pub is_active: bool,
    pub requirements: serde_json::Value,
    pub actions: serde_json::Value,
    pub assign_department_id: Option<Uuid>,
    pub auto_detect_department: bool,
    pub manual_select_department: bool,
    pub assign_user_id: Option<Uuid>,
    pub auto_detect_user_role: Option<String>,
    pub assign_all_matched_users: bool,
    pub manual_select_user: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransitionRoleRow {
    pub transition_id: Uuid,
    pub role_code: String,
}

// ---------------------------------------------------------------------------
// directory
// ---------------------------------------------------------------------------

/// A department returned by an auto-detect lookup.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DepartmentRow {
    pub id: Uuid,
    pub name: String,
    pub path: String,
}

/// A user returned by an auto-detect lookup.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub name: String,
    pub department_id: Option<Uuid>,
}

/// A node of one of the self-referential trees (classification, location,
/// department).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HierarchyRow {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub path: String,
}

// ---------------------------------------------------------------------------
// incidents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IncidentRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub current_state_id: Uuid,
    pub record_kind: String,
    pub title: String,
    pub classification_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub reporter_id: Uuid,
    pub assignee_id: Option<Uuid>,
    pub assignee_ids: Vec<Uuid>,
    pub due_date: Option<DateTime<Utc>>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub sla_breached: bool,
    pub custom_fields: serde_json::Value,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Column updates applied together with a compare-and-set on
/// `current_state_id`. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct StateChangeRow {
    pub department_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub assignee_ids: Option<Vec<Uuid>>,
    /// `Some(None)` clears the deadline.
    pub sla_deadline: Option<Option<DateTime<Utc>>>,
    pub sla_breached: Option<bool>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransitionHistoryRow {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub transition_id: Uuid,
    pub from_state_id: Uuid,
    pub to_state_id: Uuid,
    pub actor_id: Uuid,
    pub comment: Option<String>,
    pub attachment_ids: Vec<Uuid>,
    pub feedback: Option<serde_json::Value>,
    pub changes: serde_json::Value,
    pub action_results: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RevisionRow {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub revision_number: i64,
    pub kind: String,
    pub description: String,
    pub actor_id: Uuid,
    pub changes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
