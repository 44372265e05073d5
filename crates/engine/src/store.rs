//! Collaborator contracts the engine is constructed with.
//!
//! The engine never reaches for a global handle: every store, the directory
//! and the clock are passed in as trait objects.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::graph::{GraphError, WorkflowGraph};
use crate::incident::{Incident, IncidentRevision, IncidentTransitionHistory, NewRevision};
use crate::models::{RecordKind, RoleCode};
use crate::reconcile::SetDiff;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Stored rows do not form a valid workflow graph.
    #[error("invalid workflow graph: {0}")]
    InvalidGraph(#[from] GraphError),

    #[error("revision {supplied} for incident {incident_id} is out of sequence (next is {expected})")]
    RevisionOutOfSequence {
        incident_id: Uuid,
        supplied: i64,
        expected: i64,
    },

    /// Incidents still point at the workflow, so deleting it would orphan them.
    #[error("workflow {workflow_id} is still referenced by {incidents} incident(s)")]
    WorkflowInUse { workflow_id: Uuid, incidents: u64 },

    /// A backend-specific error (connection, serialization, constraint…).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

// ---------------------------------------------------------------------------
// State change payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlineUpdate {
    #[default]
    Keep,
    Set(DateTime<Utc>),
    Clear,
}

/// Everything a transition writes to the incident row, applied together with
/// the compare-and-set on `current_state_id`. `None` fields are untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub expected_state_id: Uuid,
    pub new_state_id: Uuid,
    pub department_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub assignee_ids: Option<Vec<Uuid>>,
    pub sla_deadline: DeadlineUpdate,
    pub sla_breached: Option<bool>,
    /// Only stamped if the incident has no resolution time yet.
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StateChange {
    /// Apply the change to an in-memory incident, without any state check.
    pub fn apply_to(&self, incident: &mut Incident) {
        incident.current_state_id = self.new_state_id;
        if let Some(department) = self.department_id {
            incident.department_id = Some(department);
        }
        if let Some(assignee) = self.assignee_id {
            incident.assignee_id = Some(assignee);
        }
        if let Some(assignees) = &self.assignee_ids {
            incident.assignee_ids = assignees.clone();
        }
        match self.sla_deadline {
            DeadlineUpdate::Keep => {}
            DeadlineUpdate::Set(at) => incident.sla_deadline = Some(at),
            DeadlineUpdate::Clear => incident.sla_deadline = None,
        }
        if let Some(breached) = self.sla_breached {
            incident.sla_breached = breached;
        }
        if incident.resolved_at.is_none() {
            incident.resolved_at = self.resolved_at;
        }
        if let Some(closed) = self.closed_at {
            incident.closed_at = Some(closed);
        }
        incident.updated_at = self.updated_at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Stamp the workflow and all its states/transitions as deleted.
    /// Closed incidents keep pointing at the stamped rows.
    Soft,
    /// Remove the workflow and all its states/transitions.
    Hard,
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Read-mostly access to workflow graphs plus the few design-time mutations
/// the engine needs.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Load the full graph. Inactive workflows are still returned; callers
    /// decide whether inactivity matters.
    async fn load_graph(&self, workflow_id: Uuid) -> Result<Arc<WorkflowGraph>, StoreError>;

    /// The default, active workflow applicable to `kind`.
    async fn find_default(&self, kind: RecordKind) -> Result<Option<Uuid>, StoreError>;

    /// Persist a new graph. A default graph clears any previous default.
    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<(), StoreError>;

    /// Make one workflow the single default.
    async fn set_default(&self, workflow_id: Uuid) -> Result<(), StoreError>;

    /// Change stamp of a live workflow. Every stored mutation of the graph
    /// (default flag, roles, deletion) moves it forward.
    async fn workflow_version(&self, workflow_id: Uuid) -> Result<i64, StoreError>;

    /// Delete a workflow together with its states and transitions. A hard
    /// delete is refused while any incident references the workflow, a soft
    /// delete while any of those incidents is still open.
    async fn delete_workflow(
        &self,
        workflow_id: Uuid,
        mode: DeleteMode,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn transition_roles(&self, transition_id: Uuid) -> Result<BTreeSet<RoleCode>, StoreError>;

    /// Apply both halves of a role-set diff to one transition.
    async fn apply_role_diff(
        &self,
        transition_id: Uuid,
        diff: &SetDiff<RoleCode>,
    ) -> Result<(), StoreError>;
}

/// The primitive incident mutations the executor relies on.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn load_instance(&self, incident_id: Uuid) -> Result<Incident, StoreError>;

    async fn insert_instance(&self, incident: &Incident) -> Result<(), StoreError>;

    /// Apply `change` only if the incident is still in
    /// `change.expected_state_id`. Returns `false` when it is not.
    async fn compare_and_set_state(
        &self,
        incident_id: Uuid,
        change: &StateChange,
    ) -> Result<bool, StoreError>;

    async fn append_history(&self, row: &IncidentTransitionHistory) -> Result<(), StoreError>;

    /// Atomically allocate the next revision number for the incident and
    /// persist the row. A pinned number that is not the next one fails with
    /// `RevisionOutOfSequence` and writes nothing.
    async fn append_revision(&self, revision: NewRevision) -> Result<IncidentRevision, StoreError>;

    /// Flag every non-terminal incident whose deadline is before `now` and
    /// which is not yet breached, in one atomic step. Returns the flipped ids.
    async fn mark_sla_breached(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    async fn history(&self, incident_id: Uuid) -> Result<Vec<IncidentTransitionHistory>, StoreError>;

    async fn revisions(&self, incident_id: Uuid) -> Result<Vec<IncidentRevision>, StoreError>;
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: Uuid,
    pub name: String,
}

/// Lookups used by auto-detect assignment.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn matching_departments(
        &self,
        classification_id: Uuid,
        location_id: Option<Uuid>,
    ) -> Result<Vec<Department>, StoreError>;

    async fn matching_users(
        &self,
        role: &str,
        classification_id: Option<Uuid>,
        location_id: Option<Uuid>,
        department_id: Option<Uuid>,
    ) -> Result<Vec<DirectoryUser>, StoreError>;
}
