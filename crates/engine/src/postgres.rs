//! Postgres-backed collaborators.
//!
//! `PgStore` implements the store and directory traits on top of the `db`
//! crate's repository functions, converting rows to domain types at the
//! boundary. Multi-row writes (saving a graph, reconciling roles) run in one
//! transaction.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use db::models::{
    HierarchyRow, IncidentRow, RevisionRow, StateChangeRow, TransitionHistoryRow, WorkflowRow,
    WorkflowStateRow, WorkflowTransitionRow,
};
use db::repository::{directory, incidents, workflows};
use db::{DbError, DbPool};

use crate::graph::{GraphError, WorkflowGraph};
use crate::hierarchy::{build_tree, Hierarchy, HierarchyNode, TreeNode};
use crate::incident::{Incident, IncidentRevision, IncidentTransitionHistory, NewRevision};
use crate::models::{
    DepartmentAssignment, RecordKind, RoleCode, StateKind, UserAssignment, Workflow, WorkflowState,
    WorkflowTransition,
};
use crate::reconcile::SetDiff;
use crate::store::{
    DeadlineUpdate, DeleteMode, Department, Directory, DirectoryUser, InstanceStore, StateChange,
    StoreError, WorkflowStore,
};

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => StoreError::not_found("row", "?"),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Map `DbError::NotFound` to a `NotFound` naming the entity.
fn missing(entity: &'static str, id: Uuid) -> impl FnOnce(DbError) -> StoreError {
    move |err| match err {
        DbError::NotFound => StoreError::not_found(entity, id),
        other => other.into(),
    }
}

fn decode<T: DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Backend(format!("malformed {what}: {e}")))
}

fn encode(value: &impl serde::Serialize) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Backend)
}

// ---------------------------------------------------------------------------
// Row conversions: workflow graph
// ---------------------------------------------------------------------------

pub(crate) fn workflow_from_row(row: WorkflowRow) -> Result<Workflow, StoreError> {
    Ok(Workflow {
        id: row.id,
        code: row.code,
        name: row.name,
        active: row.is_active,
        is_default: row.is_default,
        applies_to: row
            .applies_to
            .iter()
            .map(|k| parse::<RecordKind>(k))
            .collect::<Result<_, _>>()?,
        required_fields: row.required_fields,
        created_at: row.created_at,
    })
}

pub(crate) fn workflow_to_row(workflow: &Workflow) -> WorkflowRow {
    WorkflowRow {
        id: workflow.id,
        code: workflow.code.clone(),
        name: workflow.name.clone(),
        is_active: workflow.active,
        is_default: workflow.is_default,
        applies_to: workflow.applies_to.iter().map(|k| k.to_string()).collect(),
        required_fields: workflow.required_fields.clone(),
        created_at: workflow.created_at,
    }
}

pub(crate) fn state_from_row(row: WorkflowStateRow) -> Result<WorkflowState, StoreError> {
    let sla_hours = row
        .sla_hours
        .map(u32::try_from)
        .transpose()
        .map_err(|_| StoreError::Backend(format!("state '{}' has a negative SLA budget", row.code)))?;

    Ok(WorkflowState {
        id: row.id,
        workflow_id: row.workflow_id,
        kind: parse::<StateKind>(&row.kind)?,
        code: row.code,
        name: row.name,
        sla_hours,
        visible_to: row.visible_to.into_iter().collect(),
    })
}

/// # Errors
/// `Backend` when the SLA budget does not fit the `INTEGER` column.
pub(crate) fn state_to_row(state: &WorkflowState) -> Result<WorkflowStateRow, StoreError> {
    let sla_hours = state
        .sla_hours
        .map(i32::try_from)
        .transpose()
        .map_err(|_| StoreError::Backend(format!("state '{}' has an SLA budget too large to store", state.code)))?;

    Ok(WorkflowStateRow {
        id: state.id,
        workflow_id: state.workflow_id,
        code: state.code.clone(),
        name: state.name.clone(),
        kind: state.kind.to_string(),
        sla_hours,
        visible_to: state.visible_to.iter().cloned().collect(),
    })
}

/// Build a transition from its row and role set.
///
/// # Errors
/// `InvalidGraph(ConflictingAssignment)` when the stored flags select more
/// than one assignment mode for the same dimension.
pub(crate) fn transition_from_row(
    row: WorkflowTransitionRow,
    allowed_roles: BTreeSet<RoleCode>,
) -> Result<WorkflowTransition, StoreError> {
    let conflict = |dimension: &'static str| GraphError::ConflictingAssignment {
        transition: row.code.clone(),
        dimension,
    };

    let department = match (
        row.assign_department_id,
        row.auto_detect_department,
        row.manual_select_department,
    ) {
        (None, false, false) => DepartmentAssignment::None,
        (Some(department_id), false, false) => DepartmentAssignment::Fixed { department_id },
        (None, true, false) => DepartmentAssignment::AutoDetect,
        (None, false, true) => DepartmentAssignment::Manual,
        _ => return Err(conflict("department").into()),
    };

    let user = match (
        row.assign_user_id,
        row.auto_detect_user_role.clone(),
        row.manual_select_user,
        row.assign_all_matched_users,
    ) {
        (None, None, false, false) => UserAssignment::None,
        (Some(user_id), None, false, false) => UserAssignment::Fixed { user_id },
        (None, Some(role), false, assign_all) => UserAssignment::AutoDetect { role, assign_all },
        (None, None, true, false) => UserAssignment::Manual,
        _ => return Err(conflict("user").into()),
    };

    Ok(WorkflowTransition {
        requirements: decode("requirements", row.requirements)?,
        actions: decode("actions", row.actions)?,
        id: row.id,
        workflow_id: row.workflow_id,
        code: row.code,
        name: row.name,
        from_state_id: row.from_state_id,
        to_state_id: row.to_state_id,
        active: row.is_active,
        allowed_roles,
        department,
        user,
    })
}

pub(crate) fn transition_to_row(transition: &WorkflowTransition) -> WorkflowTransitionRow {
    let mut row = WorkflowTransitionRow {
        id: transition.id,
        workflow_id: transition.workflow_id,
        code: transition.code.clone(),
        name: transition.name.clone(),
        from_state_id: transition.from_state_id,
        to_state_id: transition.to_state_id,
        is_active: transition.active,
        requirements: encode(&transition.requirements),
        actions: encode(&transition.actions),
        assign_department_id: None,
        auto_detect_department: false,
        manual_select_department: false,
        assign_user_id: None,
        auto_detect_user_role: None,
        assign_all_matched_users: false,
        manual_select_user: false,
    };

    match &transition.department {
        DepartmentAssignment::None => {}
        DepartmentAssignment::Fixed { department_id } => row.assign_department_id = Some(*department_id),
        DepartmentAssignment::AutoDetect => row.auto_detect_department = true,
        DepartmentAssignment::Manual => row.manual_select_department = true,
    }
    match &transition.user {
        UserAssignment::None => {}
        UserAssignment::Fixed { user_id } => row.assign_user_id = Some(*user_id),
        UserAssignment::AutoDetect { role, assign_all } => {
            row.auto_detect_user_role = Some(role.clone());
            row.assign_all_matched_users = *assign_all;
        }
        UserAssignment::Manual => row.manual_select_user = true,
    }

    row
}

// ---------------------------------------------------------------------------
// Row conversions: incidents and audit rows
// ---------------------------------------------------------------------------

pub(crate) fn incident_from_row(row: IncidentRow) -> Result<Incident, StoreError> {
    Ok(Incident {
        id: row.id,
        workflow_id: row.workflow_id,
        current_state_id: row.current_state_id,
        record_kind: parse(&row.record_kind)?,
        title: row.title,
        classification_id: row.classification_id,
        location_id: row.location_id,
        department_id: row.department_id,
        reporter_id: row.reporter_id,
        assignee_id: row.assignee_id,
        assignee_ids: row.assignee_ids,
        due_date: row.due_date,
        sla_deadline: row.sla_deadline,
        sla_breached: row.sla_breached,
        custom_fields: row.custom_fields,
        resolved_at: row.resolved_at,
        closed_at: row.closed_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

pub(crate) fn incident_to_row(incident: &Incident) -> IncidentRow {
    IncidentRow {
        id: incident.id,
        workflow_id: incident.workflow_id,
        current_state_id: incident.current_state_id,
        record_kind: incident.record_kind.to_string(),
        title: incident.title.clone(),
        classification_id: incident.classification_id,
        location_id: incident.location_id,
        department_id: incident.department_id,
        reporter_id: incident.reporter_id,
        assignee_id: incident.assignee_id,
        assignee_ids: incident.assignee_ids.clone(),
        due_date: incident.due_date,
        sla_deadline: incident.sla_deadline,
        sla_breached: incident.sla_breached,
        custom_fields: incident.custom_fields.clone(),
        resolved_at: incident.resolved_at,
        closed_at: incident.closed_at,
        created_at: incident.created_at,
        updated_at: incident.updated_at,
    }
}

pub(crate) fn state_change_to_row(change: &StateChange) -> StateChangeRow {
    StateChangeRow {
        department_id: change.department_id,
        assignee_id: change.assignee_id,
        assignee_ids: change.assignee_ids.clone(),
        sla_deadline: match change.sla_deadline {
            DeadlineUpdate::Keep => None,
            DeadlineUpdate::Set(at) => Some(Some(at)),
            DeadlineUpdate::Clear => Some(None),
        },
        sla_breached: change.sla_breached,
        resolved_at: change.resolved_at,
        closed_at: change.closed_at,
        updated_at: change.updated_at,
    }
}

fn history_from_row(row: TransitionHistoryRow) -> Result<IncidentTransitionHistory, StoreError> {
    Ok(IncidentTransitionHistory {
        id: row.id,
        incident_id: row.incident_id,
        transition_id: row.transition_id,
        from_state_id: row.from_state_id,
        to_state_id: row.to_state_id,
        actor_id: row.actor_id,
        comment: row.comment,
        attachment_ids: row.attachment_ids,
        feedback: row.feedback.map(|f| decode("feedback", f)).transpose()?,
        changes: decode("changes", row.changes)?,
        action_results: decode("action results", row.action_results)?,
        created_at: row.created_at,
    })
}

fn history_to_row(history: &IncidentTransitionHistory) -> TransitionHistoryRow {
    TransitionHistoryRow {
        id: history.id,
        incident_id: history.incident_id,
        transition_id: history.transition_id,
        from_state_id: history.from_state_id,
        to_state_id: history.to_state_id,
        actor_id: history.actor_id,
        comment: history.comment.clone(),
        attachment_ids: history.attachment_ids.clone(),
        feedback: history.feedback.as_ref().map(encode),
        changes: encode(&history.changes),
        action_results: encode(&history.action_results),
        created_at: history.created_at,
    }
}

fn revision_from_row(row: RevisionRow) -> Result<IncidentRevision, StoreError> {
    Ok(IncidentRevision {
        id: row.id,
        incident_id: row.incident_id,
        revision_number: row.revision_number,
        kind: parse(&row.kind)?,
        description: row.description,
        actor_id: row.actor_id,
        changes: decode("changes", row.changes)?,
        created_at: row.created_at,
    })
}

fn node_from_row(row: HierarchyRow) -> HierarchyNode {
    HierarchyNode {
        id: row.id,
        parent_id: row.parent_id,
        name: row.name,
        path: row.path,
    }
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        Ok(Self::new(db::pool::create_pool(database_url, max_connections).await?))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        db::pool::run_migrations(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Share this store as every collaborator the engine needs.
    pub fn into_collaborators(self) -> (Arc<dyn WorkflowStore>, Arc<dyn InstanceStore>, Arc<dyn Directory>) {
        let store = Arc::new(self);
        (store.clone(), store.clone(), store)
    }

    /// Create a tree node, deriving its path from the parent's stored path.
    pub async fn add_node(
        &self,
        hierarchy: Hierarchy,
        name: &str,
        parent: Option<Uuid>,
    ) -> Result<HierarchyNode, StoreError> {
        let node = match parent {
            None => HierarchyNode::root(name),
            Some(parent_id) => {
                let parent = directory::get_hierarchy_node(&self.pool, hierarchy, parent_id)
                    .await
                    .map_err(missing("parent node", parent_id))?;
                HierarchyNode::child_of(&node_from_row(parent), name)
            }
        };

        directory::insert_hierarchy_node(
            &self.pool,
            hierarchy,
            &HierarchyRow {
                id: node.id,
                parent_id: node.parent_id,
                name: node.name.clone(),
                path: node.path.clone(),
            },
        )
        .await?;
        Ok(node)
    }

    pub async fn tree(&self, hierarchy: Hierarchy, max_depth: usize) -> Result<Vec<TreeNode>, StoreError> {
        let rows = directory::list_hierarchy(&self.pool, hierarchy).await?;
        let nodes: Vec<HierarchyNode> = rows.into_iter().map(node_from_row).collect();
        Ok(build_tree(&nodes, max_depth))
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn load_graph(&self, workflow_id: Uuid) -> Result<Arc<WorkflowGraph>, StoreError> {
        let workflow = workflows::get_workflow(&self.pool, workflow_id)
            .await
            .map_err(missing("workflow", workflow_id))?;
        let states = workflows::list_states(&self.pool, workflow_id).await?;
        let transitions = workflows::list_transitions(&self.pool, workflow_id).await?;

        let mut roles: HashMap<Uuid, BTreeSet<RoleCode>> = HashMap::new();
        for row in workflows::list_transition_roles(&self.pool, workflow_id).await? {
            roles.entry(row.transition_id).or_default().insert(row.role_code);
        }

        let states = states
            .into_iter()
            .map(state_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let transitions = transitions
            .into_iter()
            .map(|t| {
                let allowed = roles.remove(&t.id).unwrap_or_default();
                transition_from_row(t, allowed)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let graph = WorkflowGraph::new(workflow_from_row(workflow)?, states, transitions)?;
        Ok(Arc::new(graph))
    }

    async fn find_default(&self, kind: RecordKind) -> Result<Option<Uuid>, StoreError> {
        let row = workflows::find_default_workflow(&self.pool, &kind.to_string()).await?;
        Ok(row.map(|r| r.id))
    }

    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        if graph.workflow().is_default {
            workflows::clear_default_workflows(&mut tx).await?;
        }
        workflows::insert_workflow(&mut tx, &workflow_to_row(graph.workflow())).await?;
        for state in graph.states() {
            workflows::insert_state(&mut tx, &state_to_row(state)?).await?;
        }
        for transition in graph.transitions() {
            workflows::insert_transition(&mut tx, &transition_to_row(transition)).await?;
            let roles: Vec<String> = transition.allowed_roles.iter().cloned().collect();
            workflows::add_transition_roles(&mut tx, transition.id, &roles).await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn set_default(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        workflows::set_default_workflow(&self.pool, workflow_id)
            .await
            .map_err(missing("workflow", workflow_id))
    }

    async fn workflow_version(&self, workflow_id: Uuid) -> Result<i64, StoreError> {
        workflows::workflow_version(&self.pool, workflow_id)
            .await
            .map_err(missing("workflow", workflow_id))
    }

    async fn delete_workflow(
        &self,
        workflow_id: Uuid,
        mode: DeleteMode,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = match mode {
            DeleteMode::Soft => workflows::soft_delete_workflow(&self.pool, workflow_id, deleted_at).await,
            DeleteMode::Hard => workflows::hard_delete_workflow(&self.pool, workflow_id).await,
        };
        result.map_err(|err| match err {
            DbError::InUse { incidents } => StoreError::WorkflowInUse {
                workflow_id,
                incidents: u64::try_from(incidents).unwrap_or_default(),
            },
            other => missing("workflow", workflow_id)(other),
        })
    }

    async fn transition_roles(&self, transition_id: Uuid) -> Result<BTreeSet<RoleCode>, StoreError> {
        let roles = workflows::list_roles_for_transition(&self.pool, transition_id).await?;
        Ok(roles.into_iter().collect())
    }

    async fn apply_role_diff(
        &self,
        transition_id: Uuid,
        diff: &SetDiff<RoleCode>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        workflows::remove_transition_roles(&mut tx, transition_id, &diff.removed).await?;
        workflows::add_transition_roles(&mut tx, transition_id, &diff.added).await?;
        workflows::bump_version_for_transition(&mut tx, transition_id).await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn load_instance(&self, incident_id: Uuid) -> Result<Incident, StoreError> {
        let row = incidents::get_incident(&self.pool, incident_id)
            .await
            .map_err(missing("incident", incident_id))?;
        incident_from_row(row)
    }

    async fn insert_instance(&self, incident: &Incident) -> Result<(), StoreError> {
        incidents::insert_incident(&self.pool, &incident_to_row(incident)).await?;
        Ok(())
    }

    async fn compare_and_set_state(
        &self,
        incident_id: Uuid,
        change: &StateChange,
    ) -> Result<bool, StoreError> {
        incidents::compare_and_set_state(
            &self.pool,
            incident_id,
            change.expected_state_id,
            change.new_state_id,
            &state_change_to_row(change),
        )
        .await
        .map_err(missing("incident", incident_id))
    }

    async fn append_history(&self, row: &IncidentTransitionHistory) -> Result<(), StoreError> {
        incidents::insert_history(&self.pool, &history_to_row(row)).await?;
        Ok(())
    }

    async fn append_revision(&self, revision: NewRevision) -> Result<IncidentRevision, StoreError> {
        let incident_id = revision.incident_id;
        let row = incidents::append_revision(
            &self.pool,
            Uuid::new_v4(),
            incident_id,
            revision.revision_number,
            &revision.kind.to_string(),
            &revision.description,
            revision.actor_id,
            &encode(&revision.changes),
            revision.created_at,
        )
        .await
        .map_err(|err| match err {
            DbError::RevisionOutOfSequence { supplied, expected } => StoreError::RevisionOutOfSequence {
                incident_id,
                supplied,
                expected,
            },
            other => missing("incident", incident_id)(other),
        })?;

        revision_from_row(row)
    }

    async fn mark_sla_breached(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        Ok(incidents::mark_sla_breached(&self.pool, now).await?)
    }

    async fn history(&self, incident_id: Uuid) -> Result<Vec<IncidentTransitionHistory>, StoreError> {
        incidents::list_history(&self.pool, incident_id)
            .await?
            .into_iter()
            .map(history_from_row)
            .collect()
    }

    async fn revisions(&self, incident_id: Uuid) -> Result<Vec<IncidentRevision>, StoreError> {
        incidents::list_revisions(&self.pool, incident_id)
            .await?
            .into_iter()
            .map(revision_from_row)
            .collect()
    }
}

#[async_trait]
impl Directory for PgStore {
    async fn matching_departments(
        &self,
        classification_id: Uuid,
        location_id: Option<Uuid>,
    ) -> Result<Vec<Department>, StoreError> {
        let rows = directory::matching_departments(&self.pool, classification_id, location_id).await?;
        Ok(rows
            .into_iter()
            .map(|d| Department { id: d.id, name: d.name })
            .collect())
    }

    async fn matching_users(
        &self,
        role: &str,
        classification_id: Option<Uuid>,
        location_id: Option<Uuid>,
        department_id: Option<Uuid>,
    ) -> Result<Vec<DirectoryUser>, StoreError> {
        let rows = directory::matching_users(&self.pool, role, classification_id, location_id, department_id)
            .await?;
        Ok(rows
            .into_iter()
            .map(|u| DirectoryUser { id: u.id, name: u.name })
            .collect())
    }
}
