//! In-process implementation of every collaborator trait.
//!
//! All state sits behind one mutex and no lock is held across an await, so
//! compare-and-set, revision allocation and the breach sweep are each a
//! single atomic step, just like their SQL counterparts. Used by the test
//! suite and by the CLI's offline `validate` path.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::graph::WorkflowGraph;
use crate::hierarchy::{build_tree, Hierarchy, HierarchyNode, TreeNode};
use crate::incident::{Incident, IncidentRevision, IncidentTransitionHistory, NewRevision};
use crate::models::{RecordKind, RoleCode, Workflow, WorkflowState, WorkflowTransition};
use crate::reconcile::{self, SetDiff};
use crate::store::{
    DeleteMode, Department, Directory, DirectoryUser, InstanceStore, StateChange, StoreError,
    WorkflowStore,
};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Row<T> {
    value: T,
    deleted: bool,
}

impl<T> Row<T> {
    fn live(value: T) -> Self {
        Self { value, deleted: false }
    }
}

#[derive(Debug, Clone)]
struct Coverage {
    department_id: Uuid,
    classification_id: Uuid,
    location_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct UserEntry {
    id: Uuid,
    name: String,
    department_id: Option<Uuid>,
    roles: BTreeSet<RoleCode>,
    active: bool,
}

/// Row counts for one workflow's states and transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberCounts {
    pub live_states: usize,
    pub live_transitions: usize,
    pub deleted_states: usize,
    pub deleted_transitions: usize,
}

#[derive(Default)]
struct Inner {
    workflows: Vec<Row<Workflow>>,
    states: Vec<Row<WorkflowState>>,
    transitions: Vec<Row<WorkflowTransition>>,
    versions: HashMap<Uuid, i64>,

    incidents: HashMap<Uuid, Incident>,
    history: Vec<IncidentTransitionHistory>,
    revisions: HashMap<Uuid, Vec<IncidentRevision>>,

    trees: HashMap<Hierarchy, Vec<HierarchyNode>>,
    coverage: Vec<Coverage>,
    users: Vec<UserEntry>,

    fail_history: bool,
    fail_revisions: bool,
}

impl Inner {
    fn live_workflow_mut(&mut self, id: Uuid) -> Result<&mut Row<Workflow>, StoreError> {
        self.workflows
            .iter_mut()
            .find(|w| w.value.id == id && !w.deleted)
            .ok_or_else(|| StoreError::not_found("workflow", id))
    }

    fn live_transition_mut(&mut self, id: Uuid) -> Result<&mut WorkflowTransition, StoreError> {
        self.transitions
            .iter_mut()
            .find(|t| t.value.id == id && !t.deleted)
            .map(|t| &mut t.value)
            .ok_or_else(|| StoreError::not_found("transition", id))
    }

    fn bump_version(&mut self, workflow_id: Uuid) {
        *self.versions.entry(workflow_id).or_default() += 1;
    }

    /// Incidents on the workflow; with `open_only`, those not in a terminal state.
    fn incidents_on(&self, workflow_id: Uuid, open_only: bool) -> u64 {
        self.incidents
            .values()
            .filter(|i| i.workflow_id == workflow_id)
            .filter(|i| !open_only || !self.is_terminal(i.current_state_id))
            .count() as u64
    }

    fn is_terminal(&self, state_id: Uuid) -> bool {
        self.states
            .iter()
            .any(|s| s.value.id == state_id && s.value.is_terminal())
    }

    fn node(&self, hierarchy: Hierarchy, id: Uuid) -> Option<&HierarchyNode> {
        self.trees.get(&hierarchy)?.iter().find(|n| n.id == id)
    }

    /// `node` is `ancestor` or one of its descendants.
    fn within(&self, hierarchy: Hierarchy, node: Uuid, ancestor: Uuid) -> bool {
        match (self.node(hierarchy, node), self.node(hierarchy, ancestor)) {
            (Some(n), Some(a)) => n.is_within(a),
            _ => false,
        }
    }

    fn departments_covering(&self, classification_id: Uuid, location_id: Option<Uuid>) -> Vec<Department> {
        let mut matched: Vec<&HierarchyNode> = self
            .trees
            .get(&Hierarchy::Departments)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|d| {
                        self.coverage.iter().any(|cov| {
                            cov.department_id == d.id
                                && self.within(Hierarchy::Classifications, classification_id, cov.classification_id)
                                && match (cov.location_id, location_id) {
                                    (None, _) => true,
                                    (Some(scope), Some(loc)) => self.within(Hierarchy::Locations, loc, scope),
                                    (Some(_), None) => false,
                                }
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        matched.sort_by(|a, b| a.path.cmp(&b.path));

        matched
            .into_iter()
            .map(|d| Department { id: d.id, name: d.name.clone() })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// InMemoryStore
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent history write fail.
    pub fn fail_history_writes(&self, fail: bool) {
        self.lock().fail_history = fail;
    }

    /// Make every subsequent revision write fail.
    pub fn fail_revision_writes(&self, fail: bool) {
        self.lock().fail_revisions = fail;
    }

    pub fn member_counts(&self, workflow_id: Uuid) -> MemberCounts {
        let inner = self.lock();
        let mut counts = MemberCounts::default();
        for s in inner.states.iter().filter(|s| s.value.workflow_id == workflow_id) {
            if s.deleted {
                counts.deleted_states += 1;
            } else {
                counts.live_states += 1;
            }
        }
        for t in inner.transitions.iter().filter(|t| t.value.workflow_id == workflow_id) {
            if t.deleted {
                counts.deleted_transitions += 1;
            } else {
                counts.live_transitions += 1;
            }
        }
        counts
    }

    // -----------------------------------------------------------------------
    // Directory setup
    // -----------------------------------------------------------------------

    /// Add a tree node under `parent` (or as a root), deriving its path from
    /// the parent's stored path.
    pub fn add_node(
        &self,
        hierarchy: Hierarchy,
        name: &str,
        parent: Option<Uuid>,
    ) -> Result<HierarchyNode, StoreError> {
        let mut inner = self.lock();
        let node = match parent {
            None => HierarchyNode::root(name),
            Some(parent_id) => {
                let parent = inner
                    .node(hierarchy, parent_id)
                    .ok_or_else(|| StoreError::not_found("parent node", parent_id))?;
                HierarchyNode::child_of(parent, name)
            }
        };
        inner.trees.entry(hierarchy).or_default().push(node.clone());
        Ok(node)
    }

    pub fn tree(&self, hierarchy: Hierarchy, max_depth: usize) -> Vec<TreeNode> {
        let inner = self.lock();
        let rows = inner.trees.get(&hierarchy).cloned().unwrap_or_default();
        build_tree(&rows, max_depth)
    }

    /// Declare that a department handles a classification subtree,
    /// optionally only within a location subtree.
    pub fn cover(&self, department_id: Uuid, classification_id: Uuid, location_id: Option<Uuid>) {
        self.lock().coverage.push(Coverage {
            department_id,
            classification_id,
            location_id,
        });
    }

    pub fn add_user(&self, name: &str, department_id: Option<Uuid>, roles: &[&str]) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().users.push(UserEntry {
            id,
            name: name.to_string(),
            department_id,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            active: true,
        });
        id
    }

    pub fn deactivate_user(&self, user_id: Uuid) {
        if let Some(user) = self.lock().users.iter_mut().find(|u| u.id == user_id) {
            user.active = false;
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn load_graph(&self, workflow_id: Uuid) -> Result<Arc<WorkflowGraph>, StoreError> {
        let inner = self.lock();
        let workflow = inner
            .workflows
            .iter()
            .find(|w| w.value.id == workflow_id && !w.deleted)
            .map(|w| w.value.clone())
            .ok_or_else(|| StoreError::not_found("workflow", workflow_id))?;

        let states = inner
            .states
            .iter()
            .filter(|s| s.value.workflow_id == workflow_id && !s.deleted)
            .map(|s| s.value.clone())
            .collect();
        let transitions = inner
            .transitions
            .iter()
            .filter(|t| t.value.workflow_id == workflow_id && !t.deleted)
            .map(|t| t.value.clone())
            .collect();

        Ok(Arc::new(WorkflowGraph::new(workflow, states, transitions)?))
    }

    async fn find_default(&self, kind: RecordKind) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .lock()
            .workflows
            .iter()
            .find(|w| !w.deleted && w.value.active && w.value.is_default && w.value.applies_to_kind(kind))
            .map(|w| w.value.id))
    }

    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let workflow = graph.workflow();

        if inner.workflows.iter().any(|w| w.value.id == workflow.id) {
            return Err(StoreError::Backend(format!("workflow {} already exists", workflow.id)));
        }
        if inner.workflows.iter().any(|w| !w.deleted && w.value.code == workflow.code) {
            return Err(StoreError::Backend(format!("workflow code '{}' is taken", workflow.code)));
        }

        if workflow.is_default {
            let previous: Vec<Uuid> = inner
                .workflows
                .iter_mut()
                .filter(|w| w.value.is_default)
                .map(|w| {
                    w.value.is_default = false;
                    w.value.id
                })
                .collect();
            for id in previous {
                inner.bump_version(id);
            }
        }
        inner.workflows.push(Row::live(workflow.clone()));
        inner.states.extend(graph.states().iter().cloned().map(Row::live));
        inner.transitions.extend(graph.transitions().iter().cloned().map(Row::live));
        Ok(())
    }

    async fn set_default(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.live_workflow_mut(workflow_id)?;
        let mut changed = Vec::new();
        for w in inner.workflows.iter_mut() {
            let flag = w.value.id == workflow_id;
            if w.value.is_default != flag {
                w.value.is_default = flag;
                changed.push(w.value.id);
            }
        }
        for id in changed {
            inner.bump_version(id);
        }
        Ok(())
    }

    async fn workflow_version(&self, workflow_id: Uuid) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        inner.live_workflow_mut(workflow_id)?;
        Ok(inner.versions.get(&workflow_id).copied().unwrap_or_default())
    }

    async fn delete_workflow(
        &self,
        workflow_id: Uuid,
        mode: DeleteMode,
        _deleted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.live_workflow_mut(workflow_id)?;

        let incidents = inner.incidents_on(workflow_id, mode == DeleteMode::Soft);
        if incidents > 0 {
            return Err(StoreError::WorkflowInUse { workflow_id, incidents });
        }

        inner.bump_version(workflow_id);
        match mode {
            DeleteMode::Soft => {
                for w in inner.workflows.iter_mut().filter(|w| w.value.id == workflow_id) {
                    w.deleted = true;
                    w.value.is_default = false;
                }
                for s in inner.states.iter_mut().filter(|s| s.value.workflow_id == workflow_id) {
                    s.deleted = true;
                }
                for t in inner.transitions.iter_mut().filter(|t| t.value.workflow_id == workflow_id) {
                    t.deleted = true;
                }
            }
            DeleteMode::Hard => {
                inner.workflows.retain(|w| w.value.id != workflow_id);
                inner.states.retain(|s| s.value.workflow_id != workflow_id);
                inner.transitions.retain(|t| t.value.workflow_id != workflow_id);
            }
        }
        Ok(())
    }

    async fn transition_roles(&self, transition_id: Uuid) -> Result<BTreeSet<RoleCode>, StoreError> {
        Ok(self.lock().live_transition_mut(transition_id)?.allowed_roles.clone())
    }

    async fn apply_role_diff(
        &self,
        transition_id: Uuid,
        diff: &SetDiff<RoleCode>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let transition = inner.live_transition_mut(transition_id)?;
        reconcile::apply(&mut transition.allowed_roles, diff);
        let workflow_id = transition.workflow_id;
        inner.bump_version(workflow_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InstanceStore
// ---------------------------------------------------------------------------

#[async_trait]
impl InstanceStore for InMemoryStore {
    async fn load_instance(&self, incident_id: Uuid) -> Result<Incident, StoreError> {
        self.lock()
            .incidents
            .get(&incident_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("incident", incident_id))
    }

    async fn insert_instance(&self, incident: &Incident) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.incidents.contains_key(&incident.id) {
            return Err(StoreError::Backend(format!("incident {} already exists", incident.id)));
        }
        inner.incidents.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn compare_and_set_state(
        &self,
        incident_id: Uuid,
        change: &StateChange,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let incident = inner
            .incidents
            .get_mut(&incident_id)
            .ok_or_else(|| StoreError::not_found("incident", incident_id))?;

        if incident.current_state_id != change.expected_state_id {
            return Ok(false);
        }
        change.apply_to(incident);
        Ok(true)
    }

    async fn append_history(&self, row: &IncidentTransitionHistory) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_history {
            return Err(StoreError::Backend("history table unavailable".into()));
        }
        inner.history.push(row.clone());
        Ok(())
    }

    async fn append_revision(&self, revision: NewRevision) -> Result<IncidentRevision, StoreError> {
        let mut inner = self.lock();
        if inner.fail_revisions {
            return Err(StoreError::Backend("revision table unavailable".into()));
        }
        if !inner.incidents.contains_key(&revision.incident_id) {
            return Err(StoreError::not_found("incident", revision.incident_id));
        }

        let incident_id = revision.incident_id;
        let log = inner.revisions.entry(incident_id).or_default();
        let next = log.len() as i64 + 1;
        if let Some(supplied) = revision.revision_number {
            if supplied != next {
                return Err(StoreError::RevisionOutOfSequence {
                    incident_id,
                    supplied,
                    expected: next,
                });
            }
        }

        let stored = revision.numbered(next);
        log.push(stored.clone());
        Ok(stored)
    }

    async fn mark_sla_breached(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.lock();
        let candidates: Vec<Uuid> = inner
            .incidents
            .values()
            .filter(|i| !i.sla_breached)
            .filter(|i| i.sla_deadline.is_some_and(|deadline| deadline < now))
            .filter(|i| !inner.is_terminal(i.current_state_id))
            .map(|i| i.id)
            .collect();

        let mut breached = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(incident) = inner.incidents.get_mut(&id) {
                incident.sla_breached = true;
                breached.push(id);
            }
        }
        breached.sort();
        Ok(breached)
    }

    async fn history(&self, incident_id: Uuid) -> Result<Vec<IncidentTransitionHistory>, StoreError> {
        Ok(self
            .lock()
            .history
            .iter()
            .filter(|h| h.incident_id == incident_id)
            .cloned()
            .collect())
    }

    async fn revisions(&self, incident_id: Uuid) -> Result<Vec<IncidentRevision>, StoreError> {
        Ok(self.lock().revisions.get(&incident_id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[async_trait]
impl Directory for InMemoryStore {
    async fn matching_departments(
        &self,
        classification_id: Uuid,
        location_id: Option<Uuid>,
    ) -> Result<Vec<Department>, StoreError> {
        Ok(self.lock().departments_covering(classification_id, location_id))
    }

    async fn matching_users(
        &self,
        role: &str,
        classification_id: Option<Uuid>,
        location_id: Option<Uuid>,
        department_id: Option<Uuid>,
    ) -> Result<Vec<DirectoryUser>, StoreError> {
        let inner = self.lock();
        let departments: Vec<Uuid> = match (department_id, classification_id) {
            (Some(department), _) => vec![department],
            (None, Some(classification)) => inner
                .departments_covering(classification, location_id)
                .into_iter()
                .map(|d| d.id)
                .collect(),
            (None, None) => return Ok(Vec::new()),
        };

        let mut users: Vec<DirectoryUser> = inner
            .users
            .iter()
            .filter(|u| u.active && u.roles.contains(role))
            .filter(|u| u.department_id.is_some_and(|d| departments.contains(&d)))
            .map(|u| DirectoryUser { id: u.id, name: u.name.clone() })
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }
}
