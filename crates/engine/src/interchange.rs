//! Workflow import/export as an id-free JSON document.
//!
//! States and transitions reference each other by code and roles are role
//! codes, so a document can be loaded into an empty system. Import assigns
//! fresh ids and validates the result like any other graph.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{GraphError, WorkflowGraph};
use crate::models::{
    DepartmentAssignment, RecordKind, RoleCode, StateKind, TransitionAction, TransitionRequirement,
    UserAssignment, Workflow, WorkflowState, WorkflowTransition,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExport {
    pub code: String,
    pub name: String,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub is_default: bool,
    pub applies_to: BTreeSet<RecordKind>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    pub states: Vec<StateExport>,
    #[serde(default)]
    pub transitions: Vec<TransitionExport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateExport {
    pub code: String,
    pub name: String,
    pub kind: StateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_hours: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub visible_to: BTreeSet<RoleCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionExport {
    pub code: String,
    pub name: String,
    /// Source state code.
    pub from: String,
    /// Target state code.
    pub to: String,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub allowed_roles: BTreeSet<RoleCode>,
    #[serde(default)]
    pub requirements: Vec<TransitionRequirement>,
    #[serde(default)]
    pub actions: Vec<TransitionAction>,
    #[serde(default)]
    pub department: DepartmentAssignment,
    #[serde(default)]
    pub user: UserAssignment,
}

fn yes() -> bool {
    true
}

/// Export a graph. Actions come out in execution order.
pub fn export(graph: &WorkflowGraph) -> WorkflowExport {
    let workflow = graph.workflow();
    let state_code = |id: Uuid| {
        graph
            .state(id)
            .map(|s| s.code.clone())
            .unwrap_or_default()
    };

    WorkflowExport {
        code: workflow.code.clone(),
        name: workflow.name.clone(),
        active: workflow.active,
        is_default: workflow.is_default,
        applies_to: workflow.applies_to.clone(),
        required_fields: workflow.required_fields.clone(),
        states: graph
            .states()
            .iter()
            .map(|s| StateExport {
                code: s.code.clone(),
                name: s.name.clone(),
                kind: s.kind,
                sla_hours: s.sla_hours,
                visible_to: s.visible_to.clone(),
            })
            .collect(),
        transitions: graph
            .transitions()
            .iter()
            .map(|t| TransitionExport {
                code: t.code.clone(),
                name: t.name.clone(),
                from: state_code(t.from_state_id),
                to: state_code(t.to_state_id),
                active: t.active,
                allowed_roles: t.allowed_roles.clone(),
                requirements: t.requirements.clone(),
                actions: t.ordered_actions().into_iter().cloned().collect(),
                department: t.department.clone(),
                user: t.user.clone(),
            })
            .collect(),
    }
}

/// Build a validated graph with fresh ids from an export document.
///
/// # Errors
/// `UnknownState` when a transition names a state code that is not in the
/// document, or any other [`GraphError`] from validation.
pub fn import(doc: &WorkflowExport, created_at: DateTime<Utc>) -> Result<WorkflowGraph, GraphError> {
    let workflow = Workflow {
        id: Uuid::new_v4(),
        code: doc.code.clone(),
        name: doc.name.clone(),
        active: doc.active,
        is_default: doc.is_default,
        applies_to: doc.applies_to.clone(),
        required_fields: doc.required_fields.clone(),
        created_at,
    };

    let states: Vec<WorkflowState> = doc
        .states
        .iter()
        .map(|s| WorkflowState {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            code: s.code.clone(),
            name: s.name.clone(),
            kind: s.kind,
            sla_hours: s.sla_hours,
            visible_to: s.visible_to.clone(),
        })
        .collect();

    let ids: HashMap<&str, Uuid> = states.iter().map(|s| (s.code.as_str(), s.id)).collect();
    let lookup = |transition: &str, code: &str, side: &'static str| {
        ids.get(code).copied().ok_or_else(|| GraphError::UnknownState {
            transition: transition.to_string(),
            state: code.to_string(),
            side,
        })
    };

    let mut transitions = Vec::with_capacity(doc.transitions.len());
    for t in &doc.transitions {
        let mut transition = WorkflowTransition::new(
            workflow.id,
            t.code.clone(),
            t.name.clone(),
            lookup(&t.code, &t.from, "from")?,
            lookup(&t.code, &t.to, "to")?,
        );
        transition.active = t.active;
        transition.allowed_roles = t.allowed_roles.clone();
        transition.requirements = t.requirements.clone();
        transition.actions = t.actions.clone();
        transition.department = t.department.clone();
        transition.user = t.user.clone();
        transitions.push(transition);
    }

    WorkflowGraph::new(workflow, states, transitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequirementKind;
    use actions::ActionKind;
    use serde_json::json;

    fn document() -> WorkflowExport {
        serde_json::from_value(json!({
            "code": "support",
            "name": "Support",
            "applies_to": ["incident", "request"],
            "states": [
                { "code": "new", "name": "New", "kind": "initial", "sla_hours": 4 },
                { "code": "in_progress", "name": "In Progress", "kind": "normal", "visible_to": ["agent"] },
                { "code": "resolved", "name": "Resolved", "kind": "terminal" }
            ],
            "transitions": [
                {
                    "code": "start", "name": "Start", "from": "new", "to": "in_progress",
                    "allowed_roles": ["agent"],
                    "requirements": [{ "kind": "comment", "message": "say what you are doing" }],
                    "actions": [
                        { "code": "hook", "kind": "webhook", "execution_order": 2, "config": { "url": "http://x" } },
                        { "code": "mail", "kind": "email", "execution_order": 1, "synchronous": true }
                    ],
                    "department": { "mode": "auto_detect" },
                    "user": { "mode": "auto_detect", "role": "agent", "assign_all": true }
                },
                { "code": "resolve", "name": "Resolve", "from": "in_progress", "to": "resolved" }
            ]
        }))
        .expect("valid document")
    }

    #[test]
    fn import_assigns_fresh_ids_and_links_by_code() {
        let graph = import(&document(), Utc::now()).unwrap();
        assert_eq!(graph.initial_state().code, "new");
        assert_eq!(graph.initial_state().sla_hours, Some(4));

        let start = graph.transition_by_code("start").unwrap();
        assert_eq!(graph.state(start.from_state_id).unwrap().code, "new");
        assert_eq!(graph.state(start.to_state_id).unwrap().code, "in_progress");
        assert!(start.requirements[0].mandatory);
        assert_eq!(start.requirements[0].kind, RequirementKind::Comment);
        assert_eq!(
            start.user,
            UserAssignment::AutoDetect { role: "agent".into(), assign_all: true }
        );

        let again = import(&document(), Utc::now()).unwrap();
        assert_ne!(graph.id(), again.id());
        assert_ne!(graph.initial_state().id, again.initial_state().id);
    }

    #[test]
    fn export_then_import_is_isomorphic() {
        let original = import(&document(), Utc::now()).unwrap();
        let exported = export(&original);
        let reimported = import(&exported, Utc::now()).unwrap();

        // Ids differ, the code-keyed document does not.
        assert_ne!(original.id(), reimported.id());
        assert_eq!(export(&reimported), exported);

        let actions: Vec<ActionKind> = exported.transitions[0].actions.iter().map(|a| a.kind).collect();
        assert_eq!(actions, vec![ActionKind::Email, ActionKind::Webhook]);
    }

    #[test]
    fn unknown_state_code_is_rejected() {
        let mut doc = document();
        doc.transitions[1].to = "closed".into();
        assert_eq!(
            import(&doc, Utc::now()).unwrap_err(),
            GraphError::UnknownState {
                transition: "resolve".into(),
                state: "closed".into(),
                side: "to",
            }
        );
    }
}
