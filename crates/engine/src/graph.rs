//! Workflow graph snapshot: validate it once, then use it read-only.
//!
//! Rules enforced by [`WorkflowGraph::new`]:
//! 1. State codes are unique and every state belongs to the workflow.
//! 2. Exactly one state has kind `initial`.
//! 3. Transition codes are unique; both endpoints are states of this workflow.
//! 4. Terminal states have no active outbound transitions.
//! 5. Action execution orders are unique per transition, feedback and
//!    field-value requirements are well-formed.
//!
//! Lookups (`transition_by_code`, `outbound`) only ever return active
//! transitions.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    FieldExpectation, RequirementKind, Workflow, WorkflowState, WorkflowTransition, MAX_SLA_HOURS,
};

/// Structural problems with a workflow definition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("workflow has no initial state")]
    NoInitialState,

    #[error("workflow has more than one initial state: {0:?}")]
    MultipleInitialStates(Vec<String>),

    #[error("duplicate state code: '{0}'")]
    DuplicateStateCode(String),

    #[error("duplicate transition code: '{0}'")]
    DuplicateTransitionCode(String),

    /// A state or transition row points at a different workflow.
    #[error("'{code}' belongs to another workflow")]
    ForeignMember { code: String },

    #[error("transition '{transition}' references unknown state {state} ({side} side)")]
    UnknownState {
        transition: String,
        state: String,
        side: &'static str,
    },

    #[error("terminal state '{state}' has active outbound transition '{transition}'")]
    TerminalHasOutbound { state: String, transition: String },

    #[error("transition '{transition}' has two actions with execution order {order}")]
    DuplicateActionOrder { transition: String, order: i32 },

    /// Static and dynamic (or manual) assignment configured on the same dimension.
    #[error("transition '{transition}' has conflicting {dimension} assignment settings")]
    ConflictingAssignment {
        transition: String,
        dimension: &'static str,
    },

    #[error("state '{state}' has an SLA budget of {hours}h (at most {max}h allowed)", max = MAX_SLA_HOURS)]
    SlaBudgetTooLarge { state: String, hours: u32 },

    #[error("transition '{transition}' has an invalid requirement: {reason}")]
    InvalidRequirement { transition: String, reason: String },
}

/// A validated, read-only workflow graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    workflow: Workflow,
    states: Vec<WorkflowState>,
    transitions: Vec<WorkflowTransition>,
    state_index: HashMap<Uuid, usize>,
    initial: usize,
}

impl WorkflowGraph {
    /// Validate the parts and assemble the graph.
    ///
    /// # Errors
    /// Any [`GraphError`] describing the first structural rule violated.
    pub fn new(
        workflow: Workflow,
        states: Vec<WorkflowState>,
        transitions: Vec<WorkflowTransition>,
    ) -> Result<Self, GraphError> {
        // -------------------------------------------------------------------
        // 1. States
        // -------------------------------------------------------------------
        let mut seen_codes: HashSet<&str> = HashSet::new();
        let mut state_index = HashMap::with_capacity(states.len());
        for (i, state) in states.iter().enumerate() {
            if state.workflow_id != workflow.id {
                return Err(GraphError::ForeignMember { code: state.code.clone() });
            }
            if !seen_codes.insert(state.code.as_str()) {
                return Err(GraphError::DuplicateStateCode(state.code.clone()));
            }
            if let Some(hours) = state.sla_hours.filter(|&h| h > MAX_SLA_HOURS) {
                return Err(GraphError::SlaBudgetTooLarge {
                    state: state.code.clone(),
                    hours,
                });
            }
            state_index.insert(state.id, i);
        }

        // -------------------------------------------------------------------
        // 2. Exactly one initial state
        // -------------------------------------------------------------------
        let initials: Vec<usize> = states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_initial())
            .map(|(i, _)| i)
            .collect();
        let initial = match initials.as_slice() {
            [] => return Err(GraphError::NoInitialState),
            [only] => *only,
            many => {
                return Err(GraphError::MultipleInitialStates(
                    many.iter().map(|&i| states[i].code.clone()).collect(),
                ))
            }
        };

        // -------------------------------------------------------------------
        // 3-5. Transitions
        // -------------------------------------------------------------------
        let mut seen_transitions: HashSet<&str> = HashSet::new();
        for transition in &transitions {
            if transition.workflow_id != workflow.id {
                return Err(GraphError::ForeignMember { code: transition.code.clone() });
            }
            if !seen_transitions.insert(transition.code.as_str()) {
                return Err(GraphError::DuplicateTransitionCode(transition.code.clone()));
            }

            let from = state_index.get(&transition.from_state_id).ok_or_else(|| {
                GraphError::UnknownState {
                    transition: transition.code.clone(),
                    state: transition.from_state_id.to_string(),
                    side: "from",
                }
            })?;
            if !state_index.contains_key(&transition.to_state_id) {
                return Err(GraphError::UnknownState {
                    transition: transition.code.clone(),
                    state: transition.to_state_id.to_string(),
                    side: "to",
                });
            }

            let source = &states[*from];
            if source.is_terminal() && transition.active {
                return Err(GraphError::TerminalHasOutbound {
                    state: source.code.clone(),
                    transition: transition.code.clone(),
                });
            }

            let mut orders: HashSet<i32> = HashSet::new();
            for action in &transition.actions {
                if !orders.insert(action.execution_order) {
                    return Err(GraphError::DuplicateActionOrder {
                        transition: transition.code.clone(),
                        order: action.execution_order,
                    });
                }
            }

            validate_requirements(transition)?;
        }

        Ok(Self {
            workflow,
            states,
            transitions,
            state_index,
            initial,
        })
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn id(&self) -> Uuid {
        self.workflow.id
    }

    pub fn states(&self) -> &[WorkflowState] {
        &self.states
    }

    /// Every transition, including inactive ones.
    pub fn transitions(&self) -> &[WorkflowTransition] {
        &self.transitions
    }

    pub fn initial_state(&self) -> &WorkflowState {
        &self.states[self.initial]
    }

    pub fn state(&self, id: Uuid) -> Option<&WorkflowState> {
        self.state_index.get(&id).map(|&i| &self.states[i])
    }

    pub fn state_by_code(&self, code: &str) -> Option<&WorkflowState> {
        self.states.iter().find(|s| s.code == code)
    }

    /// Active transition with the given code.
    pub fn transition_by_code(&self, code: &str) -> Option<&WorkflowTransition> {
        self.transitions.iter().find(|t| t.active && t.code == code)
    }

    pub fn transition(&self, id: Uuid) -> Option<&WorkflowTransition> {
        self.transitions.iter().find(|t| t.id == id)
    }

    /// Active transitions leaving `state_id`.
    pub fn outbound(&self, state_id: Uuid) -> impl Iterator<Item = &WorkflowTransition> {
        self.transitions
            .iter()
            .filter(move |t| t.active && t.from_state_id == state_id)
    }
}

fn validate_requirements(transition: &WorkflowTransition) -> Result<(), GraphError> {
    for requirement in &transition.requirements {
        if let RequirementKind::FieldValue { field, expect } = &requirement.kind {
            if field.trim().is_empty() {
                return Err(GraphError::InvalidRequirement {
                    transition: transition.code.clone(),
                    reason: "field_value requirement without a field name".into(),
                });
            }
            if let FieldExpectation::Matches { pattern } = expect {
                Regex::new(pattern).map_err(|e| GraphError::InvalidRequirement {
                    transition: transition.code.clone(),
                    reason: format!("bad pattern for field '{field}': {e}"),
                })?;
            }
        }
    }
    Ok(())
}
