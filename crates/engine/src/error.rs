//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::executor::TransitionReceipt;
use crate::graph::GraphError;
use crate::models::RecordKind;
use crate::resolver::{AssignmentDimension, RequirementViolation};
use crate::store::StoreError;

/// Errors produced by the transition engine.
///
/// Everything up to and including `AmbiguousAssignment` is reported before
/// any mutation and can be fixed by the caller. `Conflict` is retryable
/// against fresh state. `PartialSuccess` means the state change committed.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Workflow, state, transition or incident is missing or inactive.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The transition does not start at the incident's current state.
    #[error("transition '{transition}' does not start at current state '{current_state}'")]
    InvalidTransition {
        transition: String,
        current_state: String,
    },

    #[error("actor may not execute transition '{transition}' (allowed roles: {allowed_roles:?})")]
    Forbidden {
        transition: String,
        allowed_roles: Vec<String>,
    },

    /// Every violated mandatory requirement, not just the first.
    #[error("{} transition requirement(s) not met", .0.len())]
    RequirementsNotMet(Vec<RequirementViolation>),

    /// Several candidates matched (or a manual selection is missing); the
    /// caller must name one explicitly.
    #[error("{dimension} assignment needs an explicit choice among {} candidate(s)", .candidates.len())]
    AmbiguousAssignment {
        dimension: AssignmentDimension,
        candidates: Vec<Uuid>,
    },

    #[error("workflow '{workflow}' does not apply to {kind} records")]
    WorkflowNotApplicable { workflow: String, kind: RecordKind },

    #[error("invalid workflow definition: {0}")]
    InvalidWorkflow(#[from] GraphError),

    /// Incidents still depend on the workflow being deleted.
    #[error("workflow {workflow_id} is still used by {incidents} incident(s)")]
    WorkflowInUse { workflow_id: Uuid, incidents: u64 },

    // ------ Commit errors ------

    /// Another transition changed the incident's state first.
    #[error("incident {incident_id} left state {expected} before this transition committed")]
    Conflict { incident_id: Uuid, expected: Uuid },

    /// The state change committed but an audit write or synchronous action
    /// failed. The receipt lists what succeeded and what did not.
    #[error("transition committed but {} side effect(s) failed", .0.failures.len())]
    PartialSuccess(Box<TransitionReceipt>),

    // ------ Infrastructure ------

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// `Conflict` can be retried by resolving again against fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// The state change happened even though an error is returned.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::PartialSuccess(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::InvalidGraph(e) => Self::InvalidWorkflow(e),
            StoreError::WorkflowInUse { workflow_id, incidents } => {
                Self::WorkflowInUse { workflow_id, incidents }
            }
            other => Self::Storage(other),
        }
    }
}
