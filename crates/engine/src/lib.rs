//! `engine` crate: workflow graph model, transition resolution and
//! execution, SLA tracking and the incident audit trail.

pub mod models;
pub mod incident;
pub mod error;
pub mod graph;
pub mod clock;
pub mod store;
pub mod reconcile;
pub mod hierarchy;
pub mod resolver;
pub mod revision;
pub mod executor;
pub mod sla;
pub mod cache;
pub mod interchange;
pub mod memory;
pub mod postgres;
pub mod service;

pub use models::{
    DepartmentAssignment, FieldExpectation, RecordKind, RequirementKind, RoleCode, StateKind,
    TransitionAction, TransitionRequirement, UserAssignment, Workflow, WorkflowState,
    WorkflowTransition,
};
pub use incident::{
    ActionOutcome, ActionStatus, Feedback, FieldChange, Incident, IncidentRevision,
    IncidentTransitionHistory, NewIncident, RevisionKind,
};
pub use error::EngineError;
pub use graph::{GraphError, WorkflowGraph};
pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{DeleteMode, Directory, InstanceStore, StoreError, WorkflowStore};
pub use resolver::{
    Actor, AssignmentDimension, AvailableTransition, RequirementViolation, ResolvedTransition,
    TransitionRequest, TransitionResolver,
};
pub use revision::RevisionRecorder;
pub use executor::{EngineConfig, SideEffect, SideEffectFailure, TransitionExecutor, TransitionReceipt};
pub use sla::{SlaMonitor, SlaMonitorConfig, SweepReport};
pub use cache::CachedWorkflowStore;
pub use interchange::WorkflowExport;
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use service::{Collaborators, IncidentEngine};

#[cfg(test)]
mod executor_tests;
