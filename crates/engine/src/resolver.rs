//! Transition resolution: decide whether a transition may run right now and
//! work out who it assigns the incident to. Nothing here mutates state.
//!
//! Order of checks:
//! 1. Transition exists (active) in the incident's workflow.
//! 2. It starts at the incident's current state.
//! 3. The actor holds one of its allowed roles.
//! 4. Requirements: all violated mandatory ones are reported together;
//!    unmet optional ones become warnings.
//! 5. Department assignment, then 6. user assignment (which may use the
//!    department resolved in step 5).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::graph::WorkflowGraph;
use crate::incident::{Feedback, Incident};
use crate::models::{
    DepartmentAssignment, FieldExpectation, RequirementKind, RoleCode, TransitionRequirement,
    UserAssignment, WorkflowState, WorkflowTransition,
};
use crate::store::{Directory, WorkflowStore};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The principal performing a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub roles: BTreeSet<RoleCode>,
}

impl Actor {
    pub fn new(user_id: Uuid, roles: &[&str]) -> Self {
        Self {
            user_id,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// A caller's request to execute one transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub transition_code: String,
    pub actor: Actor,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub attachment_ids: Vec<Uuid>,
    #[serde(default)]
    pub feedback: Option<Feedback>,
    /// Field values supplied with the request, checked by `field_value`
    /// requirements before the incident's own custom fields.
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub department_override: Option<Uuid>,
    #[serde(default)]
    pub assignee_override: Option<Uuid>,
}

impl TransitionRequest {
    pub fn new(transition_code: impl Into<String>, actor: Actor) -> Self {
        Self {
            transition_code: transition_code.into(),
            actor,
            comment: None,
            attachment_ids: Vec::new(),
            feedback: None,
            fields: Map::new(),
            department_override: None,
            assignee_override: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_attachments(mut self, ids: Vec<Uuid>) -> Self {
        self.attachment_ids = ids;
        self
    }

    pub fn with_feedback(mut self, rating: u8, comment: Option<String>) -> Self {
        self.feedback = Some(Feedback { rating, comment });
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_department(mut self, department_id: Uuid) -> Self {
        self.department_override = Some(department_id);
        self
    }

    pub fn with_assignee(mut self, user_id: Uuid) -> Self {
        self.assignee_override = Some(user_id);
        self
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementViolation {
    /// `comment`, `attachment`, `feedback`, `field 'x'` or `required field 'x'`.
    pub requirement: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentDimension {
    Department,
    User,
}

impl fmt::Display for AssignmentDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Department => write!(f, "department"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Assignment targets a transition will write. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentPlan {
    pub department_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    /// Broadcast assignment: every matched user.
    pub assignee_ids: Option<Vec<Uuid>>,
}

/// A transition that passed every check, ready for the executor.
#[derive(Debug, Clone)]
pub struct ResolvedTransition {
    pub incident_id: Uuid,
    pub workflow_id: Uuid,
    pub transition: WorkflowTransition,
    pub from_state: WorkflowState,
    pub to_state: WorkflowState,
    pub assignment: AssignmentPlan,
    pub satisfied: Vec<TransitionRequirement>,
    /// Optional requirements that were not met.
    pub waived: Vec<RequirementViolation>,
    pub warnings: Vec<String>,
    pub actor: Actor,
    pub comment: Option<String>,
    pub attachment_ids: Vec<Uuid>,
    pub feedback: Option<Feedback>,
}

/// One entry of the transition preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableTransition {
    pub code: String,
    pub name: String,
    pub to_state: String,
    pub can_execute: bool,
    /// Why it cannot run, or what the caller still has to supply.
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Requirement evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequirementCheck {
    pub satisfied: Vec<TransitionRequirement>,
    /// Violated mandatory requirements.
    pub violations: Vec<RequirementViolation>,
    /// Violated optional requirements.
    pub waived: Vec<RequirementViolation>,
}

/// Evaluate every requirement against the request (and, for field values,
/// the incident's custom fields).
pub fn evaluate_requirements(
    requirements: &[TransitionRequirement],
    request: &TransitionRequest,
    incident: &Incident,
) -> RequirementCheck {
    let mut check = RequirementCheck::default();

    for requirement in requirements {
        if requirement_met(&requirement.kind, request, incident) {
            check.satisfied.push(requirement.clone());
            continue;
        }

        let violation = RequirementViolation {
            requirement: requirement.kind.label(),
            message: requirement.error_message(),
        };
        if requirement.mandatory {
            check.violations.push(violation);
        } else {
            check.waived.push(violation);
        }
    }

    check
}

fn requirement_met(kind: &RequirementKind, request: &TransitionRequest, incident: &Incident) -> bool {
    match kind {
        RequirementKind::Comment => request
            .comment
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty()),
        RequirementKind::Attachment => !request.attachment_ids.is_empty(),
        RequirementKind::Feedback => request
            .feedback
            .as_ref()
            .is_some_and(|f| (1..=5).contains(&f.rating)),
        RequirementKind::FieldValue { field, expect } => {
            let value = request
                .fields
                .get(field)
                .or_else(|| field_value(&incident.custom_fields, field));
            expectation_met(expect, value)
        }
    }
}

/// Keyed lookup of one top-level field in a custom-fields document.
pub fn field_value<'a>(document: &'a Value, name: &str) -> Option<&'a Value> {
    document.as_object()?.get(name)
}

/// The named field is present, non-null and not a blank string.
pub(crate) fn field_present(document: &Value, name: &str) -> bool {
    field_value(document, name).is_some_and(is_present)
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn expectation_met(expect: &FieldExpectation, value: Option<&Value>) -> bool {
    let Some(value) = value else {
        return false;
    };
    match expect {
        FieldExpectation::Present => is_present(value),
        FieldExpectation::Equals { value: expected } => value == expected,
        FieldExpectation::OneOf { values } => values.contains(value),
        FieldExpectation::Matches { pattern } => match (value.as_str(), Regex::new(pattern)) {
            (Some(s), Ok(re)) => re.is_match(s),
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// TransitionResolver
// ---------------------------------------------------------------------------

/// Read-only resolution of transition requests against a graph snapshot.
#[derive(Clone)]
pub struct TransitionResolver {
    workflows: Arc<dyn WorkflowStore>,
    directory: Arc<dyn Directory>,
}

impl TransitionResolver {
    pub fn new(workflows: Arc<dyn WorkflowStore>, directory: Arc<dyn Directory>) -> Self {
        Self { workflows, directory }
    }

    /// Load the incident's workflow graph; inactive workflows count as missing.
    pub async fn graph_for(&self, incident: &Incident) -> Result<Arc<WorkflowGraph>, EngineError> {
        let graph = self.workflows.load_graph(incident.workflow_id).await?;
        if !graph.workflow().active {
            return Err(EngineError::NotFound {
                entity: "workflow",
                id: incident.workflow_id.to_string(),
            });
        }
        Ok(graph)
    }

    /// Resolve a request into a [`ResolvedTransition`].
    ///
    /// # Errors
    /// `NotFound`, `InvalidTransition`, `Forbidden`, `RequirementsNotMet` or
    /// `AmbiguousAssignment`, in that order of precedence.
    #[instrument(skip(self, incident, request), fields(incident_id = %incident.id, transition = %request.transition_code))]
    pub async fn resolve(
        &self,
        incident: &Incident,
        request: &TransitionRequest,
    ) -> Result<ResolvedTransition, EngineError> {
        let graph = self.graph_for(incident).await?;
        self.resolve_with_graph(&graph, incident, request).await
    }

    /// Resolve against an already-loaded graph snapshot.
    pub async fn resolve_with_graph(
        &self,
        graph: &WorkflowGraph,
        incident: &Incident,
        request: &TransitionRequest,
    ) -> Result<ResolvedTransition, EngineError> {
        // 1. Transition lookup
        let transition = graph
            .transition_by_code(&request.transition_code)
            .ok_or_else(|| EngineError::NotFound {
                entity: "transition",
                id: request.transition_code.clone(),
            })?;

        let current = graph
            .state(incident.current_state_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "state",
                id: incident.current_state_id.to_string(),
            })?;

        // 2. Single edge from the current state
        if transition.from_state_id != incident.current_state_id {
            return Err(EngineError::InvalidTransition {
                transition: transition.code.clone(),
                current_state: current.code.clone(),
            });
        }

        // 3. Roles
        if !transition.permits(&request.actor.roles) {
            return Err(EngineError::Forbidden {
                transition: transition.code.clone(),
                allowed_roles: transition.allowed_roles.iter().cloned().collect(),
            });
        }

        // 4. Requirements
        let check = evaluate_requirements(&transition.requirements, request, incident);
        if !check.violations.is_empty() {
            debug!("{} mandatory requirement(s) violated", check.violations.len());
            return Err(EngineError::RequirementsNotMet(check.violations));
        }

        let mut warnings = Vec::new();
        for waived in &check.waived {
            warn!("optional requirement not met: {}", waived.requirement);
            warnings.push(format!("optional requirement not met: {}", waived.message));
        }

        // 5-6. Assignment
        let assignment = self
            .resolve_assignment(transition, incident, request, &mut warnings)
            .await?;

        let to_state = graph
            .state(transition.to_state_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "state",
                id: transition.to_state_id.to_string(),
            })?;

        Ok(ResolvedTransition {
            incident_id: incident.id,
            workflow_id: graph.id(),
            transition: transition.clone(),
            from_state: current.clone(),
            to_state: to_state.clone(),
            assignment,
            satisfied: check.satisfied,
            waived: check.waived,
            warnings,
            actor: request.actor.clone(),
            comment: request.comment.clone(),
            attachment_ids: request.attachment_ids.clone(),
            feedback: request.feedback.clone(),
        })
    }

    async fn resolve_assignment(
        &self,
        transition: &WorkflowTransition,
        incident: &Incident,
        request: &TransitionRequest,
        warnings: &mut Vec<String>,
    ) -> Result<AssignmentPlan, EngineError> {
        let mut plan = AssignmentPlan::default();

        plan.department_id = match &transition.department {
            DepartmentAssignment::None => None,
            DepartmentAssignment::Fixed { department_id } => Some(*department_id),
            DepartmentAssignment::Manual => Some(request.department_override.ok_or(
                EngineError::AmbiguousAssignment {
                    dimension: AssignmentDimension::Department,
                    candidates: Vec::new(),
                },
            )?),
            DepartmentAssignment::AutoDetect => {
                let candidates = match incident.classification_id {
                    Some(classification) => self
                        .directory
                        .matching_departments(classification, incident.location_id)
                        .await?
                        .into_iter()
                        .map(|d| d.id)
                        .collect(),
                    None => Vec::new(),
                };
                pick_single(
                    AssignmentDimension::Department,
                    candidates,
                    request.department_override,
                    warnings,
                )?
            }
        };

        let department = plan.department_id.or(incident.department_id);

        match &transition.user {
            UserAssignment::None => {}
            UserAssignment::Fixed { user_id } => plan.assignee_id = Some(*user_id),
            UserAssignment::Manual => {
                plan.assignee_id = Some(request.assignee_override.ok_or(
                    EngineError::AmbiguousAssignment {
                        dimension: AssignmentDimension::User,
                        candidates: Vec::new(),
                    },
                )?)
            }
            UserAssignment::AutoDetect { role, assign_all } => {
                let candidates: Vec<Uuid> = self
                    .directory
                    .matching_users(role, incident.classification_id, incident.location_id, department)
                    .await?
                    .into_iter()
                    .map(|u| u.id)
                    .collect();

                if *assign_all {
                    if candidates.is_empty() {
                        warn!("no users with role '{}' matched; assignees left unchanged", role);
                        warnings.push(format!("no users with role '{role}' matched"));
                    } else {
                        plan.assignee_ids = Some(candidates);
                    }
                } else {
                    plan.assignee_id = pick_single(
                        AssignmentDimension::User,
                        candidates,
                        request.assignee_override,
                        warnings,
                    )?;
                }
            }
        }

        Ok(plan)
    }

    /// List the active transitions out of the incident's current state,
    /// with whether each could run for `actor` right now.
    ///
    /// Requirements are treated as not yet known: missing input produces a
    /// `reason`, never an error. Takes no lock and may observe stale state.
    #[instrument(skip(self, incident, actor), fields(incident_id = %incident.id))]
    pub async fn preview(
        &self,
        incident: &Incident,
        actor: &Actor,
    ) -> Result<Vec<AvailableTransition>, EngineError> {
        let graph = self.graph_for(incident).await?;
        let mut available = Vec::new();

        for transition in graph.outbound(incident.current_state_id) {
            let Some(target) = graph.state(transition.to_state_id) else {
                continue;
            };
            if !target.is_visible_to(&actor.roles) {
                continue;
            }

            if !transition.permits(&actor.roles) {
                available.push(AvailableTransition {
                    code: transition.code.clone(),
                    name: transition.name.clone(),
                    to_state: target.code.clone(),
                    can_execute: false,
                    reason: Some(format!(
                        "requires one of roles: {}",
                        transition.allowed_roles.iter().cloned().collect::<Vec<_>>().join(", ")
                    )),
                });
                continue;
            }

            let mut notes = Vec::new();
            let pending: Vec<String> = transition
                .requirements
                .iter()
                .filter(|r| r.mandatory)
                .filter(|r| match &r.kind {
                    // Field values may already be satisfied by the incident itself.
                    RequirementKind::FieldValue { field, expect } => {
                        !expectation_met(expect, field_value(&incident.custom_fields, field))
                    }
                    _ => true,
                })
                .map(|r| r.kind.label())
                .collect();
            if !pending.is_empty() {
                notes.push(format!("needs {}", pending.join(", ")));
            }

            let preview = TransitionRequest::new(transition.code.clone(), actor.clone());
            let mut ignored = Vec::new();
            match self.resolve_assignment(transition, incident, &preview, &mut ignored).await {
                Ok(_) => {}
                Err(EngineError::AmbiguousAssignment { dimension, candidates }) if candidates.is_empty() => {
                    notes.push(format!("needs a {dimension} to be selected"))
                }
                Err(EngineError::AmbiguousAssignment { dimension, candidates }) => notes.push(format!(
                    "needs a {dimension} to be chosen among {} candidates",
                    candidates.len()
                )),
                Err(other) => return Err(other),
            }

            available.push(AvailableTransition {
                code: transition.code.clone(),
                name: transition.name.clone(),
                to_state: target.code.clone(),
                can_execute: true,
                reason: (!notes.is_empty()).then(|| notes.join("; ")),
            });
        }

        Ok(available)
    }
}

/// Apply the none/one/many rule to auto-detect candidates.
///
/// An override must be one of the candidates when there are any.
fn pick_single(
    dimension: AssignmentDimension,
    candidates: Vec<Uuid>,
    override_id: Option<Uuid>,
    warnings: &mut Vec<String>,
) -> Result<Option<Uuid>, EngineError> {
    if let Some(chosen) = override_id {
        if candidates.is_empty() || candidates.contains(&chosen) {
            return Ok(Some(chosen));
        }
        return Err(EngineError::AmbiguousAssignment { dimension, candidates });
    }

    match candidates.as_slice() {
        [] => {
            warn!("auto-detect {} assignment found no candidates; left unassigned", dimension);
            warnings.push(format!("no {dimension} matched; left unassigned"));
            Ok(None)
        }
        [only] => Ok(Some(*only)),
        _ => Err(EngineError::AmbiguousAssignment { dimension, candidates }),
    }
}
