//! Workflow graph domain models.
//!
//! These types are the source of truth for what a workflow template looks
//! like in memory. The `db` crate stores them as rows; requirements and
//! actions travel as JSON documents.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use actions::ActionKind;

/// Roles are referenced by code everywhere in the engine.
pub type RoleCode = String;

// ---------------------------------------------------------------------------
// RecordKind
// ---------------------------------------------------------------------------

/// What kind of record an incident-like ticket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Incident,
    Request,
    Complaint,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incident => write!(f, "incident"),
            Self::Request => write!(f, "request"),
            Self::Complaint => write!(f, "complaint"),
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incident"  => Ok(Self::Incident),
            "request"   => Ok(Self::Request),
            "complaint" => Ok(Self::Complaint),
            other       => Err(format!("unknown record kind: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    /// Unique across workflows.
    pub code: String,
    pub name: String,
    pub active: bool,
    /// At most one workflow is the default.
    pub is_default: bool,
    pub applies_to: BTreeSet<RecordKind>,
    /// Custom-field names that must be present when an incident is opened.
    pub required_fields: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            name: name.into(),
            active: true,
            is_default: false,
            applies_to: BTreeSet::from([RecordKind::Incident]),
            required_fields: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn applies_to_kind(&self, kind: RecordKind) -> bool {
        self.applies_to.contains(&kind)
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Initial,
    Normal,
    Terminal,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Normal => write!(f, "normal"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

impl FromStr for StateKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial"  => Ok(Self::Initial),
            "normal"   => Ok(Self::Normal),
            "terminal" => Ok(Self::Terminal),
            other      => Err(format!("unknown state kind: {other}")),
        }
    }
}

/// Longest SLA budget a state may carry (ten years).
pub const MAX_SLA_HOURS: u32 = 87_600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Unique within the workflow.
    pub code: String,
    pub name: String,
    pub kind: StateKind,
    /// SLA budget for time spent after entering this state.
    pub sla_hours: Option<u32>,
    /// Roles allowed to see the state; empty means everyone.
    pub visible_to: BTreeSet<RoleCode>,
}

impl WorkflowState {
    pub fn new(workflow_id: Uuid, code: impl Into<String>, name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            code: code.into(),
            name: name.into(),
            kind,
            sla_hours: None,
            visible_to: BTreeSet::new(),
        }
    }

    pub fn with_sla_hours(mut self, hours: u32) -> Self {
        self.sla_hours = Some(hours);
        self
    }

    pub fn is_initial(&self) -> bool {
        self.kind == StateKind::Initial
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == StateKind::Terminal
    }

    /// `None` when the state has no budget. Budgets are bounded by
    /// [`MAX_SLA_HOURS`] once the state is part of a validated graph.
    pub fn sla_budget(&self) -> Option<Duration> {
        self.sla_hours.map(|h| Duration::hours(i64::from(h)))
    }

    pub fn is_visible_to(&self, roles: &BTreeSet<RoleCode>) -> bool {
        self.visible_to.is_empty() || !self.visible_to.is_disjoint(roles)
    }
}

// ---------------------------------------------------------------------------
// Assignment policy
// ---------------------------------------------------------------------------

/// How a transition sets the incident's department.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DepartmentAssignment {
    /// Leave the department as it is.
    #[default]
    None,
    Fixed { department_id: Uuid },
    /// Match departments against the incident's classification and location.
    AutoDetect,
    /// The caller names the department in the request.
    Manual,
}

/// How a transition sets the incident's assignee(s).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UserAssignment {
    #[default]
    None,
    Fixed { user_id: Uuid },
    /// Match users holding `role`; with `assign_all` every match is assigned
    /// instead of requiring exactly one.
    AutoDetect {
        role: RoleCode,
        #[serde(default)]
        assign_all: bool,
    },
    Manual,
}

// ---------------------------------------------------------------------------
// Requirements
// ---------------------------------------------------------------------------

/// Expected shape of a field named by a `field_value` requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldExpectation {
    /// Present, non-null and not an empty string.
    Present,
    Equals { value: Value },
    OneOf { values: Vec<Value> },
    /// String value matching a regular expression.
    Matches { pattern: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequirementKind {
    Comment,
    Attachment,
    /// Feedback with a rating between 1 and 5.
    Feedback,
    FieldValue { field: String, expect: FieldExpectation },
}

impl RequirementKind {
    pub fn label(&self) -> String {
        match self {
            Self::Comment => "comment".into(),
            Self::Attachment => "attachment".into(),
            Self::Feedback => "feedback".into(),
            Self::FieldValue { field, .. } => format!("field '{field}'"),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRequirement {
    #[serde(flatten)]
    pub kind: RequirementKind,
    #[serde(default = "default_true")]
    pub mandatory: bool,
    /// Message shown to the caller when the requirement is not met.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TransitionRequirement {
    pub fn mandatory(kind: RequirementKind) -> Self {
        Self { kind, mandatory: true, message: None }
    }

    pub fn optional(kind: RequirementKind) -> Self {
        Self { kind, mandatory: false, message: None }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("{} is required", self.kind.label()))
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionAction {
    pub code: String,
    pub kind: ActionKind,
    /// Actions run in ascending order.
    pub execution_order: i32,
    /// Synchronous actions block the transition request; the rest are queued.
    #[serde(default)]
    pub synchronous: bool,
    /// Opaque configuration interpreted by the action handler.
    #[serde(default)]
    pub config: Value,
}

// ---------------------------------------------------------------------------
// WorkflowTransition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Unique within the workflow.
    pub code: String,
    pub name: String,
    pub from_state_id: Uuid,
    pub to_state_id: Uuid,
    pub active: bool,
    /// Roles allowed to execute; empty means any actor with workflow access.
    pub allowed_roles: BTreeSet<RoleCode>,
    pub requirements: Vec<TransitionRequirement>,
    pub actions: Vec<TransitionAction>,
    pub department: DepartmentAssignment,
    pub user: UserAssignment,
}

impl WorkflowTransition {
    pub fn new(
        workflow_id: Uuid,
        code: impl Into<String>,
        name: impl Into<String>,
        from_state_id: Uuid,
        to_state_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            code: code.into(),
            name: name.into(),
            from_state_id,
            to_state_id,
            active: true,
            allowed_roles: BTreeSet::new(),
            requirements: Vec::new(),
            actions: Vec::new(),
            department: DepartmentAssignment::None,
            user: UserAssignment::None,
        }
    }

    pub fn permits(&self, roles: &BTreeSet<RoleCode>) -> bool {
        self.allowed_roles.is_empty() || !self.allowed_roles.is_disjoint(roles)
    }

    /// Actions in execution order.
    pub fn ordered_actions(&self) -> Vec<&TransitionAction> {
        let mut ordered: Vec<&TransitionAction> = self.actions.iter().collect();
        ordered.sort_by_key(|a| a.execution_order);
        ordered
    }
}
