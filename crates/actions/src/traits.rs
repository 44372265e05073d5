//! The action contracts: what a handler does and how the engine hands
//! actions off.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ActionError;

/// Kind of post-transition side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Email,
    FieldUpdate,
    Webhook,
    Notification,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::FieldUpdate => write!(f, "field_update"),
            Self::Webhook => write!(f, "webhook"),
            Self::Notification => write!(f, "notification"),
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email"        => Ok(Self::Email),
            "field_update" => Ok(Self::FieldUpdate),
            "webhook"      => Ok(Self::Webhook),
            "notification" => Ok(Self::Notification),
            other          => Err(format!("unknown action kind: {other}")),
        }
    }
}

/// Context describing the committed transition an action runs for.
///
/// Defined here (in the actions crate) so both the engine and individual
/// handlers can import it without a circular dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContext {
    pub incident_id: Uuid,
    pub workflow_id: Uuid,
    pub transition_code: String,
    pub from_state: String,
    pub to_state: String,
    pub actor_id: Uuid,
    /// Snapshot of the incident after the transition committed.
    pub incident: Value,
}

/// One action ready to run: its kind, opaque configuration and context.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    /// Code of the configured action, used in logs and results.
    pub code: String,
    pub kind: ActionKind,
    pub config: Value,
    pub context: ActionContext,
}

/// Implemented by every side-effect handler (email sender, webhook caller…).
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the action with its opaque configuration and return a result
    /// document to be stored on the transition history.
    async fn execute(&self, config: &Value, ctx: &ActionContext) -> Result<Value, ActionError>;
}

/// The engine's only contract with action execution.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    /// Run an action to completion on the caller's task.
    async fn run(&self, invocation: &ActionInvocation) -> Result<Value, ActionError>;

    /// Hand an action off for background execution. Returns once the action
    /// is accepted; retries and failure logging belong to the dispatcher.
    fn dispatch(&self, invocation: ActionInvocation) -> Result<(), ActionError>;
}
