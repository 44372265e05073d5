//! Transition executor: commit a [`ResolvedTransition`] as one logical unit.
//!
//! `TransitionExecutor` is the write-side orchestrator:
//! 1. Re-reads the incident and re-checks it is still in the source state.
//! 2. Builds the state change (assignment, SLA deadline, resolution stamps).
//! 3. Commits it with a compare-and-set on `current_state_id`. Losing the
//!    race yields `Conflict`; nothing has been written.
//! 4. Runs the transition's actions in ascending execution order.
//! 5. Writes one history row and the revision rows.
//!
//! Failures in steps 4 and 5 never undo step 3. They are collected on the
//! [`TransitionReceipt`] and reported as `PartialSuccess`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use actions::{ActionContext, ActionDispatcher, ActionError, ActionInvocation};

use crate::clock::Clock;
use crate::incident::{
    ActionOutcome, ActionStatus, FieldChange, Incident, IncidentTransitionHistory, RevisionKind,
};
use crate::resolver::ResolvedTransition;
use crate::revision::RevisionRecorder;
use crate::sla::deadline_for;
use crate::store::{DeadlineUpdate, InstanceStore, StateChange};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for one synchronous action; exceeding it counts as a
    /// failed action.
    pub sync_action_timeout: Duration,
    /// Wrap the workflow store in a graph cache.
    pub cache_graphs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_action_timeout: Duration::from_secs(30),
            cache_graphs: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Output of a committed transition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SideEffect {
    History,
    Revision { kind: RevisionKind },
    Action { code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectFailure {
    #[serde(flatten)]
    pub effect: SideEffect,
    pub message: String,
}

/// What a committed transition did, and which post-commit steps failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionReceipt {
    pub incident_id: Uuid,
    pub transition_code: String,
    pub from_state: String,
    pub to_state: String,
    pub committed_at: DateTime<Utc>,
    /// `None` when the history write failed.
    pub history_id: Option<Uuid>,
    /// Numbers of the revisions that were written.
    pub revisions: Vec<i64>,
    pub changes: Vec<FieldChange>,
    pub actions: Vec<ActionOutcome>,
    pub warnings: Vec<String>,
    pub failures: Vec<SideEffectFailure>,
}

impl TransitionReceipt {
    /// Every post-commit step succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TransitionExecutor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TransitionExecutor {
    instances: Arc<dyn InstanceStore>,
    dispatcher: Arc<dyn ActionDispatcher>,
    clock: Arc<dyn Clock>,
    recorder: RevisionRecorder,
    config: EngineConfig,
}

impl TransitionExecutor {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        dispatcher: Arc<dyn ActionDispatcher>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let recorder = RevisionRecorder::new(instances.clone(), clock.clone());
        Self {
            instances,
            dispatcher,
            clock,
            recorder,
            config,
        }
    }

    /// Commit a resolved transition.
    ///
    /// The work runs on its own task: once this future has been polled, the
    /// commit runs to completion even if the caller drops it.
    ///
    /// # Errors
    /// `Conflict` when the incident left the source state first (nothing was
    /// written), `PartialSuccess` when the state change committed but a
    /// history/revision write or a synchronous action failed.
    pub async fn execute(&self, resolved: ResolvedTransition) -> Result<TransitionReceipt, EngineError> {
        let this = self.clone();
        tokio::spawn(async move { this.commit(resolved).await })
            .await
            .map_err(|e| EngineError::Internal(format!("transition task failed: {e}")))?
    }

    #[instrument(skip(self, resolved), fields(incident_id = %resolved.incident_id, transition = %resolved.transition.code))]
    async fn commit(&self, resolved: ResolvedTransition) -> Result<TransitionReceipt, EngineError> {
        // ------------------------------------------------------------------
        // Re-check the source state against fresh data.
        // ------------------------------------------------------------------
        let before = self.instances.load_instance(resolved.incident_id).await?;
        if before.current_state_id != resolved.from_state.id {
            warn!("incident already left state '{}'", resolved.from_state.code);
            return Err(EngineError::Conflict {
                incident_id: resolved.incident_id,
                expected: resolved.from_state.id,
            });
        }

        // ------------------------------------------------------------------
        // Build and commit the state change.
        // ------------------------------------------------------------------
        let now = self.clock.now();
        let change = self.state_change(&resolved, now);

        let committed = self
            .instances
            .compare_and_set_state(resolved.incident_id, &change)
            .await?;
        if !committed {
            warn!("lost the race on state '{}'", resolved.from_state.code);
            return Err(EngineError::Conflict {
                incident_id: resolved.incident_id,
                expected: resolved.from_state.id,
            });
        }

        let mut after = before.clone();
        change.apply_to(&mut after);
        info!(
            "incident {} moved '{}' -> '{}'",
            resolved.incident_id, resolved.from_state.code, resolved.to_state.code
        );

        // ------------------------------------------------------------------
        // Everything below is post-commit and never undoes the state change.
        // ------------------------------------------------------------------
        let (status_changes, assignment_changes) = diff(&resolved, &before, &after);
        let mut receipt = TransitionReceipt {
            incident_id: resolved.incident_id,
            transition_code: resolved.transition.code.clone(),
            from_state: resolved.from_state.code.clone(),
            to_state: resolved.to_state.code.clone(),
            committed_at: now,
            history_id: None,
            revisions: Vec::new(),
            changes: status_changes
                .iter()
                .chain(assignment_changes.iter())
                .cloned()
                .collect(),
            actions: Vec::new(),
            warnings: resolved.warnings.clone(),
            failures: Vec::new(),
        };

        self.run_actions(&resolved, &after, &mut receipt).await;
        self.write_history(&resolved, now, &mut receipt).await;
        self.write_revisions(&resolved, status_changes, assignment_changes, &mut receipt)
            .await;

        if receipt.is_complete() {
            Ok(receipt)
        } else {
            error!(
                "transition committed with {} failed side effect(s)",
                receipt.failures.len()
            );
            Err(EngineError::PartialSuccess(Box::new(receipt)))
        }
    }

    fn state_change(&self, resolved: &ResolvedTransition, now: DateTime<Utc>) -> StateChange {
        let target = &resolved.to_state;
        let plan = &resolved.assignment;

        let (sla_deadline, sla_breached) = if target.is_terminal() {
            (DeadlineUpdate::Clear, None)
        } else {
            match deadline_for(target, now) {
                Some(deadline) => (DeadlineUpdate::Set(deadline), Some(false)),
                None => (DeadlineUpdate::Keep, None),
            }
        };

        let terminal_stamp = target.is_terminal().then_some(now);

        StateChange {
            expected_state_id: resolved.from_state.id,
            new_state_id: target.id,
            department_id: plan.department_id,
            assignee_id: plan.assignee_id,
            assignee_ids: plan.assignee_ids.clone(),
            sla_deadline,
            sla_breached,
            resolved_at: terminal_stamp,
            closed_at: terminal_stamp,
            updated_at: now,
        }
    }

    // -----------------------------------------------------------------------
    // Internal: actions
    // -----------------------------------------------------------------------

    async fn run_actions(
        &self,
        resolved: &ResolvedTransition,
        after: &Incident,
        receipt: &mut TransitionReceipt,
    ) {
        let context = ActionContext {
            incident_id: resolved.incident_id,
            workflow_id: resolved.workflow_id,
            transition_code: resolved.transition.code.clone(),
            from_state: resolved.from_state.code.clone(),
            to_state: resolved.to_state.code.clone(),
            actor_id: resolved.actor.user_id,
            incident: serde_json::to_value(after).unwrap_or_default(),
        };

        for action in resolved.transition.ordered_actions() {
            let invocation = ActionInvocation {
                code: action.code.clone(),
                kind: action.kind,
                config: action.config.clone(),
                context: context.clone(),
            };

            let mut outcome = ActionOutcome {
                code: action.code.clone(),
                kind: action.kind,
                execution_order: action.execution_order,
                synchronous: action.synchronous,
                status: ActionStatus::Dispatched,
                output: None,
                error: None,
            };

            if action.synchronous {
                match self.run_sync(&invocation).await {
                    Ok(output) => {
                        outcome.status = ActionStatus::Succeeded;
                        outcome.output = Some(output);
                    }
                    Err(e) => {
                        error!("synchronous action '{}' failed: {}", action.code, e);
                        outcome.status = ActionStatus::Failed;
                        outcome.error = Some(e.to_string());
                        receipt.failures.push(SideEffectFailure {
                            effect: SideEffect::Action { code: action.code.clone() },
                            message: e.to_string(),
                        });
                    }
                }
            } else if let Err(e) = self.dispatcher.dispatch(invocation) {
                // The dispatcher owns retries for queued actions; a refused
                // hand-off is logged but does not make the transition partial.
                warn!("queued action '{}' was not accepted: {}", action.code, e);
                outcome.status = ActionStatus::Failed;
                outcome.error = Some(e.to_string());
                receipt
                    .warnings
                    .push(format!("queued action '{}' was not accepted: {e}", action.code));
            }

            receipt.actions.push(outcome);
        }
    }

    async fn run_sync(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        let timeout = self.config.sync_action_timeout;
        match tokio::time::timeout(timeout, self.dispatcher.run(invocation)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::TimedOut(timeout)),
        }
    }

    // -----------------------------------------------------------------------
    // Internal: audit rows
    // -----------------------------------------------------------------------

    async fn write_history(
        &self,
        resolved: &ResolvedTransition,
        now: DateTime<Utc>,
        receipt: &mut TransitionReceipt,
    ) {
        let row = IncidentTransitionHistory {
            id: Uuid::new_v4(),
            incident_id: resolved.incident_id,
            transition_id: resolved.transition.id,
            from_state_id: resolved.from_state.id,
            to_state_id: resolved.to_state.id,
            actor_id: resolved.actor.user_id,
            comment: resolved.comment.clone(),
            attachment_ids: resolved.attachment_ids.clone(),
            feedback: resolved.feedback.clone(),
            changes: receipt.changes.clone(),
            action_results: receipt.actions.clone(),
            created_at: now,
        };

        match self.instances.append_history(&row).await {
            Ok(()) => receipt.history_id = Some(row.id),
            Err(e) => {
                error!("history write failed: {}", e);
                receipt.failures.push(SideEffectFailure {
                    effect: SideEffect::History,
                    message: e.to_string(),
                });
            }
        }
    }

    async fn write_revisions(
        &self,
        resolved: &ResolvedTransition,
        status_changes: Vec<FieldChange>,
        assignment_changes: Vec<FieldChange>,
        receipt: &mut TransitionReceipt,
    ) {
        let mut pending = vec![(
            RevisionKind::StatusChanged,
            format!(
                "Status changed from {} to {}",
                resolved.from_state.name, resolved.to_state.name
            ),
            status_changes,
        )];
        if !assignment_changes.is_empty() {
            pending.push((
                RevisionKind::AssigneeChanged,
                format!("Assignment changed by transition {}", resolved.transition.name),
                assignment_changes,
            ));
        }

        for (kind, description, changes) in pending {
            match self
                .recorder
                .record(resolved.incident_id, kind, description, resolved.actor.user_id, changes)
                .await
            {
                Ok(revision) => receipt.revisions.push(revision.revision_number),
                Err(e) => {
                    error!("{} revision write failed: {}", kind, e);
                    receipt.failures.push(SideEffectFailure {
                        effect: SideEffect::Revision { kind },
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

/// Field-level diff of a committed transition, split into status-related
/// and assignment-related changes.
fn diff(
    resolved: &ResolvedTransition,
    before: &Incident,
    after: &Incident,
) -> (Vec<FieldChange>, Vec<FieldChange>) {
    let mut status = vec![FieldChange::new(
        "current_state",
        &resolved.from_state.code,
        &resolved.to_state.code,
    )];
    if before.sla_deadline != after.sla_deadline {
        status.push(FieldChange::new("sla_deadline", before.sla_deadline, after.sla_deadline));
    }
    if before.sla_breached != after.sla_breached {
        status.push(FieldChange::new("sla_breached", before.sla_breached, after.sla_breached));
    }
    if before.resolved_at != after.resolved_at {
        status.push(FieldChange::new("resolved_at", before.resolved_at, after.resolved_at));
    }
    if before.closed_at != after.closed_at {
        status.push(FieldChange::new("closed_at", before.closed_at, after.closed_at));
    }

    let mut assignment = Vec::new();
    if before.department_id != after.department_id {
        assignment.push(FieldChange::new("department_id", before.department_id, after.department_id));
    }
    if before.assignee_id != after.assignee_id {
        assignment.push(FieldChange::new("assignee_id", before.assignee_id, after.assignee_id));
    }
    if before.assignee_ids != after.assignee_ids {
        assignment.push(FieldChange::new("assignee_ids", &before.assignee_ids, &after.assignee_ids));
    }

    (status, assignment)
}
