//! `IncidentEngine`: the façade request-handling code talks to.
//!
//! It wires the resolver, executor, revision recorder and SLA monitor to one
//! set of collaborators and adds the operations that sit around a
//! transition: opening incidents, previewing transitions, and design-time
//! workflow changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use actions::ActionDispatcher;

use crate::cache::CachedWorkflowStore;
use crate::clock::Clock;
use crate::executor::{EngineConfig, TransitionExecutor, TransitionReceipt};
use crate::graph::WorkflowGraph;
use crate::incident::{Incident, IncidentRevision, IncidentTransitionHistory, NewIncident};
use crate::interchange::{self, WorkflowExport};
use crate::models::RoleCode;
use crate::reconcile::{reconcile, SetDiff};
use crate::resolver::{
    field_present, Actor, AvailableTransition, RequirementViolation, ResolvedTransition,
    TransitionRequest, TransitionResolver,
};
use crate::revision::RevisionRecorder;
use crate::sla::{deadline_for, SlaMonitor, SlaMonitorConfig};
use crate::store::{DeleteMode, Directory, InstanceStore, WorkflowStore};
use crate::EngineError;

/// Everything the engine is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub workflows: Arc<dyn WorkflowStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub directory: Arc<dyn Directory>,
    pub dispatcher: Arc<dyn ActionDispatcher>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct IncidentEngine {
    workflows: Arc<dyn WorkflowStore>,
    instances: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    resolver: TransitionResolver,
    executor: TransitionExecutor,
    recorder: RevisionRecorder,
}

impl IncidentEngine {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        let Collaborators {
            workflows,
            instances,
            directory,
            dispatcher,
            clock,
        } = collaborators;

        let workflows: Arc<dyn WorkflowStore> = if config.cache_graphs {
            Arc::new(CachedWorkflowStore::new(workflows))
        } else {
            workflows
        };

        Self {
            resolver: TransitionResolver::new(workflows.clone(), directory),
            executor: TransitionExecutor::new(instances.clone(), dispatcher, clock.clone(), config),
            recorder: RevisionRecorder::new(instances.clone(), clock.clone()),
            workflows,
            instances,
            clock,
        }
    }

    // -----------------------------------------------------------------------
    // Workflow design
    // -----------------------------------------------------------------------

    /// Persist a validated graph.
    #[instrument(skip(self, graph), fields(workflow = %graph.workflow().code))]
    pub async fn create_workflow(&self, graph: &WorkflowGraph) -> Result<(), EngineError> {
        self.workflows.save_graph(graph).await?;
        info!("workflow '{}' saved", graph.workflow().code);
        Ok(())
    }

    /// Import an export document under fresh ids and persist it.
    pub async fn import_workflow(&self, doc: &WorkflowExport) -> Result<Uuid, EngineError> {
        let graph = interchange::import(doc, self.clock.now())?;
        self.create_workflow(&graph).await?;
        Ok(graph.id())
    }

    pub async fn export_workflow(&self, workflow_id: Uuid) -> Result<WorkflowExport, EngineError> {
        let graph = self.workflows.load_graph(workflow_id).await?;
        Ok(interchange::export(&graph))
    }

    pub async fn workflow(&self, workflow_id: Uuid) -> Result<Arc<WorkflowGraph>, EngineError> {
        Ok(self.workflows.load_graph(workflow_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn set_default_workflow(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        self.workflows.set_default(workflow_id).await?;
        Ok(())
    }

    /// Delete a workflow with its states and transitions. Soft and hard
    /// deletion cascade to the same rows. Fails with `WorkflowInUse` while
    /// incidents still depend on it.
    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, workflow_id: Uuid, mode: DeleteMode) -> Result<(), EngineError> {
        self.workflows
            .delete_workflow(workflow_id, mode, self.clock.now())
            .await?;
        info!("workflow {} deleted ({:?})", workflow_id, mode);
        Ok(())
    }

    /// Reconcile a transition's role set with `desired`, returning what was
    /// added and removed.
    #[instrument(skip(self, desired))]
    pub async fn set_transition_roles(
        &self,
        transition_id: Uuid,
        desired: BTreeSet<RoleCode>,
    ) -> Result<SetDiff<RoleCode>, EngineError> {
        let current = self.workflows.transition_roles(transition_id).await?;
        let diff = reconcile(&current, &desired);
        if !diff.is_empty() {
            self.workflows.apply_role_diff(transition_id, &diff).await?;
            info!("roles +{:?} -{:?}", diff.added, diff.removed);
        }
        Ok(diff)
    }

    // -----------------------------------------------------------------------
    // Incidents
    // -----------------------------------------------------------------------

    /// Open an incident in the initial state of its workflow.
    ///
    /// # Errors
    /// `NotFound` when no workflow is given and none is the default for the
    /// record kind (or it is inactive), `WorkflowNotApplicable` for a kind
    /// the workflow does not handle, `RequirementsNotMet` listing every
    /// missing required field.
    #[instrument(skip(self, new), fields(kind = %new.record_kind))]
    pub async fn open_incident(&self, new: NewIncident) -> Result<Incident, EngineError> {
        let workflow_id = match new.workflow_id {
            Some(id) => id,
            None => self
                .workflows
                .find_default(new.record_kind)
                .await?
                .ok_or_else(|| EngineError::NotFound {
                    entity: "default workflow",
                    id: new.record_kind.to_string(),
                })?,
        };

        let graph = self.workflows.load_graph(workflow_id).await?;
        let workflow = graph.workflow();
        if !workflow.active {
            return Err(EngineError::NotFound {
                entity: "workflow",
                id: workflow_id.to_string(),
            });
        }
        if !workflow.applies_to_kind(new.record_kind) {
            return Err(EngineError::WorkflowNotApplicable {
                workflow: workflow.code.clone(),
                kind: new.record_kind,
            });
        }

        let missing: Vec<RequirementViolation> = workflow
            .required_fields
            .iter()
            .filter(|field| !field_present(&new.custom_fields, field))
            .map(|field| RequirementViolation {
                requirement: format!("required field '{field}'"),
                message: format!("{field} is required"),
            })
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::RequirementsNotMet(missing));
        }

        let initial = graph.initial_state();
        let now = self.clock.now();
        let incident = Incident {
            id: Uuid::new_v4(),
            workflow_id,
            current_state_id: initial.id,
            record_kind: new.record_kind,
            title: new.title,
            classification_id: new.classification_id,
            location_id: new.location_id,
            department_id: new.department_id,
            reporter_id: new.reporter_id,
            assignee_id: new.assignee_id,
            assignee_ids: Vec::new(),
            due_date: new.due_date,
            sla_deadline: deadline_for(initial, now),
            sla_breached: false,
            custom_fields: new.custom_fields,
            resolved_at: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.instances.insert_instance(&incident).await?;
        info!("incident {} opened in '{}'", incident.id, initial.code);
        Ok(incident)
    }

    pub async fn incident(&self, incident_id: Uuid) -> Result<Incident, EngineError> {
        Ok(self.instances.load_instance(incident_id).await?)
    }

    /// Preview the transitions out of the incident's current state.
    pub async fn available_transitions(
        &self,
        incident_id: Uuid,
        actor: &Actor,
    ) -> Result<Vec<AvailableTransition>, EngineError> {
        let incident = self.instances.load_instance(incident_id).await?;
        self.resolver.preview(&incident, actor).await
    }

    /// Resolve a request without committing anything.
    pub async fn resolve(
        &self,
        incident_id: Uuid,
        request: &TransitionRequest,
    ) -> Result<ResolvedTransition, EngineError> {
        let incident = self.instances.load_instance(incident_id).await?;
        self.resolver.resolve(&incident, request).await
    }

    /// Resolve and commit one transition.
    ///
    /// # Errors
    /// Validation errors before anything is written, `Conflict` when another
    /// transition won the race, `PartialSuccess` when the state changed but a
    /// side effect failed.
    #[instrument(skip(self, request), fields(transition = %request.transition_code))]
    pub async fn transition(
        &self,
        incident_id: Uuid,
        request: &TransitionRequest,
    ) -> Result<TransitionReceipt, EngineError> {
        let incident = self.instances.load_instance(incident_id).await?;
        let graph = self.resolver.graph_for(&incident).await?;
        let resolved = self.resolver.resolve_with_graph(&graph, &incident, request).await?;
        self.executor.execute(resolved).await
    }

    pub async fn history(&self, incident_id: Uuid) -> Result<Vec<IncidentTransitionHistory>, EngineError> {
        Ok(self.instances.history(incident_id).await?)
    }

    pub async fn revisions(&self, incident_id: Uuid) -> Result<Vec<IncidentRevision>, EngineError> {
        Ok(self.instances.revisions(incident_id).await?)
    }

    /// Recorder for revisions outside transitions (comments, field edits…).
    pub fn recorder(&self) -> &RevisionRecorder {
        &self.recorder
    }

    pub fn sla_monitor(&self, config: SlaMonitorConfig) -> SlaMonitor {
        SlaMonitor::new(self.instances.clone(), self.clock.clone(), config)
    }
}
