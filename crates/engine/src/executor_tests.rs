//! End-to-end tests for the transition engine.
//!
//! Everything runs against `InMemoryStore`, which gives the same atomicity
//! guarantees as the Postgres adapter (compare-and-set on the state, atomic
//! revision allocation, single-step breach sweep), with a `ManualClock` for
//! SLA timing. No database is required.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use actions::mock::MockHandler;
use actions::{
    ActionDispatcher, ActionError, ActionInvocation, ActionKind, DispatchConfig, HandlerRegistry,
    RegistryDispatcher,
};

use crate::hierarchy::Hierarchy;
use crate::{
    ActionStatus, Actor, AssignmentDimension, Clock, Collaborators, DeleteMode, DepartmentAssignment,
    EngineConfig, EngineError, FieldExpectation, GraphError, Incident, IncidentEngine, InMemoryStore,
    InstanceStore, ManualClock, NewIncident, RecordKind, RequirementKind, RevisionKind, SideEffect,
    SlaMonitorConfig, StateKind, TransitionAction, TransitionExecutor, TransitionRequest,
    TransitionRequirement, UserAssignment, Workflow, WorkflowGraph, WorkflowState, WorkflowStore,
    WorkflowTransition,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn roles(codes: &[&str]) -> BTreeSet<String> {
    codes.iter().map(|c| c.to_string()).collect()
}

fn agent() -> Actor {
    Actor::new(Uuid::new_v4(), &["agent"])
}

fn start(actor: Actor) -> TransitionRequest {
    TransitionRequest::new("start", actor).with_comment("investigating")
}

fn action(code: &str, kind: ActionKind, order: i32, synchronous: bool) -> TransitionAction {
    TransitionAction {
        code: code.into(),
        kind,
        execution_order: order,
        synchronous,
        config: json!({ "template": code }),
    }
}

struct Parts {
    workflow: Workflow,
    states: Vec<WorkflowState>,
    transitions: Vec<WorkflowTransition>,
}

impl Parts {
    fn state(&self, code: &str) -> Uuid {
        self.states.iter().find(|s| s.code == code).unwrap().id
    }

    fn transition(&mut self, code: &str) -> &mut WorkflowTransition {
        self.transitions.iter_mut().find(|t| t.code == code).unwrap()
    }

    fn build(self) -> WorkflowGraph {
        WorkflowGraph::new(self.workflow, self.states, self.transitions).expect("valid workflow")
    }
}

/// new(initial, 4h) --start--> in_progress(8h) --resolve--> resolved(terminal)
///
/// `start` needs a comment; both transitions are restricted to `agent`.
fn support_parts(code: &str) -> Parts {
    let workflow = Workflow::new(code, "Support");
    let new = WorkflowState::new(workflow.id, "new", "New", StateKind::Initial).with_sla_hours(4);
    let in_progress =
        WorkflowState::new(workflow.id, "in_progress", "In Progress", StateKind::Normal).with_sla_hours(8);
    let resolved = WorkflowState::new(workflow.id, "resolved", "Resolved", StateKind::Terminal);

    let mut start = WorkflowTransition::new(workflow.id, "start", "Start", new.id, in_progress.id);
    start.allowed_roles = roles(&["agent"]);
    start
        .requirements
        .push(TransitionRequirement::mandatory(RequirementKind::Comment));

    let mut resolve = WorkflowTransition::new(workflow.id, "resolve", "Resolve", in_progress.id, resolved.id);
    resolve.allowed_roles = roles(&["agent"]);

    Parts {
        states: vec![new, in_progress, resolved],
        transitions: vec![start, resolve],
        workflow,
    }
}

/// Records the code of every action it sees, optionally after a delay.
#[derive(Default)]
struct RecordingDispatcher {
    seen: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl RecordingDispatcher {
    fn slow(delay: Duration) -> Self {
        Self { seen: Mutex::new(Vec::new()), delay: Some(delay) }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn run(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().unwrap().push(invocation.code.clone());
        Ok(json!({ "ran": invocation.code }))
    }

    fn dispatch(&self, invocation: ActionInvocation) -> Result<(), ActionError> {
        self.seen.lock().unwrap().push(invocation.code.clone());
        Ok(())
    }
}

struct Harness {
    store: InMemoryStore,
    clock: Arc<ManualClock>,
    engine: IncidentEngine,
    executor: TransitionExecutor,
    workflow_id: Uuid,
    states: HashMap<String, Uuid>,
}

impl Harness {
    async fn new(parts: Parts) -> Self {
        Self::with(parts, Arc::new(RecordingDispatcher::default()), EngineConfig::default()).await
    }

    async fn with(parts: Parts, dispatcher: Arc<dyn ActionDispatcher>, config: EngineConfig) -> Self {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(start_time()));
        let shared = Arc::new(store.clone());

        let engine = IncidentEngine::new(
            Collaborators {
                workflows: shared.clone(),
                instances: shared.clone(),
                directory: shared.clone(),
                dispatcher: dispatcher.clone(),
                clock: clock.clone(),
            },
            config.clone(),
        );
        let executor = TransitionExecutor::new(shared, dispatcher, clock.clone(), config);

        let states = parts.states.iter().map(|s| (s.code.clone(), s.id)).collect();
        let graph = parts.build();
        let workflow_id = graph.id();
        engine.create_workflow(&graph).await.unwrap();

        Self { store, clock, engine, executor, workflow_id, states }
    }

    fn state(&self, code: &str) -> Uuid {
        self.states[code]
    }

    async fn open(&self) -> Incident {
        self.open_with(|_| {}).await
    }

    async fn open_with(&self, customise: impl FnOnce(&mut NewIncident)) -> Incident {
        let mut new = NewIncident::new(RecordKind::Incident, "VPN is down", Uuid::new_v4());
        new.workflow_id = Some(self.workflow_id);
        customise(&mut new);
        self.engine.open_incident(new).await.unwrap()
    }

    async fn reload(&self, incident_id: Uuid) -> Incident {
        self.engine.incident(incident_id).await.unwrap()
    }
}

// ============================================================
// Lifecycle
// ============================================================

#[tokio::test]
async fn start_needs_a_comment_then_commits_with_one_history_row_and_revision() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;
    assert_eq!(incident.current_state_id, h.state("new"));

    let err = h
        .engine
        .transition(incident.id, &TransitionRequest::new("start", agent()))
        .await
        .unwrap_err();
    match err {
        EngineError::RequirementsNotMet(violations) => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].requirement, "comment");
        }
        other => panic!("expected RequirementsNotMet, got {other:?}"),
    }
    assert_eq!(h.reload(incident.id).await.current_state_id, h.state("new"));

    let receipt = h.engine.transition(incident.id, &start(agent())).await.unwrap();
    assert_eq!(receipt.from_state, "new");
    assert_eq!(receipt.to_state, "in_progress");
    assert_eq!(receipt.revisions, vec![1]);
    assert!(receipt.history_id.is_some());

    assert_eq!(h.reload(incident.id).await.current_state_id, h.state("in_progress"));

    let history = h.engine.history(incident.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].comment.as_deref(), Some("investigating"));
    assert_eq!(history[0].from_state_id, h.state("new"));
    assert_eq!(history[0].to_state_id, h.state("in_progress"));

    let revisions = h.engine.revisions(incident.id).await.unwrap();
    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].kind, RevisionKind::StatusChanged);
    assert_eq!(revisions[0].revision_number, 1);
}

#[tokio::test]
async fn transition_must_start_at_current_state() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;

    let err = h
        .engine
        .transition(incident.id, &TransitionRequest::new("resolve", agent()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { ref transition, ref current_state }
            if transition == "resolve" && current_state == "new"
    ));
}

#[tokio::test]
async fn unknown_or_inactive_transitions_are_not_found() {
    let mut parts = support_parts("support");
    parts.transition("resolve").active = false;
    let h = Harness::new(parts).await;
    let incident = h.open().await;

    let err = h
        .engine
        .transition(incident.id, &TransitionRequest::new("escalate", agent()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "transition", .. }));

    h.engine.transition(incident.id, &start(agent())).await.unwrap();
    let err = h
        .engine
        .transition(incident.id, &TransitionRequest::new("resolve", agent()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "transition", .. }));
}

#[tokio::test]
async fn actor_without_an_allowed_role_is_forbidden() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;

    let viewer = Actor::new(Uuid::new_v4(), &["viewer"]);
    let err = h.engine.transition(incident.id, &start(viewer)).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { ref allowed_roles, .. } if allowed_roles == &vec!["agent".to_string()]));
}

#[tokio::test]
async fn inactive_workflow_cannot_open_incidents() {
    let mut parts = support_parts("support");
    parts.workflow.active = false;
    let h = Harness::new(parts).await;

    let mut new = NewIncident::new(RecordKind::Incident, "printer", Uuid::new_v4());
    new.workflow_id = Some(h.workflow_id);
    let err = h.engine.open_incident(new).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "workflow", .. }));
}

// ============================================================
// Requirements
// ============================================================

#[tokio::test]
async fn every_violated_mandatory_requirement_is_reported_at_once() {
    let mut parts = support_parts("support");
    {
        let start = parts.transition("start");
        start
            .requirements
            .push(TransitionRequirement::mandatory(RequirementKind::Attachment).with_message("attach the log"));
        start
            .requirements
            .push(TransitionRequirement::optional(RequirementKind::Feedback));
    }
    let h = Harness::new(parts).await;
    let incident = h.open().await;

    let err = h
        .engine
        .transition(incident.id, &TransitionRequest::new("start", agent()))
        .await
        .unwrap_err();
    let EngineError::RequirementsNotMet(violations) = err else {
        panic!("expected RequirementsNotMet");
    };
    let labels: Vec<&str> = violations.iter().map(|v| v.requirement.as_str()).collect();
    assert_eq!(labels, vec!["comment", "attachment"]);
    assert_eq!(violations[1].message, "attach the log");

    let request = start(agent()).with_attachments(vec![Uuid::new_v4()]);
    let receipt = h.engine.transition(incident.id, &request).await.unwrap();
    assert_eq!(receipt.warnings.len(), 1, "the optional feedback becomes a warning");

    let history = h.engine.history(incident.id).await.unwrap();
    assert_eq!(history[0].attachment_ids, request.attachment_ids);
}

#[tokio::test]
async fn field_value_requirement_reads_the_incident_custom_fields() {
    let mut parts = support_parts("support");
    parts
        .transition("start")
        .requirements
        .push(TransitionRequirement::mandatory(RequirementKind::FieldValue {
            field: "impact".into(),
            expect: FieldExpectation::OneOf { values: vec![json!("high"), json!("low")] },
        }));
    let h = Harness::new(parts).await;

    let unset = h.open().await;
    let err = h.engine.transition(unset.id, &start(agent())).await.unwrap_err();
    assert!(matches!(err, EngineError::RequirementsNotMet(ref v) if v.len() == 1));

    let set = h.open_with(|n| n.custom_fields = json!({ "impact": "high" })).await;
    h.engine.transition(set.id, &start(agent())).await.unwrap();
}

// ============================================================
// Concurrency
// ============================================================

#[tokio::test]
async fn second_of_two_transitions_resolved_from_the_same_state_conflicts() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;

    let first = h.engine.resolve(incident.id, &start(agent())).await.unwrap();
    let second = h.engine.resolve(incident.id, &start(agent())).await.unwrap();

    h.executor.execute(first).await.unwrap();
    let err = h.executor.execute(second).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, EngineError::Conflict { expected, .. } if expected == h.state("new")));

    assert_eq!(h.engine.history(incident.id).await.unwrap().len(), 1);
    assert_eq!(h.engine.revisions(incident.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_transitions_let_exactly_one_win() {
    let h = Harness::new(support_parts("support")).await;
    let incident_id = h.open().await.id;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let request = start(agent());
        tasks.push(tokio::spawn(async move { engine.transition(incident_id, &request).await }));
    }

    let mut wins = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::Conflict { .. }) | Err(EngineError::InvalidTransition { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(h.engine.history(incident_id).await.unwrap().len(), 1);
    let numbers: Vec<i64> = h
        .engine
        .revisions(incident_id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.revision_number)
        .collect();
    assert_eq!(numbers, vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_revisions_stay_gapless_per_incident() {
    let h = Harness::new(support_parts("support")).await;
    let a = h.open().await;
    let b = h.open().await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        for incident_id in [a.id, b.id] {
            let recorder = h.engine.recorder().clone();
            tasks.push(tokio::spawn(async move {
                recorder
                    .record(incident_id, RevisionKind::CommentAdded, format!("comment {i}"), Uuid::new_v4(), Vec::new())
                    .await
            }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for incident_id in [a.id, b.id] {
        let numbers: Vec<i64> = h
            .engine
            .revisions(incident_id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.revision_number)
            .collect();
        assert_eq!(numbers, (1..=20).collect::<Vec<i64>>());
    }
}

#[tokio::test]
async fn dropped_caller_does_not_interrupt_a_started_commit() {
    let mut parts = support_parts("support");
    parts
        .transition("start")
        .actions
        .push(action("notify", ActionKind::Email, 1, true));
    let dispatcher = Arc::new(RecordingDispatcher::slow(Duration::from_millis(200)));
    let h = Harness::with(parts, dispatcher.clone(), EngineConfig::default()).await;
    let incident = h.open().await;

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        h.engine.transition(incident.id, &start(agent())),
    )
    .await;
    assert!(cancelled.is_err(), "caller gave up before the action finished");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.reload(incident.id).await.current_state_id, h.state("in_progress"));
    assert_eq!(dispatcher.seen(), vec!["notify".to_string()]);
    assert_eq!(h.engine.history(incident.id).await.unwrap().len(), 1);
}

// ============================================================
// Assignment
// ============================================================

struct Directory {
    network: Uuid,
    wifi: Uuid,
    hardware: Uuid,
    netops: Uuid,
    desk: Uuid,
}

fn directory(store: &InMemoryStore) -> Directory {
    let network = store.add_node(Hierarchy::Classifications, "Network", None).unwrap();
    let wifi = store.add_node(Hierarchy::Classifications, "WiFi", Some(network.id)).unwrap();
    let hardware = store.add_node(Hierarchy::Classifications, "Hardware", None).unwrap();
    let netops = store.add_node(Hierarchy::Departments, "NetOps", None).unwrap();
    let desk = store.add_node(Hierarchy::Departments, "Service Desk", None).unwrap();

    store.cover(netops.id, network.id, None);
    store.cover(desk.id, wifi.id, None);

    Directory {
        network: network.id,
        wifi: wifi.id,
        hardware: hardware.id,
        netops: netops.id,
        desk: desk.id,
    }
}

#[tokio::test]
async fn department_auto_detect_handles_none_one_and_many() {
    let mut parts = support_parts("support");
    parts.transition("start").department = DepartmentAssignment::AutoDetect;
    let h = Harness::new(parts).await;
    let dir = directory(&h.store);

    // No department covers hardware: left unassigned, with a warning.
    let unmatched = h.open_with(|n| n.classification_id = Some(dir.hardware)).await;
    let receipt = h.engine.transition(unmatched.id, &start(agent())).await.unwrap();
    assert_eq!(h.reload(unmatched.id).await.department_id, None);
    assert!(receipt.warnings.iter().any(|w| w.contains("department")));
    assert_eq!(receipt.revisions, vec![1]);

    // Only NetOps covers the network root.
    let single = h.open_with(|n| n.classification_id = Some(dir.network)).await;
    let receipt = h.engine.transition(single.id, &start(agent())).await.unwrap();
    assert_eq!(h.reload(single.id).await.department_id, Some(dir.netops));
    assert_eq!(receipt.revisions, vec![1, 2]);
    let kinds: Vec<RevisionKind> = h
        .engine
        .revisions(single.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds, vec![RevisionKind::StatusChanged, RevisionKind::AssigneeChanged]);

    // WiFi is covered by NetOps (through its parent) and the Service Desk.
    let ambiguous = h.open_with(|n| n.classification_id = Some(dir.wifi)).await;
    let err = h.engine.transition(ambiguous.id, &start(agent())).await.unwrap_err();
    match err {
        EngineError::AmbiguousAssignment { dimension, candidates } => {
            assert_eq!(dimension, AssignmentDimension::Department);
            let candidates: BTreeSet<Uuid> = candidates.into_iter().collect();
            assert_eq!(candidates, BTreeSet::from([dir.netops, dir.desk]));
        }
        other => panic!("expected AmbiguousAssignment, got {other:?}"),
    }
    assert_eq!(h.reload(ambiguous.id).await.current_state_id, h.state("new"));

    // An explicit choice among the candidates resolves it.
    let request = start(agent()).with_department(dir.desk);
    h.engine.transition(ambiguous.id, &request).await.unwrap();
    assert_eq!(h.reload(ambiguous.id).await.department_id, Some(dir.desk));
}

#[tokio::test]
async fn broadcast_assignment_fans_out_to_every_match() {
    let h = Harness::new(support_parts("placeholder")).await;
    let dir = directory(&h.store);
    let ana = h.store.add_user("ana", Some(dir.netops), &["agent"]);
    let bo = h.store.add_user("bo", Some(dir.netops), &["agent"]);
    h.store.add_user("cy", Some(dir.desk), &["agent"]);

    let mut parts = support_parts("broadcast");
    {
        let start = parts.transition("start");
        start.department = DepartmentAssignment::Fixed { department_id: dir.netops };
        start.user = UserAssignment::AutoDetect { role: "agent".into(), assign_all: true };
    }
    let graph = parts.build();
    h.engine.create_workflow(&graph).await.unwrap();

    let mut new = NewIncident::new(RecordKind::Incident, "switch down", Uuid::new_v4());
    new.workflow_id = Some(graph.id());
    let incident = h.engine.open_incident(new).await.unwrap();

    h.engine.transition(incident.id, &start(agent())).await.unwrap();
    let after = h.reload(incident.id).await;
    assert_eq!(after.department_id, Some(dir.netops));
    assert_eq!(after.assignee_ids, vec![ana, bo]);
}

#[tokio::test]
async fn single_user_auto_detect_with_two_matches_is_ambiguous() {
    let h = Harness::new(support_parts("placeholder")).await;
    let dir = directory(&h.store);
    let ana = h.store.add_user("ana", Some(dir.netops), &["agent"]);
    let bo = h.store.add_user("bo", Some(dir.netops), &["agent"]);

    let mut parts = support_parts("single");
    parts.transition("start").user = UserAssignment::AutoDetect { role: "agent".into(), assign_all: false };
    let graph = parts.build();
    h.engine.create_workflow(&graph).await.unwrap();

    let mut new = NewIncident::new(RecordKind::Incident, "switch down", Uuid::new_v4());
    new.workflow_id = Some(graph.id());
    new.department_id = Some(dir.netops);
    let incident = h.engine.open_incident(new).await.unwrap();

    let err = h.engine.transition(incident.id, &start(agent())).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::AmbiguousAssignment { dimension: AssignmentDimension::User, ref candidates }
            if candidates == &vec![ana, bo]
    ));

    h.engine
        .transition(incident.id, &start(agent()).with_assignee(bo))
        .await
        .unwrap();
    assert_eq!(h.reload(incident.id).await.assignee_id, Some(bo));
}

// ============================================================
// SLA
// ============================================================

#[tokio::test]
async fn sla_deadline_is_set_on_open_and_breached_exactly_once() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;
    assert_eq!(incident.created_at, start_time());
    assert_eq!(incident.sla_deadline, Some(start_time() + chrono::Duration::hours(4)));

    let monitor = h.engine.sla_monitor(SlaMonitorConfig::default());

    h.clock.advance(chrono::Duration::hours(3));
    assert!(monitor.sweep().await.unwrap().breached.is_empty());

    h.clock.advance(chrono::Duration::hours(2));
    assert_eq!(monitor.sweep().await.unwrap().breached, vec![incident.id]);
    assert!(h.reload(incident.id).await.sla_breached);

    h.clock.advance(chrono::Duration::hours(2));
    assert!(monitor.sweep().await.unwrap().breached.is_empty(), "sweeps are idempotent");
}

#[tokio::test]
async fn entering_a_state_with_its_own_budget_restarts_the_clock() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;
    let monitor = h.engine.sla_monitor(SlaMonitorConfig::default());

    h.clock.advance(chrono::Duration::hours(5));
    monitor.sweep().await.unwrap();
    assert!(h.reload(incident.id).await.sla_breached);

    h.engine.transition(incident.id, &start(agent())).await.unwrap();
    let after = h.reload(incident.id).await;
    assert_eq!(after.sla_deadline, Some(h.clock.now() + chrono::Duration::hours(8)));
    assert!(!after.sla_breached);
}

#[tokio::test]
async fn terminal_state_stops_sla_tracking_for_good() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;
    let monitor = h.engine.sla_monitor(SlaMonitorConfig::default());

    h.engine.transition(incident.id, &start(agent())).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(30));
    h.engine
        .transition(incident.id, &TransitionRequest::new("resolve", agent()))
        .await
        .unwrap();

    let resolved = h.reload(incident.id).await;
    assert_eq!(resolved.sla_deadline, None);
    assert_eq!(resolved.resolved_at, Some(h.clock.now()));
    assert_eq!(resolved.closed_at, Some(h.clock.now()));

    h.clock.advance(chrono::Duration::hours(500));
    assert!(monitor.sweep().await.unwrap().breached.is_empty());
    assert!(!h.reload(incident.id).await.sla_breached);
}

#[tokio::test]
async fn sweep_skips_terminal_incidents_even_with_a_stale_deadline() {
    let h = Harness::new(support_parts("support")).await;
    let mut incident = h.open().await;
    incident.id = Uuid::new_v4();
    incident.current_state_id = h.state("resolved");
    incident.sla_deadline = Some(start_time() - chrono::Duration::hours(1));
    h.store.insert_instance(&incident).await.unwrap();

    let monitor = h.engine.sla_monitor(SlaMonitorConfig::default());
    let report = monitor.sweep().await.unwrap();
    assert!(!report.breached.contains(&incident.id));
}

#[tokio::test]
async fn monitor_loop_stops_on_shutdown() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;
    h.clock.advance(chrono::Duration::hours(5));

    let monitor = h.engine.sla_monitor(SlaMonitorConfig { interval: Duration::from_millis(10) });
    monitor.run(tokio::time::sleep(Duration::from_millis(50))).await;

    assert!(h.reload(incident.id).await.sla_breached);
}

// ============================================================
// Actions and partial success
// ============================================================

#[tokio::test]
async fn actions_run_in_ascending_order_after_commit() {
    let mut parts = support_parts("support");
    {
        let start = parts.transition("start");
        start.actions.push(action("third", ActionKind::Webhook, 30, false));
        start.actions.push(action("first", ActionKind::Email, 10, true));
        start.actions.push(action("second", ActionKind::Notification, 20, false));
    }
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let h = Harness::with(parts, dispatcher.clone(), EngineConfig::default()).await;
    let incident = h.open().await;

    let receipt = h.engine.transition(incident.id, &start(agent())).await.unwrap();

    assert_eq!(dispatcher.seen(), vec!["first", "second", "third"]);
    let statuses: Vec<ActionStatus> = receipt.actions.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![ActionStatus::Succeeded, ActionStatus::Dispatched, ActionStatus::Dispatched]
    );
    assert_eq!(receipt.actions[0].output, Some(json!({ "ran": "first" })));

    let history = h.engine.history(incident.id).await.unwrap();
    assert_eq!(history[0].action_results.len(), 3);
}

#[tokio::test]
async fn failing_synchronous_action_is_a_partial_success() {
    let mut parts = support_parts("support");
    {
        let start = parts.transition("start");
        start.actions.push(action("notify", ActionKind::Email, 1, true));
        start.actions.push(action("audit", ActionKind::Webhook, 2, true));
    }
    let webhook = Arc::new(MockHandler::returning(json!({ "status": 200 })));
    let mut registry: HandlerRegistry = HashMap::new();
    registry.insert(ActionKind::Email, Arc::new(MockHandler::failing_fatal("smtp relay refused")));
    registry.insert(ActionKind::Webhook, webhook.clone());
    let dispatcher = Arc::new(RegistryDispatcher::new(registry, DispatchConfig::default()));

    let h = Harness::with(parts, dispatcher, EngineConfig::default()).await;
    let incident = h.open().await;

    let err = h.engine.transition(incident.id, &start(agent())).await.unwrap_err();
    assert!(err.is_committed());
    let EngineError::PartialSuccess(receipt) = err else {
        panic!("expected PartialSuccess");
    };

    assert_eq!(receipt.failures.len(), 1);
    assert_eq!(receipt.failures[0].effect, SideEffect::Action { code: "notify".into() });
    assert_eq!(receipt.actions[0].status, ActionStatus::Failed);
    assert_eq!(receipt.actions[1].status, ActionStatus::Succeeded);
    assert_eq!(webhook.call_count(), 1, "later actions still run");
    assert_eq!(webhook.transition_codes(), vec!["start".to_string()]);

    // The state change stands and the audit trail is complete.
    assert_eq!(h.reload(incident.id).await.current_state_id, h.state("in_progress"));
    assert_eq!(h.engine.history(incident.id).await.unwrap().len(), 1);
    assert_eq!(receipt.revisions, vec![1]);
}

#[tokio::test]
async fn slow_synchronous_action_times_out_into_a_partial_success() {
    let mut parts = support_parts("support");
    parts
        .transition("start")
        .actions
        .push(action("slow", ActionKind::Webhook, 1, true));
    let config = EngineConfig {
        sync_action_timeout: Duration::from_millis(20),
        ..EngineConfig::default()
    };
    let h = Harness::with(parts, Arc::new(RecordingDispatcher::slow(Duration::from_secs(2))), config).await;
    let incident = h.open().await;

    let err = h.engine.transition(incident.id, &start(agent())).await.unwrap_err();
    let EngineError::PartialSuccess(receipt) = err else {
        panic!("expected PartialSuccess");
    };
    assert!(receipt.failures[0].message.contains("timed out"));
    assert_eq!(h.reload(incident.id).await.current_state_id, h.state("in_progress"));
}

#[tokio::test]
async fn queued_action_without_a_handler_is_only_a_warning() {
    let mut parts = support_parts("support");
    parts
        .transition("start")
        .actions
        .push(action("page", ActionKind::Notification, 1, false));
    let dispatcher = Arc::new(RegistryDispatcher::new(HashMap::new(), DispatchConfig::default()));
    let h = Harness::with(parts, dispatcher, EngineConfig::default()).await;
    let incident = h.open().await;

    let receipt = h.engine.transition(incident.id, &start(agent())).await.unwrap();
    assert_eq!(receipt.actions[0].status, ActionStatus::Failed);
    assert!(receipt.warnings.iter().any(|w| w.contains("page")));
}

#[tokio::test]
async fn failed_audit_writes_are_reported_but_keep_the_state_change() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;

    h.store.fail_history_writes(true);
    let err = h.engine.transition(incident.id, &start(agent())).await.unwrap_err();
    let EngineError::PartialSuccess(receipt) = err else {
        panic!("expected PartialSuccess");
    };
    assert_eq!(receipt.failures[0].effect, SideEffect::History);
    assert_eq!(receipt.history_id, None);
    assert_eq!(receipt.revisions, vec![1], "the revision is still written");
    assert_eq!(h.reload(incident.id).await.current_state_id, h.state("in_progress"));

    h.store.fail_history_writes(false);
    h.store.fail_revision_writes(true);
    let err = h
        .engine
        .transition(incident.id, &TransitionRequest::new("resolve", agent()))
        .await
        .unwrap_err();
    let EngineError::PartialSuccess(receipt) = err else {
        panic!("expected PartialSuccess");
    };
    assert_eq!(
        receipt.failures[0].effect,
        SideEffect::Revision { kind: RevisionKind::StatusChanged }
    );
    assert_eq!(h.reload(incident.id).await.current_state_id, h.state("resolved"));
    assert_eq!(h.engine.history(incident.id).await.unwrap().len(), 1);
}

// ============================================================
// Preview
// ============================================================

#[tokio::test]
async fn preview_lists_visible_transitions_with_reasons() {
    let mut parts = support_parts("support");
    let in_progress = parts.state("in_progress");
    let new = parts.state("new");
    let resolved = parts.state("resolved");
    parts
        .states
        .iter_mut()
        .find(|s| s.id == in_progress)
        .unwrap()
        .visible_to = roles(&["agent"]);
    let mut cancel = WorkflowTransition::new(parts.workflow.id, "cancel", "Cancel", new, resolved);
    cancel.allowed_roles = roles(&["lead"]);
    parts.transitions.push(cancel);
    let h = Harness::new(parts).await;
    let incident = h.open().await;

    let for_agent = h.engine.available_transitions(incident.id, &agent()).await.unwrap();
    let start = for_agent.iter().find(|t| t.code == "start").unwrap();
    assert!(start.can_execute);
    assert_eq!(start.reason.as_deref(), Some("needs comment"));
    let cancel = for_agent.iter().find(|t| t.code == "cancel").unwrap();
    assert!(!cancel.can_execute);
    assert!(cancel.reason.as_deref().unwrap().contains("lead"));

    let viewer = Actor::new(Uuid::new_v4(), &["viewer"]);
    let for_viewer = h.engine.available_transitions(incident.id, &viewer).await.unwrap();
    let codes: Vec<&str> = for_viewer.iter().map(|t| t.code.as_str()).collect();
    assert_eq!(codes, vec!["cancel"], "in_progress is hidden from viewers");
}

// ============================================================
// Workflow design operations
// ============================================================

#[tokio::test]
async fn soft_and_hard_delete_cascade_to_the_same_rows() {
    let h = Harness::new(support_parts("soft")).await;
    let soft = h.workflow_id;
    let hard_graph = support_parts("hard").build();
    let hard = hard_graph.id();
    h.engine.create_workflow(&hard_graph).await.unwrap();

    h.engine.delete_workflow(soft, DeleteMode::Soft).await.unwrap();
    h.engine.delete_workflow(hard, DeleteMode::Hard).await.unwrap();

    let soft_counts = h.store.member_counts(soft);
    assert_eq!((soft_counts.live_states, soft_counts.live_transitions), (0, 0));
    assert_eq!((soft_counts.deleted_states, soft_counts.deleted_transitions), (3, 2));
    assert_eq!(h.store.member_counts(hard), Default::default());

    for id in [soft, hard] {
        assert!(matches!(h.engine.workflow(id).await, Err(EngineError::NotFound { entity: "workflow", .. })));
        assert!(matches!(
            h.engine.delete_workflow(id, DeleteMode::Soft).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    // A soft-deleted code can be reused.
    h.engine.create_workflow(&support_parts("soft").build()).await.unwrap();
}

#[tokio::test]
async fn workflow_with_incidents_cannot_be_deleted() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;

    for mode in [DeleteMode::Soft, DeleteMode::Hard] {
        let err = h.engine.delete_workflow(h.workflow_id, mode).await.unwrap_err();
        assert!(
            matches!(err, EngineError::WorkflowInUse { workflow_id, incidents: 1 } if workflow_id == h.workflow_id),
            "{mode:?}: {err}"
        );
    }
    assert_eq!(h.store.member_counts(h.workflow_id).live_states, 3);
    assert_eq!(h.reload(incident.id).await.workflow_id, h.workflow_id);

    // Once the incident is resolved only a soft delete is allowed.
    h.engine.transition(incident.id, &start(agent())).await.unwrap();
    h.engine
        .transition(incident.id, &TransitionRequest::new("resolve", agent()))
        .await
        .unwrap();
    assert!(matches!(
        h.engine.delete_workflow(h.workflow_id, DeleteMode::Hard).await,
        Err(EngineError::WorkflowInUse { incidents: 1, .. })
    ));
    h.engine.delete_workflow(h.workflow_id, DeleteMode::Soft).await.unwrap();
    assert_eq!(h.reload(incident.id).await.current_state_id, h.state("resolved"));
}

#[tokio::test]
async fn engines_sharing_a_store_see_each_others_workflow_changes() {
    let h = Harness::new(support_parts("support")).await;
    let shared = Arc::new(h.store.clone());
    let other = IncidentEngine::new(
        Collaborators {
            workflows: shared.clone(),
            instances: shared.clone(),
            directory: shared,
            dispatcher: Arc::new(RecordingDispatcher::default()),
            clock: h.clock.clone(),
        },
        EngineConfig::default(),
    );

    // Both caches hold the graph before it changes.
    let start_id = h.engine.workflow(h.workflow_id).await.unwrap().transition_by_code("start").unwrap().id;
    assert!(other.workflow(h.workflow_id).await.unwrap().transition(start_id).is_some());

    h.engine.set_transition_roles(start_id, roles(&["lead"])).await.unwrap();
    let incident = other.open_incident({
        let mut new = NewIncident::new(RecordKind::Incident, "printer jam", Uuid::new_v4());
        new.workflow_id = Some(h.workflow_id);
        new
    })
    .await
    .unwrap();
    assert!(matches!(
        other.transition(incident.id, &start(agent())).await,
        Err(EngineError::Forbidden { .. })
    ));

    let spare = support_parts("spare").build();
    let spare_id = spare.id();
    h.engine.create_workflow(&spare).await.unwrap();
    assert_eq!(other.workflow(spare_id).await.unwrap().id(), spare_id);
    h.engine.delete_workflow(spare_id, DeleteMode::Soft).await.unwrap();
    assert!(matches!(
        other.workflow(spare_id).await,
        Err(EngineError::NotFound { entity: "workflow", .. })
    ));
}

#[tokio::test]
async fn oversized_sla_budget_is_an_invalid_workflow() {
    let h = Harness::new(support_parts("support")).await;
    let mut doc = h.engine.export_workflow(h.workflow_id).await.unwrap();
    doc.code = "forever".into();
    doc.states[0].sla_hours = Some(u32::MAX);

    let err = h.engine.import_workflow(&doc).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidWorkflow(GraphError::SlaBudgetTooLarge { hours: u32::MAX, .. })
    ));
}

#[tokio::test]
async fn there_is_at_most_one_default_workflow() {
    let mut first = support_parts("first");
    first.workflow.is_default = true;
    let h = Harness::new(first).await;
    let first_id = h.workflow_id;

    // Warm the graph cache so the flag flip has to invalidate it.
    assert!(h.engine.workflow(first_id).await.unwrap().workflow().is_default);

    let mut second = support_parts("second");
    second.workflow.is_default = true;
    let second = second.build();
    let second_id = second.id();
    h.engine.create_workflow(&second).await.unwrap();

    assert!(!h.engine.workflow(first_id).await.unwrap().workflow().is_default);
    assert_eq!(h.store.find_default(RecordKind::Incident).await.unwrap(), Some(second_id));

    h.engine.set_default_workflow(first_id).await.unwrap();
    assert!(h.engine.workflow(first_id).await.unwrap().workflow().is_default);
    assert!(!h.engine.workflow(second_id).await.unwrap().workflow().is_default);

    // Opening without an explicit workflow uses the default.
    let incident = h
        .engine
        .open_incident(NewIncident::new(RecordKind::Incident, "no wifi", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(incident.workflow_id, first_id);
}

#[tokio::test]
async fn opening_checks_applicability_and_required_fields() {
    let mut parts = support_parts("support");
    parts.workflow.required_fields = vec!["asset_tag".into(), "phone".into()];
    let h = Harness::new(parts).await;

    let mut complaint = NewIncident::new(RecordKind::Complaint, "rude reply", Uuid::new_v4());
    complaint.workflow_id = Some(h.workflow_id);
    assert!(matches!(
        h.engine.open_incident(complaint).await,
        Err(EngineError::WorkflowNotApplicable { kind: RecordKind::Complaint, .. })
    ));

    let no_default = NewIncident::new(RecordKind::Request, "new laptop", Uuid::new_v4());
    assert!(matches!(
        h.engine.open_incident(no_default).await,
        Err(EngineError::NotFound { entity: "default workflow", .. })
    ));

    let mut missing = NewIncident::new(RecordKind::Incident, "broken screen", Uuid::new_v4());
    missing.workflow_id = Some(h.workflow_id);
    missing.custom_fields = json!({ "asset_tag": "  " });
    let Err(EngineError::RequirementsNotMet(violations)) = h.engine.open_incident(missing).await else {
        panic!("expected RequirementsNotMet");
    };
    assert_eq!(violations.len(), 2);

    let incident = h
        .open_with(|n| n.custom_fields = json!({ "asset_tag": "LT-0042", "phone": "555-0100" }))
        .await;
    assert_eq!(incident.custom_fields["asset_tag"], "LT-0042");
}

#[tokio::test]
async fn role_sets_are_reconciled_not_replaced() {
    let h = Harness::new(support_parts("support")).await;
    let incident = h.open().await;
    let start_id = h.engine.workflow(h.workflow_id).await.unwrap().transition_by_code("start").unwrap().id;

    let diff = h
        .engine
        .set_transition_roles(start_id, roles(&["lead", "supervisor"]))
        .await
        .unwrap();
    assert_eq!(diff.added, vec!["lead".to_string(), "supervisor".to_string()]);
    assert_eq!(diff.removed, vec!["agent".to_string()]);

    let unchanged = h
        .engine
        .set_transition_roles(start_id, roles(&["lead", "supervisor"]))
        .await
        .unwrap();
    assert!(unchanged.is_empty());

    assert!(matches!(
        h.engine.transition(incident.id, &start(agent())).await,
        Err(EngineError::Forbidden { .. })
    ));
    let lead = Actor::new(Uuid::new_v4(), &["lead"]);
    h.engine.transition(incident.id, &start(lead)).await.unwrap();
}

#[tokio::test]
async fn exported_workflow_imports_as_an_isomorphic_copy() {
    let mut parts = support_parts("support");
    parts
        .transition("start")
        .actions
        .push(action("notify", ActionKind::Email, 1, false));
    let h = Harness::new(parts).await;

    let mut doc = h.engine.export_workflow(h.workflow_id).await.unwrap();
    doc.code = "support-copy".into();
    let copy_id = h.engine.import_workflow(&doc).await.unwrap();
    assert_ne!(copy_id, h.workflow_id);

    let original = h.engine.workflow(h.workflow_id).await.unwrap();
    let copy = h.engine.workflow(copy_id).await.unwrap();
    for state in original.states() {
        assert_eq!(copy.state_by_code(&state.code).unwrap().kind, state.kind);
    }
    let copied_start = copy.transition_by_code("start").unwrap();
    assert_eq!(copy.state(copied_start.from_state_id).unwrap().code, "new");
    assert_eq!(copy.state(copied_start.to_state_id).unwrap().code, "in_progress");
    assert_eq!(copied_start.requirements, original.transition_by_code("start").unwrap().requirements);
    assert_eq!(copied_start.actions, original.transition_by_code("start").unwrap().actions);
}
