//! Revision recorder: append one numbered entry to an incident's change log.
//!
//! Numbers are allocated by the instance store in the same atomic step that
//! persists the row, so they never repeat or skip for one incident.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::incident::{FieldChange, IncidentRevision, NewRevision, RevisionKind};
use crate::store::InstanceStore;
use crate::EngineError;

#[derive(Clone)]
pub struct RevisionRecorder {
    instances: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
}

impl RevisionRecorder {
    pub fn new(instances: Arc<dyn InstanceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { instances, clock }
    }

    /// Append a revision with the next number for `incident_id`.
    ///
    /// Safe to call several times for one user action.
    #[instrument(skip(self, description, changes), fields(kind = %kind))]
    pub async fn record(
        &self,
        incident_id: Uuid,
        kind: RevisionKind,
        description: impl Into<String>,
        actor_id: Uuid,
        changes: Vec<FieldChange>,
    ) -> Result<IncidentRevision, EngineError> {
        self.append(incident_id, None, kind, description.into(), actor_id, changes)
            .await
    }

    /// Append a revision only if `revision_number` is the next number.
    ///
    /// # Errors
    /// `Storage(RevisionOutOfSequence)` when another writer got there first
    /// or the number would leave a gap.
    pub async fn record_numbered(
        &self,
        incident_id: Uuid,
        revision_number: i64,
        kind: RevisionKind,
        description: impl Into<String>,
        actor_id: Uuid,
        changes: Vec<FieldChange>,
    ) -> Result<IncidentRevision, EngineError> {
        self.append(
            incident_id,
            Some(revision_number),
            kind,
            description.into(),
            actor_id,
            changes,
        )
        .await
    }

    async fn append(
        &self,
        incident_id: Uuid,
        revision_number: Option<i64>,
        kind: RevisionKind,
        description: String,
        actor_id: Uuid,
        changes: Vec<FieldChange>,
    ) -> Result<IncidentRevision, EngineError> {
        let revision = self
            .instances
            .append_revision(NewRevision {
                incident_id,
                revision_number,
                kind,
                description,
                actor_id,
                changes,
                created_at: self.clock.now(),
            })
            .await?;

        debug!(
            "incident {} revision {} ({})",
            incident_id, revision.revision_number, revision.kind
        );
        Ok(revision)
    }
}
