//! Read-through cache of workflow graphs.
//!
//! Graphs are read-mostly and shared as `Arc<WorkflowGraph>` snapshots, so a
//! transition in flight keeps the graph it loaded even if the entry is
//! invalidated under it. Each entry remembers the workflow's version stamp;
//! a hit is served only while the stored stamp still matches, so changes made
//! by another engine on the same store are picked up on the next load.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::graph::WorkflowGraph;
use crate::models::{RecordKind, RoleCode};
use crate::reconcile::SetDiff;
use crate::store::{DeleteMode, StoreError, WorkflowStore};

pub struct CachedWorkflowStore {
    inner: Arc<dyn WorkflowStore>,
    graphs: DashMap<Uuid, (i64, Arc<WorkflowGraph>)>,
}

impl CachedWorkflowStore {
    pub fn new(inner: Arc<dyn WorkflowStore>) -> Self {
        Self {
            inner,
            graphs: DashMap::new(),
        }
    }

    pub fn invalidate(&self, workflow_id: Uuid) {
        self.graphs.remove(&workflow_id);
    }

    pub fn clear(&self) {
        self.graphs.clear();
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

#[async_trait]
impl WorkflowStore for CachedWorkflowStore {
    async fn load_graph(&self, workflow_id: Uuid) -> Result<Arc<WorkflowGraph>, StoreError> {
        let version = match self.inner.workflow_version(workflow_id).await {
            Ok(version) => version,
            Err(e) => {
                self.invalidate(workflow_id);
                return Err(e);
            }
        };
        if let Some(entry) = self.graphs.get(&workflow_id) {
            let (cached, graph) = entry.value();
            if *cached == version {
                return Ok(graph.clone());
            }
            debug!("workflow {} moved from version {} to {}", workflow_id, cached, version);
        }

        // Stamp read before the graph: a write landing in between only
        // causes one extra reload.
        let graph = self.inner.load_graph(workflow_id).await?;
        debug!("cached graph for workflow {} at version {}", workflow_id, version);
        self.graphs.insert(workflow_id, (version, graph.clone()));
        Ok(graph)
    }

    async fn find_default(&self, kind: RecordKind) -> Result<Option<Uuid>, StoreError> {
        self.inner.find_default(kind).await
    }

    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<(), StoreError> {
        self.inner.save_graph(graph).await?;
        // A new default flips the flag on whichever graph held it before.
        if graph.workflow().is_default {
            self.clear();
        } else {
            self.invalidate(graph.id());
        }
        Ok(())
    }

    async fn set_default(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        self.inner.set_default(workflow_id).await?;
        self.clear();
        Ok(())
    }

    async fn workflow_version(&self, workflow_id: Uuid) -> Result<i64, StoreError> {
        self.inner.workflow_version(workflow_id).await
    }

    async fn delete_workflow(
        &self,
        workflow_id: Uuid,
        mode: DeleteMode,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.delete_workflow(workflow_id, mode, deleted_at).await?;
        self.invalidate(workflow_id);
        Ok(())
    }

    async fn transition_roles(&self, transition_id: Uuid) -> Result<BTreeSet<RoleCode>, StoreError> {
        self.inner.transition_roles(transition_id).await
    }

    async fn apply_role_diff(
        &self,
        transition_id: Uuid,
        diff: &SetDiff<RoleCode>,
    ) -> Result<(), StoreError> {
        self.inner.apply_role_diff(transition_id, diff).await?;
        // Only the transition id is known here.
        self.clear();
        Ok(())
    }
}
