//! SLA deadlines and the periodic breach sweep.
//!
//! A deadline is set when an incident enters a state with its own SLA budget
//! and cleared when it enters a terminal state. The sweep flips
//! `sla_breached` on expired, non-terminal incidents in one atomic store
//! call, so an incident that reaches a terminal state concurrently is never
//! flagged after the fact.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::WorkflowState;
use crate::store::InstanceStore;
use crate::EngineError;

/// Deadline for an incident entering `state` at `entered_at`, if the state
/// carries an SLA budget. Terminal states never have one, and a budget that
/// would overflow the calendar yields none rather than panicking.
pub fn deadline_for(state: &WorkflowState, entered_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if state.is_terminal() {
        return None;
    }
    state
        .sla_budget()
        .and_then(|budget| entered_at.checked_add_signed(budget))
}

#[derive(Debug, Clone)]
pub struct SlaMonitorConfig {
    /// Time between two sweeps.
    pub interval: Duration,
}

impl Default for SlaMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub swept_at: DateTime<Utc>,
    /// Incidents flagged by this sweep. Empty on a no-op sweep.
    pub breached: Vec<Uuid>,
}

/// Periodic breach detection. It only flags incidents; notifying anyone is
/// left to whoever polls the flag.
pub struct SlaMonitor {
    instances: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    config: SlaMonitorConfig,
}

impl SlaMonitor {
    pub fn new(instances: Arc<dyn InstanceStore>, clock: Arc<dyn Clock>, config: SlaMonitorConfig) -> Self {
        Self { instances, clock, config }
    }

    /// Run one sweep against the injected clock. Idempotent.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let now = self.clock.now();
        let breached = self.instances.mark_sla_breached(now).await?;
        if !breached.is_empty() {
            info!("{} incident(s) breached their SLA", breached.len());
        }
        Ok(SweepReport { swept_at: now, breached })
    }

    /// Sweep every `config.interval` until `shutdown` resolves. A failed
    /// sweep is logged and the loop carries on.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("SLA monitor started (interval {:?})", self.config.interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("SLA sweep failed: {}", e);
                    }
                }
            }
        }
        info!("SLA monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StateKind;

    #[test]
    fn deadline_is_entry_time_plus_budget() {
        let workflow_id = Uuid::new_v4();
        let triage = WorkflowState::new(workflow_id, "triage", "Triage", StateKind::Normal).with_sla_hours(4);
        let at = Utc::now();
        assert_eq!(deadline_for(&triage, at), Some(at + chrono::Duration::hours(4)));

        let waiting = WorkflowState::new(workflow_id, "waiting", "Waiting", StateKind::Normal);
        assert_eq!(deadline_for(&waiting, at), None);
    }

    #[test]
    fn terminal_states_have_no_deadline() {
        let closed = WorkflowState::new(Uuid::new_v4(), "closed", "Closed", StateKind::Terminal).with_sla_hours(8);
        assert_eq!(deadline_for(&closed, Utc::now()), None);
    }

    #[test]
    fn budget_past_the_calendar_yields_no_deadline() {
        let state = WorkflowState::new(Uuid::new_v4(), "parked", "Parked", StateKind::Normal)
            .with_sla_hours(u32::MAX);
        assert_eq!(deadline_for(&state, Utc::now()), None);
    }
}
