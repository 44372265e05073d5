//! Incident, transition-history and revision persistence.
//!
//! The two concurrency-sensitive operations are expressed as single
//! statements or short row-locking transactions:
//! - `compare_and_set_state` is one conditional `UPDATE … WHERE current_state_id = $expected`.
//! - `append_revision` bumps `incidents.revision_count` (locking only that
//!   incident's row) and inserts the revision in the same transaction, so
//!   numbers never repeat and a failed insert never leaves a gap.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{IncidentRow, RevisionRow, StateChangeRow, TransitionHistoryRow},
};

const INCIDENT_COLUMNS: &str = r#"
    id, workflow_id, current_state_id, record_kind, title,
    classification_id, location_id, department_id, reporter_id,
    assignee_id, assignee_ids, due_date, sla_deadline, sla_breached,
    custom_fields, resolved_at, closed_at, created_at, updated_at
"#;

// ---------------------------------------------------------------------------
// incidents
// ---------------------------------------------------------------------------

pub async fn get_incident(pool: &PgPool, id: Uuid) -> Result<IncidentRow, DbError> {
    let row = sqlx::query_as::<_, IncidentRow>(&format!(
        "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

pub async fn insert_incident(pool: &PgPool, row: &IncidentRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO incidents (
            id, workflow_id, current_state_id, record_kind, title,
            classification_id, location_id, department_id, reporter_id,
            assignee_id, assignee_ids, due_date, sla_deadline, sla_breached,
            custom_fields, resolved_at, closed_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_id)
    .bind(row.current_state_id)
    .bind(&row.record_kind)
    .bind(&row.title)
    .bind(row.classification_id)
    .bind(row.location_id)
    .bind(row.department_id)
    .bind(row.reporter_id)
    .bind(row.assignee_id)
    .bind(&row.assignee_ids)
    .bind(row.due_date)
    .bind(row.sla_deadline)
    .bind(row.sla_breached)
    .bind(&row.custom_fields)
    .bind(row.resolved_at)
    .bind(row.closed_at)
    .bind(row.created_at)
    .bind(row.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Move an incident from `expected_state` to `new_state` and apply `change`
/// in the same statement.
///
/// Returns `false` (and changes nothing) when the incident is no longer in
/// `expected_state`, or `DbError::NotFound` when it does not exist at all.
pub async fn compare_and_set_state(
    pool: &PgPool,
    id: Uuid,
    expected_state: Uuid,
    new_state: Uuid,
    change: &StateChangeRow,
) -> Result<bool, DbError> {
    let (set_deadline, deadline) = match change.sla_deadline {
        Some(value) => (true, value),
        None => (false, None),
    };

    let result = sqlx::query(
        r#"
        UPDATE incidents SET
            current_state_id = $3,
            department_id    = COALESCE($4, department_id),
            assignee_id      = COALESCE($5, assignee_id),
            assignee_ids     = COALESCE($6, assignee_ids),
            sla_deadline     = CASE WHEN $7 THEN $8 ELSE sla_deadline END,
            sla_breached     = COALESCE($9, sla_breached),
            resolved_at      = COALESCE(resolved_at, $10),
            closed_at        = COALESCE($11, closed_at),
            updated_at       = $12
        WHERE id = $1 AND current_state_id = $2
        "#,
    )
    .bind(id)
    .bind(expected_state)
    .bind(new_state)
    .bind(change.department_id)
    .bind(change.assignee_id)
    .bind(&change.assignee_ids)
    .bind(set_deadline)
    .bind(deadline)
    .bind(change.sla_breached)
    .bind(change.resolved_at)
    .bind(change.closed_at)
    .bind(change.updated_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(true);
    }

    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM incidents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match exists {
        Some(_) => Ok(false),
        None => Err(DbError::NotFound),
    }
}

/// Mark every open, non-terminal incident whose deadline has passed as
/// breached, in one statement. Returns the ids that were flipped.
///
/// The terminal-state exclusion is evaluated against the row as it is at
/// the instant of the update.
pub async fn mark_sla_breached(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Uuid>, DbError> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE incidents i SET sla_breached = TRUE, updated_at = $1
        FROM workflow_states s
        WHERE s.id = i.current_state_id
          AND s.kind <> 'terminal'
          AND i.sla_deadline IS NOT NULL
          AND i.sla_deadline < $1
          AND NOT i.sla_breached
        RETURNING i.id
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ---------------------------------------------------------------------------
// incident_transition_history
// ---------------------------------------------------------------------------

pub async fn insert_history(pool: &PgPool, row: &TransitionHistoryRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO incident_transition_history (
            id, incident_id, transition_id, from_state_id, to_state_id, actor_id,
            comment, attachment_ids, feedback, changes, action_results, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(row.id)
    .bind(row.incident_id)
    .bind(row.transition_id)
    .bind(row.from_state_id)
    .bind(row.to_state_id)
    .bind(row.actor_id)
    .bind(&row.comment)
    .bind(&row.attachment_ids)
    .bind(&row.feedback)
    .bind(&row.changes)
    .bind(&row.action_results)
    .bind(row.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_history(
    pool: &PgPool,
    incident_id: Uuid,
) -> Result<Vec<TransitionHistoryRow>, DbError> {
    let rows = sqlx::query_as::<_, TransitionHistoryRow>(
        r#"
        SELECT id, incident_id, transition_id, from_state_id, to_state_id, actor_id,
               comment, attachment_ids, feedback, changes, action_results, created_at
        FROM incident_transition_history
        WHERE incident_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(incident_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// incident_revisions
// ---------------------------------------------------------------------------

/// Allocate the next revision number for an incident and insert the row.
///
/// `supplied` pins the expected number; a mismatch is rejected with
/// `DbError::RevisionOutOfSequence` and nothing is written.
#[allow(clippy::too_many_arguments)]
pub async fn append_revision(
    pool: &PgPool,
    id: Uuid,
    incident_id: Uuid,
    supplied: Option<i64>,
    kind: &str,
    description: &str,
    actor_id: Uuid,
    changes: &serde_json::Value,
    created_at: DateTime<Utc>,
) -> Result<RevisionRow, DbError> {
    let mut tx = pool.begin().await?;

    let (number,): (i64,) = sqlx::query_as(
        "UPDATE incidents SET revision_count = revision_count + 1 WHERE id = $1 RETURNING revision_count",
    )
    .bind(incident_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(DbError::NotFound)?;

    if let Some(supplied) = supplied {
        if supplied != number {
            tx.rollback().await?;
            return Err(DbError::RevisionOutOfSequence { supplied, expected: number });
        }
    }

    let row = sqlx::query_as::<_, RevisionRow>(
        r#"
        INSERT INTO incident_revisions
            (id, incident_id, revision_number, kind, description, actor_id, changes, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, incident_id, revision_number, kind, description, actor_id, changes, created_at
        "#,
    )
    .bind(id)
    .bind(incident_id)
    .bind(number)
    .bind(kind)
    .bind(description)
    .bind(actor_id)
    .bind(changes)
    .bind(created_at)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

pub async fn list_revisions(pool: &PgPool, incident_id: Uuid) -> Result<Vec<RevisionRow>, DbError> {
    let rows = sqlx::query_as::<_, RevisionRow>(
        r#"
        SELECT id, incident_id, revision_number, kind, description, actor_id, changes, created_at
        FROM incident_revisions
        WHERE incident_id = $1
        ORDER BY revision_number ASC
        "#,
    )
    .bind(incident_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
