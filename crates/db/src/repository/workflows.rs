//! Workflow graph persistence: workflows, states, transitions and their roles.
//!
//! Both deletion paths touch the same four tables inside one transaction so a
//! workflow never leaves orphaned states or transitions behind. Writes that
//! change a stored graph bump `workflows.version`.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    DbError,
    models::{TransitionRoleRow, WorkflowRow, WorkflowStateRow, WorkflowTransitionRow},
};

const WORKFLOW_COLUMNS: &str =
    "id, code, name, is_active, is_default, applies_to, required_fields, created_at";

const STATE_COLUMNS: &str = "id, workflow_id, code, name, kind, sla_hours, visible_to";

const TRANSITION_COLUMNS: &str = r#"
    id, workflow_id, code, name, from_state_id, to_state_id, is_active,
    requirements, actions,
    assign_department_id, auto_detect_department, manual_select_department,
    assign_user_id, auto_detect_user_role, assign_all_matched_users, manual_select_user
"#;

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Fetch a single (non-deleted) workflow by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Version stamp of a live workflow.
pub async fn workflow_version(pool: &PgPool, id: Uuid) -> Result<i64, DbError> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM workflows WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    version.ok_or(DbError::NotFound)
}

/// Return the active default workflow applicable to `record_kind`, if any.
pub async fn find_default_workflow(
    pool: &PgPool,
    record_kind: &str,
) -> Result<Option<WorkflowRow>, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(&format!(
        r#"
        SELECT {WORKFLOW_COLUMNS} FROM workflows
        WHERE is_default AND is_active AND deleted_at IS NULL AND $1 = ANY(applies_to)
        "#
    ))
    .bind(record_kind)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn list_states(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowStateRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowStateRow>(&format!(
        "SELECT {STATE_COLUMNS} FROM workflow_states WHERE workflow_id = $1 AND deleted_at IS NULL ORDER BY code"
    ))
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn list_transitions(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Vec<WorkflowTransitionRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowTransitionRow>(&format!(
        "SELECT {TRANSITION_COLUMNS} FROM workflow_transitions WHERE workflow_id = $1 AND deleted_at IS NULL ORDER BY code"
    ))
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// All role grants for the transitions of one workflow.
pub async fn list_transition_roles(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Vec<TransitionRoleRow>, DbError> {
    let rows = sqlx::query_as::<_, TransitionRoleRow>(
        r#"
        SELECT r.transition_id, r.role_code
        FROM workflow_transition_roles r
        JOIN workflow_transitions t ON t.id = r.transition_id
        WHERE t.workflow_id = $1 AND r.deleted_at IS NULL AND t.deleted_at IS NULL
        "#,
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn list_roles_for_transition(
    pool: &PgPool,
    transition_id: Uuid,
) -> Result<Vec<String>, DbError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT role_code FROM workflow_transition_roles WHERE transition_id = $1 AND deleted_at IS NULL",
    )
    .bind(transition_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(code,)| code).collect())
}

// ---------------------------------------------------------------------------
// Inserts (run inside the caller's transaction)
// ---------------------------------------------------------------------------

pub async fn insert_workflow(conn: &mut PgConnection, row: &WorkflowRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflows (id, code, name, is_active, is_default, applies_to, required_fields, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(row.id)
    .bind(&row.code)
    .bind(&row.name)
    .bind(row.is_active)
    .bind(row.is_default)
    .bind(&row.applies_to)
    .bind(&row.required_fields)
    .bind(row.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn insert_state(conn: &mut PgConnection, row: &WorkflowStateRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_states (id, workflow_id, code, name, kind, sla_hours, visible_to)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_id)
    .bind(&row.code)
    .bind(&row.name)
    .bind(&row.kind)
    .bind(row.sla_hours)
    .bind(&row.visible_to)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn insert_transition(
    conn: &mut PgConnection,
    row: &WorkflowTransitionRow,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_transitions (
            id, workflow_id, code, name, from_state_id, to_state_id, is_active,
            requirements, actions,
            assign_department_id, auto_detect_department, manual_select_department,
            assign_user_id, auto_detect_user_role, assign_all_matched_users, manual_select_user
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_id)
    .bind(&row.code)
    .bind(&row.name)
    .bind(row.from_state_id)
    .bind(row.to_state_id)
    .bind(row.is_active)
    .bind(&row.requirements)
    .bind(&row.actions)
    .bind(row.assign_department_id)
    .bind(row.auto_detect_department)
    .bind(row.manual_select_department)
    .bind(row.assign_user_id)
    .bind(&row.auto_detect_user_role)
    .bind(row.assign_all_matched_users)
    .bind(row.manual_select_user)
    .execute(conn)
    .await?;

    Ok(())
}

/// Grant roles on a transition. Existing grants are left as they are.
pub async fn add_transition_roles(
    conn: &mut PgConnection,
    transition_id: Uuid,
    role_codes: &[String],
) -> Result<(), DbError> {
    if role_codes.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO workflow_transition_roles (transition_id, role_code)
        SELECT $1, UNNEST($2::TEXT[])
        ON CONFLICT (transition_id, role_code) DO UPDATE SET deleted_at = NULL
        "#,
    )
    .bind(transition_id)
    .bind(role_codes)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn remove_transition_roles(
    conn: &mut PgConnection,
    transition_id: Uuid,
    role_codes: &[String],
) -> Result<(), DbError> {
    if role_codes.is_empty() {
        return Ok(());
    }

    sqlx::query(
        "DELETE FROM workflow_transition_roles WHERE transition_id = $1 AND role_code = ANY($2)",
    )
    .bind(transition_id)
    .bind(role_codes)
    .execute(conn)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Default flag
// ---------------------------------------------------------------------------

/// Bump the version of the workflow owning `transition_id`.
pub async fn bump_version_for_transition(
    conn: &mut PgConnection,
    transition_id: Uuid,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        UPDATE workflows SET version = version + 1
        WHERE id = (SELECT workflow_id FROM workflow_transitions WHERE id = $1)
        "#,
    )
    .bind(transition_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Clear the default flag everywhere; used before inserting a new default.
pub async fn clear_default_workflows(conn: &mut PgConnection) -> Result<(), DbError> {
    sqlx::query("UPDATE workflows SET is_default = FALSE, version = version + 1 WHERE is_default")
        .execute(conn)
        .await?;

    Ok(())
}

/// Make `id` the single default workflow.
///
/// Returns `DbError::NotFound` if the workflow does not exist.
pub async fn set_default_workflow(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE workflows SET is_default = FALSE, version = version + 1 WHERE is_default AND id <> $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query(
        "UPDATE workflows SET is_default = TRUE, version = version + 1 WHERE id = $1 AND deleted_at IS NULL",
    )
        .bind(id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(DbError::NotFound);
    }

    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

/// Lock a live workflow row and count the incidents that would block its
/// deletion: all of them, or with `open_only` those not in a terminal state.
///
/// Returns `DbError::NotFound` if the workflow is missing or soft-deleted and
/// `DbError::InUse` if the count is not zero.
async fn lock_unreferenced(conn: &mut PgConnection, id: Uuid, open_only: bool) -> Result<(), DbError> {
    sqlx::query("SELECT id FROM workflows WHERE id = $1 AND deleted_at IS NULL FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DbError::NotFound)?;

    let incidents: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM incidents i
        JOIN workflow_states s ON s.id = i.current_state_id
        WHERE i.workflow_id = $1 AND (NOT $2 OR s.kind <> 'terminal')
        "#,
    )
    .bind(id)
    .bind(open_only)
    .fetch_one(&mut *conn)
    .await?;

    if incidents > 0 {
        return Err(DbError::InUse { incidents });
    }
    Ok(())
}

/// Permanently delete a workflow together with its states, transitions and
/// transition roles. Refused while any incident references it.
///
/// Returns `DbError::NotFound` if no live workflow row exists.
pub async fn hard_delete_workflow(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    lock_unreferenced(&mut tx, id, false).await?;

    sqlx::query(
        r#"
        DELETE FROM workflow_transition_roles
        WHERE transition_id IN (SELECT id FROM workflow_transitions WHERE workflow_id = $1)
        "#,
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM workflow_transitions WHERE workflow_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM workflow_states WHERE workflow_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(DbError::NotFound);
    }

    tx.commit().await?;
    Ok(())
}

/// Soft-delete a workflow together with its states, transitions and
/// transition roles, stamping all of them with the same `deleted_at`.
/// Refused while an open incident references it.
pub async fn soft_delete_workflow(
    pool: &PgPool,
    id: Uuid,
    deleted_at: DateTime<Utc>,
) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    lock_unreferenced(&mut tx, id, true).await?;

    sqlx::query(
        r#"
        UPDATE workflow_transition_roles SET deleted_at = $2
        WHERE deleted_at IS NULL
          AND transition_id IN (SELECT id FROM workflow_transitions WHERE workflow_id = $1)
        "#,
    )
    .bind(id)
    .bind(deleted_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE workflow_transitions SET deleted_at = $2 WHERE workflow_id = $1 AND deleted_at IS NULL")
        .bind(id)
        .bind(deleted_at)
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE workflow_states SET deleted_at = $2 WHERE workflow_id = $1 AND deleted_at IS NULL")
        .bind(id)
        .bind(deleted_at)
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query(
        r#"
        UPDATE workflows SET deleted_at = $2, is_default = FALSE, version = version + 1
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(id)
    .bind(deleted_at)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(DbError::NotFound);
    }

    tx.commit().await?;
    Ok(())
}
