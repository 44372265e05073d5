//! Directory lookups used by auto-detect assignment, plus the flat tree reads
//! for classifications, locations and departments.
//!
//! Coverage is hierarchical: a department covering a classification also
//! covers every descendant, matched by materialized-path prefix.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{DepartmentRow, HierarchyRow, UserRow},
};

/// Departments whose coverage includes the classification (and location,
/// when the coverage entry is location-scoped).
pub async fn matching_departments(
    pool: &PgPool,
    classification_id: Uuid,
    location_id: Option<Uuid>,
) -> Result<Vec<DepartmentRow>, DbError> {
    let rows = sqlx::query_as::<_, DepartmentRow>(
        r#"
        SELECT DISTINCT d.id, d.name, d.path
        FROM departments d
        JOIN department_coverage cov ON cov.department_id = d.id
        JOIN classifications covc ON covc.id = cov.classification_id
        JOIN classifications c ON c.id = $1
        LEFT JOIN locations covl ON covl.id = cov.location_id
        LEFT JOIN locations l ON l.id = $2
        WHERE c.path LIKE covc.path || '%'
          AND (cov.location_id IS NULL OR (l.id IS NOT NULL AND l.path LIKE covl.path || '%'))
        ORDER BY d.path
        "#,
    )
    .bind(classification_id)
    .bind(location_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Active users holding `role_code`.
///
/// With a department the match is restricted to its members; without one,
/// members of any department covering the classification/location qualify.
pub async fn matching_users(
    pool: &PgPool,
    role_code: &str,
    classification_id: Option<Uuid>,
    location_id: Option<Uuid>,
    department_id: Option<Uuid>,
) -> Result<Vec<UserRow>, DbError> {
    if let Some(department_id) = department_id {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.id, u.name, u.department_id
            FROM users u
            JOIN user_roles r ON r.user_id = u.id
            WHERE u.is_active AND r.role_code = $1 AND u.department_id = $2
            ORDER BY u.name
            "#,
        )
        .bind(role_code)
        .bind(department_id)
        .fetch_all(pool)
        .await?;
        return Ok(rows);
    }

    let Some(classification_id) = classification_id else {
        return Ok(Vec::new());
    };

    let departments = matching_departments(pool, classification_id, location_id).await?;
    let department_ids: Vec<Uuid> = departments.into_iter().map(|d| d.id).collect();

    let rows = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT u.id, u.name, u.department_id
        FROM users u
        JOIN user_roles r ON r.user_id = u.id
        WHERE u.is_active AND r.role_code = $1 AND u.department_id = ANY($2)
        ORDER BY u.name
        "#,
    )
    .bind(role_code)
    .bind(&department_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Which self-referential tree to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hierarchy {
    Classifications,
    Locations,
    Departments,
}

impl Hierarchy {
    fn table(self) -> &'static str {
        match self {
            Self::Classifications => "classifications",
            Self::Locations => "locations",
            Self::Departments => "departments",
        }
    }
}

/// All rows of one tree, flat, ordered by path.
pub async fn list_hierarchy(pool: &PgPool, hierarchy: Hierarchy) -> Result<Vec<HierarchyRow>, DbError> {
    let rows = sqlx::query_as::<_, HierarchyRow>(&format!(
        "SELECT id, parent_id, name, path FROM {} ORDER BY path",
        hierarchy.table()
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Fetch one tree node, used to derive a child's path at creation time.
pub async fn get_hierarchy_node(
    pool: &PgPool,
    hierarchy: Hierarchy,
    id: Uuid,
) -> Result<HierarchyRow, DbError> {
    let row = sqlx::query_as::<_, HierarchyRow>(&format!(
        "SELECT id, parent_id, name, path FROM {} WHERE id = $1",
        hierarchy.table()
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

pub async fn insert_hierarchy_node(
    pool: &PgPool,
    hierarchy: Hierarchy,
    row: &HierarchyRow,
) -> Result<(), DbError> {
    sqlx::query(&format!(
        "INSERT INTO {} (id, parent_id, name, path) VALUES ($1, $2, $3, $4)",
        hierarchy.table()
    ))
    .bind(row.id)
    .bind(row.parent_id)
    .bind(&row.name)
    .bind(&row.path)
    .execute(pool)
    .await?;

    Ok(())
}
