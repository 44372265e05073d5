//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    /// A revision was supplied with a number other than the next one.
    #[error("revision number {supplied} is not the next revision ({expected})")]
    RevisionOutOfSequence { supplied: i64, expected: i64 },

    /// Incidents still reference the workflow being deleted.
    #[error("workflow is referenced by {incidents} incident(s)")]
    InUse { incidents: i64 },

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
