//! Repository functions: one function per database operation.
//!
//! Every function takes a `&DbPool` (or an open transaction) and returns a
//! `Result<T, DbError>`. Plain SQL with no business logic.

pub mod workflows;
pub mod incidents;
pub mod directory;
