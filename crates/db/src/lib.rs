//! `db` crate: Postgres persistence for workflows, incidents and the
//! classification/location/department directory.
//!
//! Row structs and one repository function per statement. Graph validation,
//! assignment rules and SLA arithmetic live in `engine`.

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;

pub use pool::{DbPool, PoolConfig};
pub use error::DbError;
