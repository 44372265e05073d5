//! Postgres connection pool and embedded migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Shared pool handed to every store adapter.
pub type DbPool = PgPool;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// How long a transition may wait for a connection before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Connect with the default acquire timeout and `max_connections` as the
/// ceiling. A transition holds its connection only for the compare-and-set
/// and the audit inserts.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    create_pool_with(
        database_url,
        &PoolConfig {
            max_connections,
            ..PoolConfig::default()
        },
    )
    .await
}

pub async fn create_pool_with(database_url: &str, config: &PoolConfig) -> Result<DbPool, DbError> {
    info!(
        "Connecting to database (max_connections={}, acquire_timeout={:?})",
        config.max_connections, config.acquire_timeout
    );
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the schema in the workspace `migrations/` directory, embedded at
/// build time.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("Running incident workflow migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Schema is up to date");
    Ok(())
}
