//! Database helpers shared across services.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::backends::{BackendError, BackendResult};

/// Run the embedded SQLx migrations.
pub async fn run_migrations(pool: &PgPool) -> BackendResult<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|err| BackendError::Message(err.to_string()))?;
    Ok(())
}

/// Open a pool sized for `connections` concurrent hops plus housekeeping.
pub async fn connect_pool(dsn: &str, connections: usize) -> BackendResult<PgPool> {
    let max_connections = u32::try_from(connections.saturating_add(2)).unwrap_or(u32::MAX);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(dsn)
        .await?;
    Ok(pool)
}
