use std::env;

use tokio::sync::OnceCell;

use super::PostgresBackend;
use crate::db;

static MIGRATED: OnceCell<()> = OnceCell::const_new();

/// Connect to the test database and start from empty tables.
///
/// Returns `None` (and the calling test passes vacuously) when
/// `STRAND_DATABASE_URL` is not set.
pub(super) async fn setup_backend() -> Option<PostgresBackend> {
    let Ok(dsn) = env::var("STRAND_DATABASE_URL") else {
        eprintln!("skipping test: STRAND_DATABASE_URL not set");
        return None;
    };
    let pool = db::connect_pool(&dsn, 8)
        .await
        .unwrap_or_else(|err| panic!("connect to {dsn} failed: {err}"));
    MIGRATED
        .get_or_init(|| async {
            db::run_migrations(&pool)
                .await
                .unwrap_or_else(|err| panic!("migrations failed: {err}"));
        })
        .await;
    let backend = PostgresBackend::new(pool);
    backend.clear_all().await.expect("clear tables");
    Some(backend)
}
