//! Postgres backend for persisting strands, semaphores and pages.

mod gc;
mod inspect;
mod pages;
mod signals;
mod strands;
#[cfg(test)]
mod test_helpers;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::warn;
use uuid::Uuid;

use crate::db;
use crate::observability::obs;
use crate::page::Page;
use crate::semaphore::Semaphore;
use crate::strand::{ChildSummary, FrameStack, Strand, StrandId};

use super::base::{BackendError, BackendResult};

const TRANSIENT_DEADLOCK_SQLSTATE: &str = "40P01";
const TRANSIENT_SERIALIZATION_SQLSTATE: &str = "40001";
const TRANSIENT_RETRY_MAX_ATTEMPTS: usize = 3;
const TRANSIENT_RETRY_INITIAL_BACKOFF_MS: u64 = 25;
const TRANSIENT_RETRY_MAX_BACKOFF_MS: u64 = 250;

/// Column list matching [`StrandRow`].
pub(super) const STRAND_COLUMNS: &str = "id, parent_id, prog, label, stack, waiting_on, \
     scheduled_at, lease_owner, lease_expires_at, retry_count, deadline_at, exit_value, \
     exited_at, failed_at, created_at, updated_at";

/// Persist strands in Postgres.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    query_counts: Arc<Mutex<HashMap<String, usize>>>,
    batch_size_counts: Arc<Mutex<HashMap<String, HashMap<usize, usize>>>>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_counts: Arc::new(Mutex::new(HashMap::new())),
            batch_size_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[obs]
    pub async fn connect(dsn: &str) -> BackendResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete every strand, semaphore and page.
    #[obs]
    pub async fn clear_all(&self) -> BackendResult<()> {
        Self::count_query(&self.query_counts, "truncate:strand_tables");
        sqlx::query("TRUNCATE semaphores, pages, strands")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn query_counts(&self) -> HashMap<String, usize> {
        self.query_counts
            .lock()
            .expect("query counts poisoned")
            .clone()
    }

    pub fn batch_size_counts(&self) -> HashMap<String, HashMap<usize, usize>> {
        self.batch_size_counts
            .lock()
            .expect("batch size counts poisoned")
            .clone()
    }

    pub(super) fn count_query(counts: &Arc<Mutex<HashMap<String, usize>>>, label: &str) {
        let mut guard = counts.lock().expect("query counts poisoned");
        *guard.entry(label.to_string()).or_insert(0) += 1;
    }

    pub(super) fn count_batch_size(
        counts: &Arc<Mutex<HashMap<String, HashMap<usize, usize>>>>,
        label: &str,
        size: usize,
    ) {
        if size == 0 {
            return;
        }
        let mut guard = counts.lock().expect("batch size counts poisoned");
        let entry = guard.entry(label.to_string()).or_default();
        *entry.entry(size).or_insert(0) += 1;
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    matches!(
        code,
        TRANSIENT_DEADLOCK_SQLSTATE | TRANSIENT_SERIALIZATION_SQLSTATE
    )
}

fn is_transient_backend_error(err: &BackendError) -> bool {
    match err {
        BackendError::Sqlx(sqlx::Error::Database(db_err)) => {
            db_err.code().as_deref().is_some_and(is_transient_sqlstate)
        }
        // Fallback for cases where sqlstate is not preserved in wrapping.
        BackendError::Message(message) => {
            message.contains("deadlock detected")
                || message.contains("could not serialize access due to")
        }
        _ => false,
    }
}

/// Re-run `op` when Postgres aborts it with a deadlock or serialization failure.
pub(super) async fn retry_transient_backend<T, Op, Fut>(
    operation: &'static str,
    mut op: Op,
) -> BackendResult<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt = 0usize;
    let mut backoff_ms = TRANSIENT_RETRY_INITIAL_BACKOFF_MS;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if attempt < TRANSIENT_RETRY_MAX_ATTEMPTS && is_transient_backend_error(&err) =>
            {
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    error = %err,
                    "transient database error; retrying"
                );
                tokio::time::sleep(StdDuration::from_millis(backoff_ms)).await;
                backoff_ms =
                    std::cmp::min(backoff_ms.saturating_mul(2), TRANSIENT_RETRY_MAX_BACKOFF_MS);
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct StrandRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    prog: String,
    label: String,
    stack: Json<FrameStack>,
    waiting_on: Option<Uuid>,
    scheduled_at: DateTime<Utc>,
    lease_owner: Option<Uuid>,
    lease_expires_at: Option<DateTime<Utc>>,
    retry_count: i32,
    deadline_at: Option<DateTime<Utc>>,
    exit_value: Option<Value>,
    exited_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<StrandRow> for Strand {
    fn from(row: StrandRow) -> Self {
        Self {
            id: StrandId(row.id),
            parent_id: row.parent_id.map(StrandId),
            prog: row.prog,
            label: row.label,
            stack: row.stack.0,
            waiting_on: row.waiting_on.map(StrandId),
            scheduled_at: row.scheduled_at,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            deadline_at: row.deadline_at,
            exit_value: row.exit_value,
            exited_at: row.exited_at,
            failed_at: row.failed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct ChildRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    prog: String,
    label: String,
    exit_value: Option<Value>,
    exited_at: Option<DateTime<Utc>>,
}

impl ChildRow {
    pub(super) fn parent(&self) -> Option<StrandId> {
        self.parent_id.map(StrandId)
    }
}

impl From<ChildRow> for ChildSummary {
    fn from(row: ChildRow) -> Self {
        Self {
            id: StrandId(row.id),
            prog: row.prog,
            label: row.label,
            exit_value: row.exit_value,
            exited_at: row.exited_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct SemaphoreRow {
    id: Uuid,
    strand_id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<SemaphoreRow> for Semaphore {
    fn from(row: SemaphoreRow) -> Self {
        Self {
            id: row.id,
            strand_id: StrandId(row.strand_id),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct PageRow {
    id: Uuid,
    strand_id: Option<Uuid>,
    tag: String,
    summary: String,
    details: Value,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<PageRow> for Page {
    fn from(row: PageRow) -> Self {
        Self {
            id: row.id,
            strand_id: row.strand_id.map(StrandId),
            tag: row.tag,
            summary: row.summary,
            details: row.details,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        }
    }
}

pub(super) fn strand_uuids(ids: &[StrandId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.0).collect()
}
