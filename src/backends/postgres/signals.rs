use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{PostgresBackend, SemaphoreRow};
use crate::backends::base::{BackendError, BackendResult, SemaphoreBackend};
use crate::observability::obs;
use crate::semaphore::Semaphore;
use crate::strand::StrandId;

impl PostgresBackend {
    /// Pull a live strand's schedule to `now` and clear any failure pause.
    ///
    /// Returns false when the strand is missing or has exited.
    pub(super) async fn wake_for_signal(
        conn: &mut PgConnection,
        strand_id: StrandId,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let woken: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE strands
            SET scheduled_at = LEAST(scheduled_at, $2),
                failed_at = NULL,
                updated_at = $2
            WHERE id = $1
              AND exited_at IS NULL
            RETURNING id
            "#,
        )
        .bind(strand_id.0)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(woken.is_some())
    }

    pub(super) async fn insert_semaphore(
        conn: &mut PgConnection,
        semaphore: &Semaphore,
    ) -> BackendResult<()> {
        sqlx::query("INSERT INTO semaphores (id, strand_id, name, created_at) VALUES ($1, $2, $3, $4)")
            .bind(semaphore.id)
            .bind(semaphore.strand_id.0)
            .bind(semaphore.name.as_str())
            .bind(semaphore.created_at)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn signal_once(
        &self,
        strand_id: StrandId,
        name: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Semaphore> {
        let mut tx = self.pool.begin().await?;
        Self::count_query(&self.query_counts, "update:strands_signal_wake");
        if !Self::wake_for_signal(&mut *tx, strand_id, now).await? {
            let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM strands WHERE id = $1")
                .bind(strand_id.0)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                Some(_) => BackendError::StrandTerminal(strand_id),
                None => BackendError::StrandNotFound(strand_id),
            });
        }
        let semaphore = Semaphore::new(strand_id, name, now);
        Self::count_query(&self.query_counts, "insert:semaphores");
        Self::insert_semaphore(&mut *tx, &semaphore).await?;
        tx.commit().await?;
        Ok(semaphore)
    }
}

#[async_trait]
impl SemaphoreBackend for PostgresBackend {
    #[obs]
    async fn signal(
        &self,
        strand_id: StrandId,
        name: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Semaphore> {
        super::retry_transient_backend("signal", || async move {
            self.signal_once(strand_id, name, now).await
        })
        .await
    }

    async fn pending_semaphores(&self, strand_id: StrandId) -> BackendResult<Vec<Semaphore>> {
        Self::count_query(&self.query_counts, "select:semaphores");
        let rows: Vec<SemaphoreRow> = sqlx::query_as(
            r#"
            SELECT id, strand_id, name, created_at
            FROM semaphores
            WHERE strand_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(strand_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Semaphore::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serial_test::serial;

    use super::super::test_helpers::setup_backend;
    use super::*;
    use crate::backends::StrandBackend;
    use crate::strand::{Frame, NewStrand};

    #[serial(postgres)]
    #[tokio::test]
    async fn signals_accumulate_per_name() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let new = NewStrand::new("Lb", "wait", Frame::new());
        let id = new.id;
        backend.insert_strands(&[new]).await.expect("insert");

        let now = Utc::now();
        backend.signal(id, "add_vm", now).await.expect("signal");
        backend.signal(id, "add_vm", now).await.expect("signal");
        let pending = backend.pending_semaphores(id).await.expect("pending");
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|sem| sem.name == "add_vm"));
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn signals_to_missing_strand_are_rejected() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let missing = StrandId::new();
        let err = backend
            .signal(missing, "destroy", Utc::now())
            .await
            .expect_err("missing");
        assert!(matches!(err, BackendError::StrandNotFound(id) if id == missing));
    }
}
