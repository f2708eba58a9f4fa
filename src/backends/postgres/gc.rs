use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::PostgresBackend;
use crate::backends::base::{BackendResult, GarbageCollectionResult, GarbageCollectorBackend};
use crate::observability::obs;

impl PostgresBackend {
    #[obs]
    pub async fn collect_terminal_strands_impl(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<GarbageCollectionResult> {
        if limit == 0 {
            return Ok(GarbageCollectionResult::default());
        }

        let mut tx = self.pool.begin().await?;
        Self::count_query(&self.query_counts, "select:strands_gc_candidates");
        let candidates: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT s.id
            FROM strands AS s
            WHERE s.exited_at IS NOT NULL
              AND s.exited_at <= $1
              AND (
                s.parent_id IS NULL
                OR NOT EXISTS (SELECT 1 FROM strands AS p WHERE p.id = s.parent_id)
              )
            ORDER BY s.exited_at, s.id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        if candidates.is_empty() {
            tx.commit().await?;
            return Ok(GarbageCollectionResult::default());
        }

        Self::count_query(&self.query_counts, "delete:semaphores_gc");
        let deleted_semaphores = sqlx::query("DELETE FROM semaphores WHERE strand_id = ANY($1)")
            .bind(&candidates)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;

        Self::count_query(&self.query_counts, "delete:strands_gc");
        let deleted_strands = sqlx::query("DELETE FROM strands WHERE id = ANY($1)")
            .bind(&candidates)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        Self::count_batch_size(&self.batch_size_counts, "delete:strands_gc", deleted_strands);
        tx.commit().await?;

        Ok(GarbageCollectionResult {
            deleted_strands,
            deleted_semaphores,
        })
    }
}

#[async_trait]
impl GarbageCollectorBackend for PostgresBackend {
    async fn collect_terminal_strands(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<GarbageCollectionResult> {
        self.collect_terminal_strands_impl(older_than, limit).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serial_test::serial;

    use super::super::test_helpers::setup_backend;
    use super::*;
    use crate::backends::{InspectionBackend, SemaphoreBackend, StrandBackend};
    use crate::strand::{Frame, NewStrand};

    async fn mark_exited(backend: &PostgresBackend, id: Uuid, hours_ago: i64) {
        sqlx::query(
            "UPDATE strands SET exited_at = NOW() - ($2 || ' hours')::interval, exit_value = 'null' WHERE id = $1",
        )
        .bind(id)
        .bind(hours_ago.to_string())
        .execute(backend.pool())
        .await
        .expect("mark exited");
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn gc_deletes_old_orphaned_terminal_strands() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let old = NewStrand::new("Vm", "done", Frame::new());
        let recent = NewStrand::new("Vm", "done", Frame::new());
        let live = NewStrand::new("Vm", "wait", Frame::new());
        let (old_id, recent_id, live_id) = (old.id, recent.id, live.id);
        backend
            .insert_strands(&[old, recent, live])
            .await
            .expect("insert");
        backend
            .signal(old_id, "destroy", Utc::now())
            .await
            .expect("signal");
        mark_exited(&backend, old_id.0, 48).await;
        mark_exited(&backend, recent_id.0, 1).await;

        let result = backend
            .collect_terminal_strands(Utc::now() - ChronoDuration::hours(24), 100)
            .await
            .expect("collect");
        assert_eq!(result.deleted_strands, 1);
        assert_eq!(result.deleted_semaphores, 1);
        assert!(backend.get_strand(old_id).await.expect("get").is_none());
        assert!(backend.get_strand(recent_id).await.expect("get").is_some());
        assert!(backend.get_strand(live_id).await.expect("get").is_some());
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn gc_keeps_children_of_live_parents() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let parent = NewStrand::new("Lb", "wait", Frame::new());
        let child = NewStrand::new("Vm", "done", Frame::new()).with_parent(parent.id);
        let child_id = child.id;
        backend
            .insert_strands(&[parent, child])
            .await
            .expect("insert");
        mark_exited(&backend, child_id.0, 48).await;

        let result = backend
            .collect_terminal_strands(Utc::now() - ChronoDuration::hours(24), 100)
            .await
            .expect("collect");
        assert_eq!(result.deleted_strands, 0);
    }
}
