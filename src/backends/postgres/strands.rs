use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::warn;
use uuid::Uuid;

use super::{
    ChildRow, PostgresBackend, STRAND_COLUMNS, SemaphoreRow, StrandRow, retry_transient_backend,
    strand_uuids,
};
use crate::backends::base::{BackendError, BackendResult, StrandBackend, Transition};
use crate::observability::obs;
use crate::semaphore::Semaphore;
use crate::strand::{
    ChildSummary, ClaimedStrand, FrameStack, LeaseClaim, NewStrand, Strand, StrandId,
};

fn retry_count_param(retry_count: u32) -> i32 {
    i32::try_from(retry_count).unwrap_or(i32::MAX)
}

impl PostgresBackend {
    pub(super) async fn insert_new_strands(
        &self,
        conn: &mut PgConnection,
        strands: &[NewStrand],
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        if strands.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO strands (id, parent_id, prog, label, stack, scheduled_at, deadline_at, created_at, updated_at) ",
        );
        builder.push_values(strands.iter(), |mut row, new| {
            row.push_bind(new.id.0)
                .push_bind(new.parent_id.map(|id| id.0))
                .push_bind(new.prog.as_str())
                .push_bind(new.label.as_str())
                .push_bind(Json(FrameStack::new(new.frame.clone())))
                .push_bind(new.scheduled_at.unwrap_or(now))
                .push_bind(new.deadline_at)
                .push_bind(now)
                .push_bind(now);
        });
        Self::count_query(&self.query_counts, "insert:strands");
        Self::count_batch_size(&self.batch_size_counts, "insert:strands", strands.len());
        builder.build().execute(conn).await?;
        Ok(())
    }

    async fn claim_due_batch_once(
        &self,
        claim: &LeaseClaim,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<ClaimedStrand>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        Self::count_query(&self.query_counts, "update:strands_claim");
        let rows: Vec<StrandRow> = sqlx::query_as(&format!(
            r#"
            WITH claimed AS (
                SELECT id
                FROM strands
                WHERE exited_at IS NULL
                  AND waiting_on IS NULL
                  AND scheduled_at <= $1
                  AND (lease_owner IS NULL OR lease_expires_at <= $1)
                ORDER BY scheduled_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE strands AS s
            SET lease_owner = $3,
                lease_expires_at = $4
            FROM claimed
            WHERE s.id = claimed.id
            RETURNING {}
            "#,
            prefixed_columns("s")
        ))
        .bind(now)
        .bind(limit as i64)
        .bind(claim.owner)
        .bind(claim.expires_at)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }
        Self::count_batch_size(&self.batch_size_counts, "update:strands_claim", rows.len());

        let mut strands: Vec<Strand> = rows.into_iter().map(Strand::from).collect();
        strands.sort_by_key(|strand| (strand.scheduled_at, strand.created_at));
        let ids: Vec<Uuid> = strands.iter().map(|strand| strand.id.0).collect();

        Self::count_query(&self.query_counts, "select:semaphores_for_claim");
        let semaphore_rows: Vec<SemaphoreRow> = sqlx::query_as(
            r#"
            SELECT id, strand_id, name, created_at
            FROM semaphores
            WHERE strand_id = ANY($1)
            ORDER BY created_at, id
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        Self::count_query(&self.query_counts, "select:children_for_claim");
        let child_rows: Vec<ChildRow> = sqlx::query_as(
            r#"
            SELECT id, parent_id, prog, label, exit_value, exited_at
            FROM strands
            WHERE parent_id = ANY($1)
            ORDER BY created_at, id
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut semaphores: HashMap<StrandId, Vec<Semaphore>> = HashMap::new();
        for row in semaphore_rows {
            let semaphore = Semaphore::from(row);
            semaphores
                .entry(semaphore.strand_id)
                .or_default()
                .push(semaphore);
        }
        let mut children: HashMap<StrandId, Vec<ChildSummary>> = HashMap::new();
        for row in child_rows {
            if let Some(parent) = row.parent() {
                children
                    .entry(parent)
                    .or_default()
                    .push(ChildSummary::from(row));
            }
        }

        Ok(strands
            .into_iter()
            .map(|strand| ClaimedStrand {
                semaphores: semaphores.remove(&strand.id).unwrap_or_default(),
                children: children.remove(&strand.id).unwrap_or_default(),
                lease: *claim,
                strand,
            })
            .collect())
    }

    async fn extend_leases_once(
        &self,
        claim: &LeaseClaim,
        ids: &[StrandId],
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<StrandId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Self::count_query(&self.query_counts, "update:strands_extend_lease");
        let held: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE strands
            SET lease_expires_at = $1
            WHERE id = ANY($2)
              AND lease_owner = $3
              AND lease_expires_at > $4
              AND exited_at IS NULL
            RETURNING id
            "#,
        )
        .bind(claim.expires_at)
        .bind(strand_uuids(ids))
        .bind(claim.owner)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(held.into_iter().map(StrandId).collect())
    }

    async fn release_once(
        &self,
        claim: &LeaseClaim,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let id = transition.strand_id;
        let mut tx = self.pool.begin().await?;

        Self::count_query(&self.query_counts, "select:strand_for_release");
        let current: Option<StrandRow> = sqlx::query_as(&format!(
            "SELECT {STRAND_COLUMNS} FROM strands WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let current = Strand::from(current.ok_or(BackendError::StrandNotFound(id))?);
        if current.lease_owner != Some(claim.owner)
            || !current.lease_held_at(now)
            || current.is_terminal()
        {
            return Err(BackendError::LeaseLost(id));
        }

        if !transition.consumed_semaphores.is_empty() {
            Self::count_query(&self.query_counts, "delete:semaphores_consumed");
            sqlx::query("DELETE FROM semaphores WHERE strand_id = $1 AND id = ANY($2)")
                .bind(id.0)
                .bind(&transition.consumed_semaphores)
                .execute(&mut *tx)
                .await?;
        }

        Self::count_query(&self.query_counts, "update:strands_release");
        sqlx::query(
            r#"
            UPDATE strands
            SET prog = $2,
                label = $3,
                stack = $4,
                scheduled_at = $5,
                retry_count = $6,
                deadline_at = $7,
                waiting_on = $8,
                exit_value = $9,
                exited_at = $10,
                failed_at = $11,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(transition.prog.as_str())
        .bind(transition.label.as_str())
        .bind(Json(&transition.stack))
        .bind(transition.scheduled_at)
        .bind(retry_count_param(transition.retry_count))
        .bind(transition.deadline_at)
        .bind(transition.waiting_on.map(|child| child.0))
        .bind(transition.exit.clone())
        .bind(transition.exit.as_ref().map(|_| now))
        .bind(transition.failed_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        self.insert_new_strands(&mut *tx, &transition.spawned, now)
            .await?;

        if !transition.reaped.is_empty() {
            Self::count_query(&self.query_counts, "delete:strands_reaped");
            sqlx::query(
                "DELETE FROM strands WHERE id = ANY($1) AND parent_id = $2 AND exited_at IS NOT NULL",
            )
            .bind(strand_uuids(&transition.reaped))
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        }

        for (target, name) in &transition.signals {
            if !Self::wake_for_signal(&mut *tx, *target, now).await? {
                warn!(strand_id = %id, target = %target, semaphore = %name, "dropping signal to missing or exited strand");
                continue;
            }
            Self::count_query(&self.query_counts, "insert:semaphores");
            Self::insert_semaphore(&mut *tx, &Semaphore::new(*target, name, now)).await?;
        }

        if let Some(page) = &transition.page {
            Self::count_query(&self.query_counts, "insert:pages");
            Self::insert_page(&mut *tx, page, now).await?;
        }

        if let Some(value) = &transition.exit {
            if let Some(parent_id) = current.parent_id {
                self.deliver_exit(&mut *tx, id, parent_id, value, now).await?;
            }
        } else if transition.wakeable() {
            Self::count_query(&self.query_counts, "update:strands_missed_wakeup");
            sqlx::query(
                r#"
                UPDATE strands
                SET scheduled_at = LEAST(scheduled_at, $2)
                WHERE id = $1
                  AND (
                    EXISTS (
                        SELECT 1 FROM semaphores
                        WHERE strand_id = $1 AND NOT (id = ANY($3))
                    )
                    OR EXISTS (
                        SELECT 1 FROM strands AS child
                        WHERE child.id = ANY($4) AND child.exited_at IS NOT NULL
                    )
                  )
                "#,
            )
            .bind(id.0)
            .bind(now)
            .bind(&transition.observed_semaphores)
            .bind(strand_uuids(&transition.observed_live_children))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Hand an exiting child's value to its parent.
    ///
    /// A parent suspended on the child takes the value into its top frame and
    /// the child row is removed. A parent that budded the child is only woken.
    async fn deliver_exit(
        &self,
        conn: &mut PgConnection,
        child_id: StrandId,
        parent_id: StrandId,
        value: &Value,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        Self::count_query(&self.query_counts, "select:parent_for_delivery");
        let parent: Option<StrandRow> = sqlx::query_as(&format!(
            "SELECT {STRAND_COLUMNS} FROM strands WHERE id = $1 FOR UPDATE"
        ))
        .bind(parent_id.0)
        .fetch_optional(&mut *conn)
        .await?;
        let Some(parent) = parent.map(Strand::from) else {
            return Ok(());
        };
        if parent.is_terminal() {
            return Ok(());
        }

        if parent.waiting_on == Some(child_id) {
            let mut stack = parent.stack;
            stack.deliver(value.clone());
            Self::count_query(&self.query_counts, "update:strands_deliver");
            sqlx::query(
                r#"
                UPDATE strands
                SET stack = $2,
                    waiting_on = NULL,
                    scheduled_at = LEAST(scheduled_at, $3),
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(parent_id.0)
            .bind(Json(&stack))
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Self::count_query(&self.query_counts, "delete:strands_delivered");
            sqlx::query("DELETE FROM strands WHERE id = $1")
                .bind(child_id.0)
                .execute(&mut *conn)
                .await?;
        } else if parent.failed_at.is_none() {
            Self::count_query(&self.query_counts, "update:strands_wake_parent");
            sqlx::query(
                "UPDATE strands SET scheduled_at = LEAST(scheduled_at, $2), updated_at = $2 WHERE id = $1",
            )
            .bind(parent_id.0)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

/// Qualify every strand column with a table alias for `RETURNING` clauses.
pub(super) fn prefixed_columns(alias: &str) -> String {
    STRAND_COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl StrandBackend for PostgresBackend {
    #[obs]
    async fn insert_strands(&self, strands: &[NewStrand]) -> BackendResult<()> {
        if strands.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        self.insert_new_strands(&mut *tx, strands, now).await?;
        tx.commit().await?;
        Ok(())
    }

    #[obs]
    async fn claim_due_batch(
        &self,
        claim: &LeaseClaim,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<ClaimedStrand>> {
        retry_transient_backend("claim_due_batch", || async move {
            self.claim_due_batch_once(claim, now, limit).await
        })
        .await
    }

    async fn extend_leases(
        &self,
        claim: &LeaseClaim,
        ids: &[StrandId],
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<StrandId>> {
        retry_transient_backend("extend_leases", || async move {
            self.extend_leases_once(claim, ids, now).await
        })
        .await
    }

    #[obs]
    async fn release(
        &self,
        claim: &LeaseClaim,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        retry_transient_backend("release", || async move {
            self.release_once(claim, transition, now).await
        })
        .await
    }

    async fn abandon(&self, owner: Uuid, ids: &[StrandId]) -> BackendResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        Self::count_query(&self.query_counts, "update:strands_abandon");
        sqlx::query(
            r#"
            UPDATE strands
            SET lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = ANY($1)
              AND lease_owner = $2
            "#,
        )
        .bind(strand_uuids(ids))
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
