use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use super::{PostgresBackend, STRAND_COLUMNS, StrandRow};
use crate::backends::base::{BackendError, BackendResult, InspectionBackend, StrandFilter};
use crate::observability::obs;
use crate::page::strand_tag;
use crate::strand::{Strand, StrandId};

#[async_trait]
impl InspectionBackend for PostgresBackend {
    async fn get_strand(&self, id: StrandId) -> BackendResult<Option<Strand>> {
        Self::count_query(&self.query_counts, "select:strand");
        let row: Option<StrandRow> =
            sqlx::query_as(&format!("SELECT {STRAND_COLUMNS} FROM strands WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Strand::from))
    }

    async fn list_strands(&self, filter: &StrandFilter) -> BackendResult<Vec<Strand>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {STRAND_COLUMNS} FROM strands WHERE TRUE"));
        if let Some(prog) = &filter.prog {
            builder.push(" AND prog = ").push_bind(prog.as_str());
        }
        if let Some(label) = &filter.label {
            builder.push(" AND label = ").push_bind(label.as_str());
        }
        if let Some(now) = filter.stale_as_of {
            builder
                .push(" AND lease_owner IS NOT NULL AND lease_expires_at <= ")
                .push_bind(now);
        }
        if filter.failed_only {
            builder.push(" AND failed_at IS NOT NULL");
        }
        if !filter.include_terminal {
            builder.push(" AND exited_at IS NULL");
        }
        builder
            .push(" ORDER BY created_at, id LIMIT ")
            .push_bind(filter.limit as i64);

        Self::count_query(&self.query_counts, "select:strands_filtered");
        let rows: Vec<StrandRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Strand::from).collect())
    }

    #[obs]
    async fn resume(
        &self,
        id: StrandId,
        label: Option<&str>,
        now: DateTime<Utc>,
    ) -> BackendResult<Strand> {
        let mut tx = self.pool.begin().await?;
        Self::count_query(&self.query_counts, "update:strands_resume");
        let row: Option<StrandRow> = sqlx::query_as(&format!(
            r#"
            UPDATE strands
            SET label = COALESCE($2, label),
                retry_count = 0,
                failed_at = NULL,
                deadline_at = NULL,
                scheduled_at = LEAST(scheduled_at, $3),
                updated_at = $3
            WHERE id = $1
              AND exited_at IS NULL
            RETURNING {STRAND_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(label)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let exists: Option<uuid::Uuid> =
                sqlx::query_scalar("SELECT id FROM strands WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match exists {
                Some(_) => BackendError::StrandTerminal(id),
                None => BackendError::StrandNotFound(id),
            });
        };

        Self::count_query(&self.query_counts, "update:pages_resolve_tag");
        Self::resolve_tag(&mut *tx, &strand_tag(id), now).await?;
        tx.commit().await?;
        Ok(Strand::from(row))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use serial_test::serial;
    use std::time::Duration;
    use uuid::Uuid;

    use super::super::test_helpers::setup_backend;
    use super::*;
    use crate::backends::{PageBackend, StrandBackend, Transition};
    use crate::page::NewPage;
    use crate::strand::{Frame, LeaseClaim, NewStrand, paused_until};

    #[serial(postgres)]
    #[tokio::test]
    async fn inspect_resume_clears_failure_and_resolves_page() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let new = NewStrand::new("Vm", "start", Frame::new())
            .with_deadline(Utc::now() - ChronoDuration::seconds(1));
        let id = new.id;
        backend.insert_strands(&[new]).await.expect("insert");

        let now = Utc::now();
        let lease = LeaseClaim::new(Uuid::new_v4(), now, Duration::from_secs(30));
        let claimed = backend
            .claim_due(&lease, now)
            .await
            .expect("claim")
            .expect("strand");
        let mut failed = Transition::from_claimed(&claimed);
        failed.retry_count = 4;
        failed.failed_at = Some(now);
        failed.scheduled_at = paused_until(now);
        failed.page = Some(NewPage::for_strand(
            &claimed.strand,
            "fatal",
            "boom",
            json!(null),
        ));
        backend.release(&lease, &failed, now).await.expect("release");
        assert_eq!(backend.list_pages(true, 10).await.expect("pages").len(), 1);

        let listed = backend
            .list_strands(&StrandFilter {
                failed_only: true,
                ..StrandFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);

        let later = now + ChronoDuration::seconds(5);
        let resumed = backend
            .resume(id, Some("retry_start"), later)
            .await
            .expect("resume");
        assert_eq!(resumed.label, "retry_start");
        assert_eq!(resumed.retry_count, 0);
        assert!(resumed.failed_at.is_none());
        assert!(resumed.deadline_at.is_none());
        assert!(resumed.is_due(later));
        assert!(backend.list_pages(true, 10).await.expect("pages").is_empty());
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn inspect_list_filters_by_prog_and_label() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        backend
            .insert_strands(&[
                NewStrand::new("Vm", "start", Frame::new()),
                NewStrand::new("Vm", "wait", Frame::new()),
                NewStrand::new("Subnet", "wait", Frame::new()),
            ])
            .await
            .expect("insert");

        let vms = backend
            .list_strands(&StrandFilter {
                prog: Some("Vm".to_string()),
                ..StrandFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(vms.len(), 2);

        let waiting = backend
            .list_strands(&StrandFilter {
                label: Some("wait".to_string()),
                ..StrandFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(waiting.len(), 2);
    }
}
