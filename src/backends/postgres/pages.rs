use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{PageRow, PostgresBackend};
use crate::backends::base::{BackendError, BackendResult, PageBackend};
use crate::page::{NewPage, Page};

const PAGE_COLUMNS: &str = "id, strand_id, tag, summary, details, created_at, resolved_at";

impl PostgresBackend {
    /// Insert a page unless an unresolved page with the same tag exists.
    pub(super) async fn insert_page(
        conn: &mut PgConnection,
        page: &NewPage,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<Page>> {
        let row: Option<PageRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO pages (id, strand_id, tag, summary, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tag) WHERE resolved_at IS NULL DO NOTHING
            RETURNING {PAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(page.strand_id.map(|id| id.0))
        .bind(page.tag.as_str())
        .bind(page.summary.as_str())
        .bind(&page.details)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(Page::from))
    }

    /// Resolve the open page for `tag`, if any.
    pub(super) async fn resolve_tag(
        conn: &mut PgConnection,
        tag: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        sqlx::query("UPDATE pages SET resolved_at = $2 WHERE tag = $1 AND resolved_at IS NULL")
            .bind(tag)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PageBackend for PostgresBackend {
    async fn list_pages(&self, unresolved_only: bool, limit: usize) -> BackendResult<Vec<Page>> {
        Self::count_query(&self.query_counts, "select:pages");
        let rows: Vec<PageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PAGE_COLUMNS}
            FROM pages
            WHERE NOT $1 OR resolved_at IS NULL
            ORDER BY created_at DESC, id
            LIMIT $2
            "#
        ))
        .bind(unresolved_only)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Page::from).collect())
    }

    async fn resolve_page(&self, page_id: Uuid, now: DateTime<Utc>) -> BackendResult<Page> {
        Self::count_query(&self.query_counts, "update:pages_resolve");
        let row: Option<PageRow> = sqlx::query_as(&format!(
            r#"
            UPDATE pages
            SET resolved_at = COALESCE(resolved_at, $2)
            WHERE id = $1
            RETURNING {PAGE_COLUMNS}
            "#
        ))
        .bind(page_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Page::from)
            .ok_or(BackendError::PageNotFound(page_id))
    }

    async fn raise_page(&self, page: &NewPage, now: DateTime<Utc>) -> BackendResult<Option<Page>> {
        Self::count_query(&self.query_counts, "insert:pages");
        let mut conn = self.pool.acquire().await?;
        Self::insert_page(&mut *conn, page, now).await
    }
}
