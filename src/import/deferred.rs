//! Persistence for descriptors handed off by the execution-budget guard.
//!
//! A deferred batch holds the untouched tail of a listing page plus the
//! original URL, sealed credentials and listing cursor, so a later worker
//! can finish the page without listing it again.

use async_trait::async_trait;
use sqlx::FromRow;
use tracing::instrument;

use crate::db::Database;
use crate::protocol::{ListCursor, SourceDescriptor};
use crate::store::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// Processing status of a deferred batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl DeferredStatus {
    /// Database string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Field set for handing off a batch.
#[derive(Debug, Clone)]
pub struct NewDeferredBatch<'a> {
    pub url: &'a str,
    pub credentials: Option<&'a [u8]>,
    pub descriptors: &'a [SourceDescriptor],
    pub source_group_id: Option<i64>,
    pub list_cursor: Option<ListCursor>,
}

/// A stored batch awaiting resumption.
#[derive(Debug, Clone)]
pub struct DeferredBatch {
    pub id: i64,
    /// URL the original import was called with.
    pub url: String,
    /// Sealed credentials.
    pub credentials: Option<Vec<u8>>,
    /// Unprocessed descriptors in listing order.
    pub descriptors: Vec<SourceDescriptor>,
    pub source_group_id: Option<i64>,
    /// Where listing continues after these descriptors.
    pub list_cursor: Option<ListCursor>,
    pub status: DeferredStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, FromRow)]
struct DeferredRow {
    id: i64,
    url: String,
    credentials: Option<Vec<u8>>,
    descriptors: String,
    source_group_id: Option<i64>,
    list_offset: Option<i64>,
    status: String,
    last_error: Option<String>,
}

impl TryFrom<DeferredRow> for DeferredBatch {
    type Error = StoreError;

    fn try_from(row: DeferredRow) -> Result<Self> {
        let descriptors: Vec<SourceDescriptor> =
            serde_json::from_str(&row.descriptors).map_err(|e| StoreError::CorruptPayload {
                id: row.id,
                message: e.to_string(),
            })?;
        Ok(Self {
            id: row.id,
            url: row.url,
            credentials: row.credentials,
            descriptors,
            source_group_id: row.source_group_id,
            list_cursor: row
                .list_offset
                .and_then(|o| usize::try_from(o).ok())
                .map(|offset| ListCursor { offset }),
            status: DeferredStatus::parse(&row.status),
            last_error: row.last_error,
        })
    }
}

/// Queue of deferred batches.
#[async_trait]
pub trait DeferredQueue: Send + Sync {
    /// Stores a batch; returns its id.
    async fn enqueue(&self, batch: &NewDeferredBatch<'_>) -> Result<i64>;

    /// Atomically claims the oldest pending batch.
    async fn claim_next(&self) -> Result<Option<DeferredBatch>>;

    async fn mark_completed(&self, id: i64) -> Result<()>;

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    /// Returns interrupted claims to pending; returns how many.
    async fn reset_in_progress(&self) -> Result<u64>;

    async fn count_by_status(&self, status: DeferredStatus) -> Result<i64>;
}

/// `SQLite`-backed [`DeferredQueue`].
#[derive(Debug, Clone)]
pub struct SqliteDeferredQueue {
    db: Database,
}

impl SqliteDeferredQueue {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetches a batch by id regardless of status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or payload failure.
    pub async fn get(&self, id: i64) -> Result<Option<DeferredBatch>> {
        sqlx::query_as::<_, DeferredRow>("SELECT * FROM deferred_imports WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .map(DeferredBatch::try_from)
            .transpose()
    }

    async fn set_status(&self, id: i64, status: DeferredStatus, error: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE deferred_imports
              SET status = ?, last_error = ?, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Database {
                kind: crate::store::StoreDbErrorKind::RowNotFound,
                message: format!("deferred batch {id} not found"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeferredQueue for SqliteDeferredQueue {
    #[instrument(skip(self, batch), fields(url = %batch.url, remaining = batch.descriptors.len()))]
    async fn enqueue(&self, batch: &NewDeferredBatch<'_>) -> Result<i64> {
        let descriptors =
            serde_json::to_string(batch.descriptors).map_err(|e| StoreError::CorruptPayload {
                id: 0,
                message: e.to_string(),
            })?;
        let list_offset = batch
            .list_cursor
            .and_then(|c| i64::try_from(c.offset).ok());
        let id: i64 = sqlx::query_scalar(
            r"INSERT INTO deferred_imports (url, credentials, descriptors, source_group_id, list_offset, status)
              VALUES (?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(batch.url)
        .bind(batch.credentials)
        .bind(descriptors)
        .bind(batch.source_group_id)
        .bind(list_offset)
        .bind(DeferredStatus::Pending.as_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn claim_next(&self) -> Result<Option<DeferredBatch>> {
        // Single UPDATE...RETURNING so two workers never claim the same batch.
        sqlx::query_as::<_, DeferredRow>(
            r"UPDATE deferred_imports
              SET status = ?, updated_at = datetime('now')
              WHERE id = (
                  SELECT id FROM deferred_imports
                  WHERE status = ?
                  ORDER BY created_at ASC, id ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .bind(DeferredStatus::InProgress.as_str())
        .bind(DeferredStatus::Pending.as_str())
        .fetch_optional(self.db.pool())
        .await?
        .map(DeferredBatch::try_from)
        .transpose()
    }

    async fn mark_completed(&self, id: i64) -> Result<()> {
        self.set_status(id, DeferredStatus::Completed, None).await
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        self.set_status(id, DeferredStatus::Failed, Some(error)).await
    }

    async fn reset_in_progress(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE deferred_imports
              SET status = ?, updated_at = datetime('now')
              WHERE status = ?",
        )
        .bind(DeferredStatus::Pending.as_str())
        .bind(DeferredStatus::InProgress.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_status(&self, status: DeferredStatus) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deferred_imports WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(self.db.pool())
                .await?;
        Ok(count)
    }
}
