//! Durable record storage for resources and source groups.
//!
//! # Overview
//!
//! - [`ResourceStore`] - Data-access seam used by the import pipeline,
//!   proxy cache and reconciler
//! - [`SqliteStore`] - `SQLite`-backed implementation
//! - [`ResourceRecord`] / [`SourceGroup`] - Persisted rows
//!
//! `source_uri` is unique: [`ResourceStore::upsert`] resolves a duplicate
//! import to the existing record id instead of creating a second row.
//! `display_name` is unique too, so a proxy address names exactly one record.

mod error;
mod record;

pub use error::{StoreDbErrorKind, StoreError};
pub use record::{NewResource, NewSourceGroup, ResourceRecord, SourceGroup, StorageMode};

use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of an upsert keyed by `source_uri`.
#[derive(Debug, Clone)]
pub struct Upserted {
    /// The stored record after the write.
    pub record: ResourceRecord,
    /// True if a new row was inserted.
    pub created: bool,
}

/// Data-access contract for resource records and source groups.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Inserts a new record; fails with [`StoreError::DuplicateUri`] if the URI exists.
    async fn create(&self, resource: &NewResource<'_>) -> Result<ResourceRecord>;

    /// Inserts or refreshes the record for `resource.source_uri`, keeping its id.
    async fn upsert(&self, resource: &NewResource<'_>) -> Result<Upserted>;

    /// Writes all mutable fields of `record`.
    async fn update(&self, record: &ResourceRecord) -> Result<()>;

    /// Deletes a record; returns false if it did not exist.
    async fn delete(&self, id: i64) -> Result<bool>;

    async fn find_by_id(&self, id: i64) -> Result<Option<ResourceRecord>>;

    async fn find_by_uri(&self, uri: &str) -> Result<Option<ResourceRecord>>;

    async fn find_by_display_name(&self, name: &str) -> Result<Option<ResourceRecord>>;

    async fn find_by_group(&self, group_id: i64) -> Result<Vec<ResourceRecord>>;

    /// All records stored as references.
    async fn list_referenced(&self) -> Result<Vec<ResourceRecord>>;

    /// Clears `sync_marker` on every record of the group.
    async fn clear_sync_markers(&self, group_id: i64) -> Result<u64>;

    /// Confirms a record for a pass and (re)links it to the group.
    async fn mark_synced(&self, id: i64, group_id: i64, marker: i64) -> Result<()>;

    /// Records of the group not confirmed at or after `marker`.
    async fn find_unconfirmed(&self, group_id: i64, marker: i64) -> Result<Vec<ResourceRecord>>;

    async fn set_availability(&self, id: i64, available: bool) -> Result<()>;

    /// Clears `import_marker` on the given records.
    async fn clear_import_markers(&self, ids: &[i64]) -> Result<()>;

    async fn create_group(&self, group: &NewSourceGroup<'_>) -> Result<SourceGroup>;

    async fn find_group(&self, id: i64) -> Result<Option<SourceGroup>>;

    async fn list_groups(&self) -> Result<Vec<SourceGroup>>;

    /// Stamps a completed pass.
    async fn touch_group(&self, id: i64, synced_at: i64) -> Result<()>;
}

/// `SQLite` implementation of [`ResourceStore`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM resources")
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.get("n"))
    }
}

fn map_insert_error(err: sqlx::Error, resource: &NewResource<'_>) -> StoreError {
    let converted = StoreError::from(err);
    let StoreError::Database {
        kind: StoreDbErrorKind::ConstraintViolation,
        message,
    } = &converted
    else {
        return converted;
    };
    if message.contains("resources.display_name") {
        StoreError::DuplicateDisplayName {
            name: resource.display_name.to_string(),
        }
    } else if message.contains("resources.source_uri") {
        StoreError::DuplicateUri {
            uri: resource.source_uri.to_string(),
        }
    } else {
        converted
    }
}

fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::ResourceNotFound(id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    #[instrument(skip(self, resource), fields(uri = %resource.source_uri))]
    async fn create(&self, resource: &NewResource<'_>) -> Result<ResourceRecord> {
        sqlx::query_as::<_, ResourceRecord>(
            r"INSERT INTO resources (
                source_uri, display_name, mime_type, size_bytes, available, storage_mode,
                local_path, credentials, source_group_id, sync_marker, import_marker
              )
              VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?)
              RETURNING *",
        )
        .bind(resource.source_uri)
        .bind(resource.display_name)
        .bind(resource.mime_type)
        .bind(resource.size_bytes)
        .bind(resource.storage_mode.as_str())
        .bind(resource.local_path)
        .bind(resource.credentials)
        .bind(resource.source_group_id)
        .bind(resource.sync_marker)
        .bind(resource.import_marker)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| map_insert_error(e, resource))
    }

    #[instrument(skip(self, resource), fields(uri = %resource.source_uri))]
    async fn upsert(&self, resource: &NewResource<'_>) -> Result<Upserted> {
        let existed = self.find_by_uri(resource.source_uri).await?.is_some();

        // Group linkage and sync marker are only ever set here, never cleared.
        let record = sqlx::query_as::<_, ResourceRecord>(
            r"INSERT INTO resources (
                source_uri, display_name, mime_type, size_bytes, available, storage_mode,
                local_path, credentials, source_group_id, sync_marker, import_marker
              )
              VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(source_uri) DO UPDATE SET
                display_name = excluded.display_name,
                mime_type = excluded.mime_type,
                size_bytes = excluded.size_bytes,
                available = 1,
                storage_mode = excluded.storage_mode,
                local_path = excluded.local_path,
                credentials = excluded.credentials,
                source_group_id = COALESCE(excluded.source_group_id, resources.source_group_id),
                sync_marker = COALESCE(excluded.sync_marker, resources.sync_marker),
                import_marker = excluded.import_marker,
                updated_at = datetime('now')
              RETURNING *",
        )
        .bind(resource.source_uri)
        .bind(resource.display_name)
        .bind(resource.mime_type)
        .bind(resource.size_bytes)
        .bind(resource.storage_mode.as_str())
        .bind(resource.local_path)
        .bind(resource.credentials)
        .bind(resource.source_group_id)
        .bind(resource.sync_marker)
        .bind(resource.import_marker)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| map_insert_error(e, resource))?;

        Ok(Upserted {
            record,
            created: !existed,
        })
    }

    #[instrument(skip(self, record), fields(id = record.id))]
    async fn update(&self, record: &ResourceRecord) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE resources
              SET display_name = ?, mime_type = ?, size_bytes = ?, available = ?,
                  storage_mode = ?, local_path = ?, credentials = ?, source_group_id = ?,
                  sync_marker = ?, import_marker = ?, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(&record.display_name)
        .bind(&record.mime_type)
        .bind(record.size_bytes)
        .bind(record.available)
        .bind(record.storage_mode().as_str())
        .bind(record.local_path.as_deref())
        .bind(record.credentials.as_deref())
        .bind(record.source_group_id)
        .bind(record.sync_marker)
        .bind(record.import_marker)
        .bind(record.id)
        .execute(self.db.pool())
        .await?;

        check_affected(record.id, result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ResourceRecord>> {
        Ok(
            sqlx::query_as::<_, ResourceRecord>("SELECT * FROM resources WHERE id = ?")
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?,
        )
    }

    async fn find_by_uri(&self, uri: &str) -> Result<Option<ResourceRecord>> {
        Ok(
            sqlx::query_as::<_, ResourceRecord>("SELECT * FROM resources WHERE source_uri = ?")
                .bind(uri)
                .fetch_optional(self.db.pool())
                .await?,
        )
    }

    async fn find_by_display_name(&self, name: &str) -> Result<Option<ResourceRecord>> {
        Ok(
            sqlx::query_as::<_, ResourceRecord>("SELECT * FROM resources WHERE display_name = ?")
                .bind(name)
                .fetch_optional(self.db.pool())
                .await?,
        )
    }

    async fn find_by_group(&self, group_id: i64) -> Result<Vec<ResourceRecord>> {
        Ok(sqlx::query_as::<_, ResourceRecord>(
            "SELECT * FROM resources WHERE source_group_id = ? ORDER BY id ASC",
        )
        .bind(group_id)
        .fetch_all(self.db.pool())
        .await?)
    }

    async fn list_referenced(&self) -> Result<Vec<ResourceRecord>> {
        Ok(sqlx::query_as::<_, ResourceRecord>(
            "SELECT * FROM resources WHERE storage_mode = ? ORDER BY id ASC",
        )
        .bind(StorageMode::Referenced.as_str())
        .fetch_all(self.db.pool())
        .await?)
    }

    #[instrument(skip(self))]
    async fn clear_sync_markers(&self, group_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE resources SET sync_marker = NULL, updated_at = datetime('now')
             WHERE source_group_id = ?",
        )
        .bind(group_id)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn mark_synced(&self, id: i64, group_id: i64, marker: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resources SET sync_marker = ?, source_group_id = ?, updated_at = datetime('now')
             WHERE id = ?",
        )
        .bind(marker)
        .bind(group_id)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    async fn find_unconfirmed(&self, group_id: i64, marker: i64) -> Result<Vec<ResourceRecord>> {
        Ok(sqlx::query_as::<_, ResourceRecord>(
            r"SELECT * FROM resources
              WHERE source_group_id = ? AND (sync_marker IS NULL OR sync_marker < ?)
              ORDER BY id ASC",
        )
        .bind(group_id)
        .bind(marker)
        .fetch_all(self.db.pool())
        .await?)
    }

    async fn set_availability(&self, id: i64, available: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resources SET available = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(available)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    async fn clear_import_markers(&self, ids: &[i64]) -> Result<()> {
        for id in ids {
            sqlx::query("UPDATE resources SET import_marker = 0 WHERE id = ?")
                .bind(id)
                .execute(self.db.pool())
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, group), fields(name = %group.name))]
    async fn create_group(&self, group: &NewSourceGroup<'_>) -> Result<SourceGroup> {
        Ok(sqlx::query_as::<_, SourceGroup>(
            r"INSERT INTO source_groups (name, url, credentials, delete_unused, interval_secs)
              VALUES (?, ?, ?, ?, ?)
              RETURNING *",
        )
        .bind(group.name)
        .bind(group.url)
        .bind(group.credentials)
        .bind(group.delete_unused)
        .bind(group.interval_secs)
        .fetch_one(self.db.pool())
        .await?)
    }

    async fn find_group(&self, id: i64) -> Result<Option<SourceGroup>> {
        Ok(
            sqlx::query_as::<_, SourceGroup>("SELECT * FROM source_groups WHERE id = ?")
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?,
        )
    }

    async fn list_groups(&self) -> Result<Vec<SourceGroup>> {
        Ok(
            sqlx::query_as::<_, SourceGroup>("SELECT * FROM source_groups ORDER BY id ASC")
                .fetch_all(self.db.pool())
                .await?,
        )
    }

    async fn touch_group(&self, id: i64, synced_at: i64) -> Result<()> {
        let result = sqlx::query("UPDATE source_groups SET last_synced_at = ? WHERE id = ?")
            .bind(synced_at)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::GroupNotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_resource(uri: &str) -> NewResource<'_> {
        NewResource {
            source_uri: uri,
            display_name: uri.rsplit('/').next().unwrap_or(uri),
            mime_type: "application/pdf",
            size_bytes: 42,
            storage_mode: StorageMode::Referenced,
            local_path: None,
            credentials: None,
            source_group_id: None,
            sync_marker: None,
            import_marker: false,
        }
    }

    async fn store() -> SqliteStore {
        SqliteStore::new(Database::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_create_then_duplicate_is_rejected() {
        let store = store().await;
        let rec = store.create(&new_resource("https://e.com/a.pdf")).await.unwrap();
        assert!(rec.id > 0);
        assert!(rec.available);

        let mut again = new_resource("https://e.com/a.pdf");
        again.display_name = "copy.pdf";
        let err = store.create(&again).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUri { .. }));
    }

    #[tokio::test]
    async fn test_display_name_is_unique() {
        let store = store().await;
        store.create(&new_resource("https://e.com/one/a.pdf")).await.unwrap();

        let err = store
            .create(&new_resource("https://e.com/two/a.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDisplayName { name } if name == "a.pdf"));

        let err = store
            .upsert(&new_resource("https://e.com/two/a.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDisplayName { .. }));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_reuses_existing_id() {
        let store = store().await;
        let first = store.upsert(&new_resource("https://e.com/a.pdf")).await.unwrap();
        assert!(first.created);

        let mut again = new_resource("https://e.com/a.pdf");
        again.size_bytes = 99;
        let second = store.upsert(&again).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.size_bytes, 99);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_keeps_group_link_when_not_supplied() {
        let store = store().await;
        let group = store
            .create_group(&NewSourceGroup {
                name: "g",
                url: "file:///srv",
                credentials: None,
                delete_unused: true,
                interval_secs: 60,
            })
            .await
            .unwrap();

        let mut linked = new_resource("https://e.com/a.pdf");
        linked.source_group_id = Some(group.id);
        store.upsert(&linked).await.unwrap();

        let plain = store.upsert(&new_resource("https://e.com/a.pdf")).await.unwrap();
        assert_eq!(plain.record.source_group_id, Some(group.id));
    }

    #[tokio::test]
    async fn test_sync_markers_clear_mark_and_query() {
        let store = store().await;
        let group = store
            .create_group(&NewSourceGroup {
                name: "g",
                url: "file:///srv",
                credentials: None,
                delete_unused: true,
                interval_secs: 60,
            })
            .await
            .unwrap();

        let mut a = new_resource("file:///srv/a.pdf");
        a.source_group_id = Some(group.id);
        a.sync_marker = Some(10);
        let a = store.upsert(&a).await.unwrap().record;
        let mut b = new_resource("file:///srv/b.pdf");
        b.source_group_id = Some(group.id);
        b.sync_marker = Some(10);
        let b = store.upsert(&b).await.unwrap().record;

        assert_eq!(store.clear_sync_markers(group.id).await.unwrap(), 2);
        store.mark_synced(a.id, group.id, 20).await.unwrap();

        let stale = store.find_unconfirmed(group.id, 20).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, b.id);
    }

    #[tokio::test]
    async fn test_delete_and_lookup_by_display_name() {
        let store = store().await;
        let rec = store.create(&new_resource("https://e.com/a.pdf")).await.unwrap();
        assert_eq!(
            store.find_by_display_name("a.pdf").await.unwrap().unwrap().id,
            rec.id
        );
        assert!(store.delete(rec.id).await.unwrap());
        assert!(!store.delete(rec.id).await.unwrap());
        assert!(store.find_by_id(rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_availability_missing_record() {
        let store = store().await;
        let err = store.set_availability(404, false).await.unwrap_err();
        assert!(matches!(err, StoreError::ResourceNotFound(404)));
    }

    #[tokio::test]
    async fn test_touch_group_and_list() {
        let store = store().await;
        let group = store
            .create_group(&NewSourceGroup {
                name: "g",
                url: "https://e.com/files/",
                credentials: None,
                delete_unused: false,
                interval_secs: 3600,
            })
            .await
            .unwrap();
        assert!(group.last_synced_at.is_none());

        store.touch_group(group.id, 500).await.unwrap();
        let groups = store.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].last_synced_at, Some(500));
        assert!(matches!(
            store.touch_group(999, 1).await,
            Err(StoreError::GroupNotFound(999))
        ));
    }
}
