//! Reconciliation of source groups against their remote collections.
//!
//! A pass clears the group's sync markers, imports every listing page with a
//! sync [`ImportContext`] that re-stamps each confirmed record, and only then
//! deletes records that were not confirmed. Deletion is skipped for passes
//! that did not see the whole listing: listing errors, empty listings and
//! passes stopped by the execution budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, unix_seconds};
use crate::credentials::{CredentialVault, VaultError};
use crate::import::{ImportContext, ImportError, ImportPipeline, ImportProgress, ImportSummary};
use crate::library::Library;
use crate::store::{ResourceStore, SourceGroup, StoreError};

/// Errors that abort a reconciliation pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source group {0} not found")]
    GroupNotFound(i64),

    /// Another pass over the same group is in progress.
    #[error("source group {0} is already being synced")]
    AlreadyRunning(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("credential vault error: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Import(#[from] ImportError),
}

/// Live progress of a running pass.
#[derive(Debug)]
pub struct SyncProgress {
    pub group_id: i64,
    /// When the pass began; the execution budget is measured from here.
    pub started_at: SystemTime,
    import: Arc<ImportProgress>,
    pages: AtomicUsize,
}

impl SyncProgress {
    fn new(group_id: i64, started_at: SystemTime) -> Self {
        Self {
            group_id,
            started_at,
            import: Arc::new(ImportProgress::new()),
            pages: AtomicUsize::new(0),
        }
    }

    /// Descriptors listed so far.
    #[must_use]
    pub fn total(&self) -> usize {
        self.import.total()
    }

    /// Descriptors finished so far.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.import.processed()
    }

    /// Listing pages imported so far.
    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages.load(Ordering::SeqCst)
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub group_id: i64,
    pub listed: usize,
    pub imported: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Listing pages imported.
    pub pages: usize,
    /// Ids of records removed as stale.
    pub deleted: Vec<i64>,
    /// The budget guard handed part of the listing to the deferred queue.
    pub deferred: bool,
    /// The listing failed or came back empty.
    pub aborted: bool,
}

impl SyncOutcome {
    fn absorb(&mut self, summary: &ImportSummary) {
        self.listed += summary.listed.len();
        self.imported += summary.imported_count();
        self.failed += summary.failed_count();
        self.skipped += summary.skipped_count();
    }

    /// True when the pass saw the whole listing.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.aborted && !self.deferred
    }
}

struct RunningGuard<'a> {
    running: &'a DashMap<i64, Arc<SyncProgress>>,
    group_id: i64,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.group_id);
    }
}

/// Runs reconciliation passes, at most one per group at a time.
pub struct SyncReconciler {
    pipeline: Arc<ImportPipeline>,
    store: Arc<dyn ResourceStore>,
    library: Arc<Library>,
    vault: Arc<CredentialVault>,
    clock: Arc<dyn Clock>,
    running: DashMap<i64, Arc<SyncProgress>>,
}

impl SyncReconciler {
    #[must_use]
    pub fn new(
        pipeline: Arc<ImportPipeline>,
        store: Arc<dyn ResourceStore>,
        library: Arc<Library>,
        vault: Arc<CredentialVault>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipeline,
            store,
            library,
            vault,
            clock,
            running: DashMap::new(),
        }
    }

    #[must_use]
    pub fn is_running(&self, group_id: i64) -> bool {
        self.running.contains_key(&group_id)
    }

    /// Progress of the running pass over `group_id`, if any.
    #[must_use]
    pub fn progress(&self, group_id: i64) -> Option<Arc<SyncProgress>> {
        self.running.get(&group_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Groups whose interval has elapsed at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when groups cannot be listed.
    pub async fn due_groups(&self, now: SystemTime) -> Result<Vec<SourceGroup>, StoreError> {
        let now = unix_seconds(now);
        Ok(self
            .store
            .list_groups()
            .await?
            .into_iter()
            .filter(|group| group.is_due(now))
            .collect())
    }

    /// Syncs a group against its own stored URL.
    ///
    /// # Errors
    ///
    /// See [`sync`](Self::sync).
    pub async fn sync_group(&self, group_id: i64) -> Result<SyncOutcome, SyncError> {
        let group = self
            .store
            .find_group(group_id)
            .await?
            .ok_or(SyncError::GroupNotFound(group_id))?;
        self.sync(&group.url, group_id).await
    }

    /// Runs one pass of `url` for `group_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadyRunning`] when a pass over the group is in
    /// progress, and [`SyncError::Import`] when an import call fails as a
    /// whole. Stale deletion never runs after an error.
    #[instrument(skip(self))]
    pub async fn sync(&self, url: &str, group_id: i64) -> Result<SyncOutcome, SyncError> {
        let group = self
            .store
            .find_group(group_id)
            .await?
            .ok_or(SyncError::GroupNotFound(group_id))?;
        let (progress, _guard) = self.begin(group_id)?;
        let credentials = self.vault.open(group.credentials.as_deref())?;

        let marker = unix_seconds(self.clock.now());
        let cleared = self.store.clear_sync_markers(group_id).await?;
        info!(group_id, url, marker, cleared, "sync pass started");

        let mut ctx = ImportContext::for_sync(group_id, marker, Arc::clone(&progress.import))
            .with_started_at(progress.started_at);
        let mut outcome = SyncOutcome {
            group_id,
            ..SyncOutcome::default()
        };
        loop {
            let summary = self
                .pipeline
                .import_with_context(url, credentials.as_ref(), &mut ctx)
                .await?;
            progress.pages.fetch_add(1, Ordering::SeqCst);
            outcome.pages += 1;
            self.confirm_listed(&summary, group_id, marker).await?;
            outcome.absorb(&summary);

            if summary.listing_failed {
                outcome.aborted = true;
                break;
            }
            if summary.is_deferred() {
                outcome.deferred = true;
                break;
            }
            if ctx.cursor.is_none() {
                break;
            }
            debug!(group_id, cursor = ?ctx.cursor, "continuing listing");
        }

        if group.delete_unused && outcome.is_complete() && outcome.listed > 0 {
            for record in self.store.find_unconfirmed(group_id, marker).await? {
                match self.library.delete_resource(record.id).await {
                    Ok(true) => {
                        info!(
                            group_id,
                            record_id = record.id,
                            url = %record.source_uri,
                            "stale resource deleted"
                        );
                        outcome.deleted.push(record.id);
                    }
                    Ok(false) => {}
                    Err(error) => {
                        warn!(
                            group_id,
                            record_id = record.id,
                            error = %error,
                            "failed to delete stale resource"
                        );
                    }
                }
            }
        } else if group.delete_unused {
            info!(
                group_id,
                aborted = outcome.aborted,
                deferred = outcome.deferred,
                "stale deletion skipped for incomplete pass"
            );
        }

        if outcome.is_complete() {
            self.store.touch_group(group_id, marker).await?;
        }
        info!(
            group_id,
            listed = outcome.listed,
            pages = outcome.pages,
            imported = outcome.imported,
            failed = outcome.failed,
            deleted = outcome.deleted.len(),
            "sync pass finished"
        );
        Ok(outcome)
    }

    fn begin(&self, group_id: i64) -> Result<(Arc<SyncProgress>, RunningGuard<'_>), SyncError> {
        match self.running.entry(group_id) {
            Entry::Occupied(_) => {
                warn!(group_id, "sync already running");
                Err(SyncError::AlreadyRunning(group_id))
            }
            Entry::Vacant(slot) => {
                let progress = Arc::new(SyncProgress::new(group_id, self.clock.now()));
                slot.insert(Arc::clone(&progress));
                Ok((
                    progress,
                    RunningGuard {
                        running: &self.running,
                        group_id,
                    },
                ))
            }
        }
    }

    /// Listed files that failed to import still exist upstream; keep their
    /// records out of stale deletion.
    async fn confirm_listed(
        &self,
        summary: &ImportSummary,
        group_id: i64,
        marker: i64,
    ) -> Result<(), StoreError> {
        for result in &summary.results {
            if result.is_imported() || !summary.listed.contains(&result.url) {
                continue;
            }
            if let Some(record) = self.store.find_by_uri(&result.url).await? {
                self.store.mark_synced(record.id, group_id, marker).await?;
            }
        }
        Ok(())
    }
}
