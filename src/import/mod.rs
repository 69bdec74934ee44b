//! Import pipeline: turns a URL into persisted resource records.
//!
//! # Flow
//!
//! 1. Resolve a [`ProtocolHandler`] for the URL and attach credentials
//! 2. List the target (one page, starting at the context cursor)
//! 3. For each descriptor: veto, mime allow-list, duplicate policy, storage
//!    mode, then create or refresh the record keyed by its URL
//! 4. Between descriptors, consult the [`ExecutionBudget`]; once it fires the
//!    untouched tail is handed to the [`DeferredQueue`] and the call returns
//!
//! Per-descriptor problems never abort the batch; they are reported as
//! [`ImportFailure`] results. Only resolution, vault and queue errors are
//! fatal ([`ImportError`]).

mod budget;
mod context;
mod deferred;
mod error;
mod result;

pub use budget::{BudgetTimer, ExecutionBudget};
pub use context::{DescriptorVeto, DuplicatePolicy, ImportContext};
pub use deferred::{
    DeferredBatch, DeferredQueue, DeferredStatus, NewDeferredBatch, SqliteDeferredQueue,
};
pub use error::ImportError;
pub use result::{
    DeferredHandoff, ImportEvent, ImportFailure, ImportObserver, ImportOrigin, ImportOutcome,
    ImportProgress, ImportResult, ImportSummary,
};

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cache::ProxyCache;
use crate::credentials::{CredentialVault, Credentials};
use crate::library::BlobStore;
use crate::mime::MimePolicy;
use crate::naming;
use crate::protocol::{
    ListCursor, Listing, ProtocolHandler, ProtocolRegistry, SourceDescriptor, TempCopy,
    remove_temp_file,
};
use crate::store::{NewResource, ResourceRecord, ResourceStore, StorageMode, StoreError};

/// Highest numeric suffix tried before falling back to a random one.
const MAX_NAME_SUFFIX: u32 = 999;

/// Collaborators the pipeline is built from.
pub struct PipelineDeps {
    pub registry: Arc<ProtocolRegistry>,
    pub store: Arc<dyn ResourceStore>,
    pub cache: Arc<ProxyCache>,
    pub blobs: BlobStore,
    pub vault: Arc<CredentialVault>,
    pub deferred: Arc<dyn DeferredQueue>,
    pub policy: MimePolicy,
    pub budget: ExecutionBudget,
}

/// Imports remote files into the store.
pub struct ImportPipeline {
    registry: Arc<ProtocolRegistry>,
    store: Arc<dyn ResourceStore>,
    cache: Arc<ProxyCache>,
    blobs: BlobStore,
    vault: Arc<CredentialVault>,
    deferred: Arc<dyn DeferredQueue>,
    policy: MimePolicy,
    budget: ExecutionBudget,
    observers: Vec<Arc<dyn ImportObserver>>,
}

enum Materialized {
    Record {
        record: ResourceRecord,
        created: bool,
    },
    Skipped(String),
}

impl ImportPipeline {
    #[must_use]
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            registry: deps.registry,
            store: deps.store,
            cache: deps.cache,
            blobs: deps.blobs,
            vault: deps.vault,
            deferred: deps.deferred,
            policy: deps.policy,
            budget: deps.budget,
            observers: Vec::new(),
        }
    }

    /// Registers an observer for lifecycle events.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ImportObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &MimePolicy {
        &self.policy
    }

    /// Imports everything on the first listing page of `url`.
    ///
    /// Returns true iff at least one descriptor was imported.
    ///
    /// # Errors
    ///
    /// See [`import_with_context`](Self::import_with_context).
    pub async fn import_from_url(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<bool, ImportError> {
        let mut ctx = ImportContext::user();
        let summary = self.import_with_context(url, credentials, &mut ctx).await?;
        Ok(summary.any_imported())
    }

    /// Imports one listing page of `url` under `ctx`.
    ///
    /// Listing starts at `ctx.cursor`; on return the cursor holds the next
    /// page, or `None` when the listing is exhausted or the batch was deferred.
    /// The budget is measured from `ctx.started_at`, which the first call
    /// sets, so a caller walking pages with one context is bounded as a whole.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError::UnsupportedTransport`] when no handler matches,
    /// [`ImportError::Vault`] when credentials cannot be sealed, and
    /// [`ImportError::Deferred`] when the budget fired and the handoff failed.
    #[instrument(skip(self, credentials, ctx), fields(origin = ?ctx.origin()))]
    pub async fn import_with_context(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
        ctx: &mut ImportContext,
    ) -> Result<ImportSummary, ImportError> {
        let mut handler = self.registry.resolve(url)?;
        handler.attach_credentials(credentials.cloned());
        ctx.started_at.get_or_insert_with(|| self.budget.now());

        let mut summary = ImportSummary::default();
        let listing = match handler.list_remote_files(ctx.cursor.as_ref()).await {
            Ok(listing) => listing,
            Err(error) => {
                warn!(url, error = %error, "listing failed");
                let result = ImportResult::failed(url, error);
                self.report_failure(&result, ctx).await;
                summary.results.push(result);
                summary.listing_failed = true;
                ctx.cursor = None;
                return Ok(summary);
            }
        };

        let Listing {
            descriptors,
            load_more,
        } = listing;
        if descriptors.is_empty() {
            info!(url, "listing returned no files");
            let result = ImportResult::failed(
                url,
                ImportFailure::NoFilesFound {
                    url: url.to_string(),
                },
            );
            self.report_failure(&result, ctx).await;
            summary.results.push(result);
            summary.listing_failed = true;
            ctx.cursor = None;
            return Ok(summary);
        }

        let sealed = self.vault.seal(credentials)?;
        self.process_batch(
            handler.as_ref(),
            url,
            descriptors,
            load_more,
            sealed.as_deref(),
            ctx,
            &mut summary,
        )
        .await?;
        ctx.cursor = summary.load_more;
        Ok(summary)
    }

    /// Claims and finishes the oldest pending deferred batch.
    ///
    /// Returns `None` when the queue is empty. The batch's listing cursor is
    /// returned as `load_more` so the caller can continue the listing.
    ///
    /// # Errors
    ///
    /// Returns [`ImportError`] when the queue cannot be read or the batch
    /// cannot be resumed; the batch is then marked failed.
    #[instrument(skip(self, ctx))]
    pub async fn resume_deferred(
        &self,
        ctx: &mut ImportContext,
    ) -> Result<Option<ImportSummary>, ImportError> {
        let Some(batch) = self
            .deferred
            .claim_next()
            .await
            .map_err(ImportError::Deferred)?
        else {
            debug!("no deferred batches pending");
            return Ok(None);
        };
        info!(
            batch_id = batch.id,
            url = %batch.url,
            remaining = batch.descriptors.len(),
            "resuming deferred batch"
        );

        match self.run_deferred(&batch, ctx).await {
            Ok(summary) => {
                self.deferred
                    .mark_completed(batch.id)
                    .await
                    .map_err(ImportError::Deferred)?;
                Ok(Some(summary))
            }
            Err(error) => {
                warn!(batch_id = batch.id, error = %error, "deferred batch failed");
                self.deferred
                    .mark_failed(batch.id, &error.to_string())
                    .await
                    .map_err(ImportError::Deferred)?;
                Err(error)
            }
        }
    }

    async fn run_deferred(
        &self,
        batch: &DeferredBatch,
        ctx: &mut ImportContext,
    ) -> Result<ImportSummary, ImportError> {
        let credentials = self.vault.open(batch.credentials.as_deref())?;
        let handler = self
            .registry
            .resolve_with_credentials(&batch.url, credentials)?;
        if ctx.source_group_id.is_none() {
            ctx.source_group_id = batch.source_group_id;
        }
        ctx.started_at.get_or_insert_with(|| self.budget.now());

        let mut summary = ImportSummary::default();
        self.process_batch(
            handler.as_ref(),
            &batch.url,
            batch.descriptors.clone(),
            batch.list_cursor,
            batch.credentials.as_deref(),
            ctx,
            &mut summary,
        )
        .await?;
        ctx.cursor = summary.load_more;
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_batch(
        &self,
        handler: &dyn ProtocolHandler,
        url: &str,
        descriptors: Vec<SourceDescriptor>,
        load_more: Option<ListCursor>,
        sealed: Option<&[u8]>,
        ctx: &ImportContext,
        summary: &mut ImportSummary,
    ) -> Result<(), ImportError> {
        summary
            .listed
            .extend(descriptors.iter().map(|d| d.url.clone()));
        if let Some(progress) = &ctx.progress {
            progress.add_total(descriptors.len());
        }

        let bulk = descriptors.len() > 1;
        let timer = match ctx.started_at {
            Some(started) => self.budget.start_at(started),
            None => self.budget.start(),
        };
        let mut imported_ids = Vec::new();

        for (index, descriptor) in descriptors.iter().enumerate() {
            if timer.is_exhausted() {
                let remaining = &descriptors[index..];
                let batch_id = self
                    .deferred
                    .enqueue(&NewDeferredBatch {
                        url,
                        credentials: sealed,
                        descriptors: remaining,
                        source_group_id: ctx.source_group_id,
                        list_cursor: load_more,
                    })
                    .await
                    .map_err(ImportError::Deferred)?;
                for leftover in remaining {
                    if let Some(temp) = &leftover.temp_file {
                        remove_temp_file(temp).await;
                    }
                }
                warn!(
                    url,
                    batch_id,
                    processed = index,
                    remaining = remaining.len(),
                    elapsed_ms = timer.elapsed().as_millis(),
                    "execution budget reached, deferring remaining files"
                );
                summary.deferred = Some(DeferredHandoff {
                    batch_id,
                    remaining: remaining.len(),
                });
                break;
            }

            let result = self.import_descriptor(handler, descriptor, bulk, sealed, ctx).await;
            if let Some(progress) = &ctx.progress {
                progress.increment_processed();
            }
            if let Some(id) = result.record_id() {
                imported_ids.push(id);
            }
            summary.results.push(result);
        }

        if bulk && !imported_ids.is_empty() {
            if let Err(error) = self.store.clear_import_markers(&imported_ids).await {
                warn!(error = %error, "failed to clear bulk import markers");
            }
            self.notify(&ImportEvent::BatchCompleted {
                record_ids: &imported_ids,
                origin: ctx.origin(),
            })
            .await;
        }

        summary.load_more = if summary.deferred.is_some() {
            None
        } else {
            load_more
        };
        Ok(())
    }

    async fn import_descriptor(
        &self,
        handler: &dyn ProtocolHandler,
        descriptor: &SourceDescriptor,
        bulk: bool,
        sealed: Option<&[u8]>,
        ctx: &ImportContext,
    ) -> ImportResult {
        let origin = ctx.origin();
        match self.materialize(handler, descriptor, bulk, sealed, ctx).await {
            Ok(Materialized::Record { record, created }) => {
                info!(
                    url = %descriptor.url,
                    record_id = record.id,
                    storage_mode = %record.storage_mode(),
                    created,
                    "imported"
                );
                self.notify(&ImportEvent::Imported {
                    record: &record,
                    created,
                    origin,
                })
                .await;
                ImportResult::imported(&descriptor.url, record.id, created, record.storage_mode())
            }
            Ok(Materialized::Skipped(reason)) => {
                debug!(url = %descriptor.url, reason = %reason, "skipped");
                self.notify(&ImportEvent::Skipped {
                    url: &descriptor.url,
                    reason: &reason,
                    origin,
                })
                .await;
                ImportResult::skipped(&descriptor.url, reason)
            }
            Err(failure) => {
                warn!(url = %descriptor.url, error = %failure, "import failed");
                let result = ImportResult::failed(&descriptor.url, failure);
                self.report_failure(&result, ctx).await;
                result
            }
        }
    }

    async fn materialize(
        &self,
        handler: &dyn ProtocolHandler,
        descriptor: &SourceDescriptor,
        bulk: bool,
        sealed: Option<&[u8]>,
        ctx: &ImportContext,
    ) -> Result<Materialized, ImportFailure> {
        if let Some(reason) = ctx.vetoed(descriptor) {
            discard_listing_copy(descriptor).await;
            return Ok(Materialized::Skipped(reason));
        }
        if !self.policy.is_allowed(&descriptor.mime_type) {
            discard_listing_copy(descriptor).await;
            return Err(ImportFailure::DisallowedMimeType {
                mime_type: descriptor.mime_type.clone(),
            });
        }

        let existing = self.store.find_by_uri(&descriptor.url).await?;
        if existing.is_some() && ctx.duplicates == DuplicatePolicy::Skip {
            discard_listing_copy(descriptor).await;
            return Ok(Materialized::Skipped("already imported".to_string()));
        }
        let previous_file = existing.as_ref().and_then(ResourceRecord::local_file);

        let wanted = match &descriptor.suggested_name {
            Some(name) => naming::display_name_from(name, &descriptor.mime_type, &self.policy),
            None => naming::display_name(&descriptor.url, &descriptor.mime_type, &self.policy),
        };
        let display_name = self.unique_display_name(wanted, existing.as_ref()).await?;
        let embed = descriptor.should_be_local || self.policy.forces_local(&descriptor.mime_type);

        let (storage_mode, stored_file, size_bytes) = if embed {
            let temp = match &descriptor.temp_file {
                Some(path) => TempCopy {
                    path: path.clone(),
                    mime_type: descriptor.mime_type.clone(),
                    size_bytes: descriptor.size_bytes,
                },
                None => handler.fetch_temp_copy(&descriptor.url).await?,
            };
            let size = temp.size_bytes;
            let stored = match self
                .blobs
                .persist(&temp.path, &display_name, previous_file.as_deref())
                .await
            {
                Ok(path) => path,
                Err(error) => {
                    temp.discard().await;
                    return Err(error.into());
                }
            };
            (StorageMode::Embedded, Some(stored), size)
        } else {
            (StorageMode::Referenced, None, descriptor.size_bytes)
        };

        let local_path = stored_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let upserted = self
            .store
            .upsert(&NewResource {
                source_uri: &descriptor.url,
                display_name: &display_name,
                mime_type: &descriptor.mime_type,
                size_bytes: i64::try_from(size_bytes).unwrap_or(i64::MAX),
                storage_mode,
                local_path: local_path.as_deref(),
                credentials: sealed,
                source_group_id: ctx.source_group_id,
                sync_marker: ctx.sync_marker,
                import_marker: bulk,
            })
            .await;
        let upserted = match upserted {
            Ok(upserted) => upserted,
            Err(error) => {
                if let Some(path) = &stored_file
                    && previous_file.as_ref() != Some(path)
                {
                    let _ = self.blobs.remove(path).await;
                }
                return Err(error.into());
            }
        };

        if let Some(previous) = &previous_file
            && stored_file.as_ref() != Some(previous)
            && let Err(error) = self.blobs.remove(previous).await
        {
            warn!(error = %error, "failed to remove superseded library file");
        }

        if !upserted.created
            && upserted.record.storage_mode() == StorageMode::Referenced
            && let Err(error) = self.cache.invalidate(&upserted.record).await
        {
            warn!(
                record_id = upserted.record.id,
                error = %error,
                "failed to invalidate cache entry"
            );
        }

        Ok(Materialized::Record {
            record: upserted.record,
            created: upserted.created,
        })
    }

    /// Picks a display name no other record holds: `a.pdf`, then `a_2.pdf`,
    /// `a_3.pdf`, ... A refreshed record keeps its current variant.
    async fn unique_display_name(
        &self,
        wanted: String,
        existing: Option<&ResourceRecord>,
    ) -> Result<String, StoreError> {
        if let Some(record) = existing
            && naming::is_numbered_variant(&record.display_name, &wanted)
        {
            return Ok(record.display_name.clone());
        }
        let mut candidate = wanted.clone();
        for n in 2..=MAX_NAME_SUFFIX {
            match self.store.find_by_display_name(&candidate).await? {
                None => return Ok(candidate),
                Some(holder) if existing.is_some_and(|r| r.id == holder.id) => {
                    return Ok(candidate);
                }
                Some(_) => candidate = naming::suffixed_name(&wanted, n),
            }
        }
        if self.store.find_by_display_name(&candidate).await?.is_none() {
            return Ok(candidate);
        }
        Ok(naming::suffixed_name(
            &wanted,
            format!("{:08x}", rand::random::<u32>()),
        ))
    }

    async fn report_failure(&self, result: &ImportResult, ctx: &ImportContext) {
        if let ImportOutcome::Failed(failure) = &result.outcome {
            self.notify(&ImportEvent::Failed {
                url: &result.url,
                failure,
                origin: ctx.origin(),
            })
            .await;
        }
    }

    async fn notify(&self, event: &ImportEvent<'_>) {
        for observer in &self.observers {
            observer.on_event(event).await;
        }
    }
}

async fn discard_listing_copy(descriptor: &SourceDescriptor) {
    if let Some(temp) = &descriptor.temp_file {
        remove_temp_file(temp).await;
    }
}
