//! Per-URL import results, batch summaries and lifecycle events.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::credentials::VaultError;
use crate::library::BlobError;
use crate::protocol::{ListCursor, TransportError};
use crate::store::{ResourceRecord, StorageMode, StoreError};

/// Why a single descriptor was not imported. Never fatal to the batch.
#[derive(Debug, Error)]
pub enum ImportFailure {
    /// Listing or fetching failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The mime type is not allow-listed.
    #[error("mime type '{mime_type}' is not allowed")]
    DisallowedMimeType {
        /// The rejected type.
        mime_type: String,
    },

    /// The record could not be written.
    #[error("failed to persist record: {0}")]
    Persistence(#[from] StoreError),

    /// Embedded bytes could not be stored.
    #[error("failed to store bytes: {0}")]
    Blob(#[from] BlobError),

    /// Credentials could not be sealed.
    #[error("failed to seal credentials: {0}")]
    Vault(#[from] VaultError),

    /// The listing returned nothing.
    #[error("no files found at {url}")]
    NoFilesFound {
        /// The listed URL.
        url: String,
    },
}

/// What happened to one URL.
#[derive(Debug)]
pub enum ImportOutcome {
    /// A record was created or refreshed.
    Imported {
        /// The record id.
        record_id: i64,
        /// True if the record did not exist before.
        created: bool,
        /// Storage mode chosen.
        storage_mode: StorageMode,
    },
    /// Deliberately not processed; not an error.
    Skipped {
        /// Human-readable reason.
        reason: String,
    },
    /// Processing failed.
    Failed(ImportFailure),
}

/// Itemized result for one URL.
#[derive(Debug)]
pub struct ImportResult {
    /// The descriptor URL (or listed URL for listing-level failures).
    pub url: String,
    pub outcome: ImportOutcome,
}

impl ImportResult {
    pub(crate) fn imported(
        url: &str,
        record_id: i64,
        created: bool,
        storage_mode: StorageMode,
    ) -> Self {
        Self {
            url: url.to_string(),
            outcome: ImportOutcome::Imported {
                record_id,
                created,
                storage_mode,
            },
        }
    }

    pub(crate) fn skipped(url: &str, reason: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            outcome: ImportOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub(crate) fn failed(url: &str, failure: impl Into<ImportFailure>) -> Self {
        Self {
            url: url.to_string(),
            outcome: ImportOutcome::Failed(failure.into()),
        }
    }

    /// Record id for imported results.
    #[must_use]
    pub fn record_id(&self) -> Option<i64> {
        match self.outcome {
            ImportOutcome::Imported { record_id, .. } => Some(record_id),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_imported(&self) -> bool {
        matches!(self.outcome, ImportOutcome::Imported { .. })
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, ImportOutcome::Failed(_))
    }

    /// Short label: `imported`, `skipped` or `error`.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self.outcome {
            ImportOutcome::Imported { .. } => "imported",
            ImportOutcome::Skipped { .. } => "skipped",
            ImportOutcome::Failed(_) => "error",
        }
    }
}

/// Handoff performed by the execution-budget guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredHandoff {
    /// Stored batch id.
    pub batch_id: i64,
    /// Descriptors handed off.
    pub remaining: usize,
}

/// Everything one import call produced.
#[derive(Debug, Default)]
pub struct ImportSummary {
    /// Itemized results, in listing order.
    pub results: Vec<ImportResult>,
    /// URLs of every descriptor the listing returned, processed or not.
    pub listed: HashSet<String>,
    /// Continuation for the next listing page.
    pub load_more: Option<ListCursor>,
    /// Set when the budget guard stopped the batch.
    pub deferred: Option<DeferredHandoff>,
    /// The listing itself failed or came back empty.
    pub listing_failed: bool,
}

impl ImportSummary {
    /// True iff at least one descriptor was imported.
    #[must_use]
    pub fn any_imported(&self) -> bool {
        self.results.iter().any(ImportResult::is_imported)
    }

    #[must_use]
    pub fn imported_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_imported()).count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_failed()).count()
    }

    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ImportOutcome::Skipped { .. }))
            .count()
    }

    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.deferred.is_some()
    }
}

/// Who triggered an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOrigin {
    /// Manual or programmatic add.
    User,
    /// Reconciliation pass.
    Sync,
}

/// Lifecycle events delivered to observers.
#[derive(Debug)]
pub enum ImportEvent<'a> {
    Imported {
        record: &'a ResourceRecord,
        created: bool,
        origin: ImportOrigin,
    },
    Skipped {
        url: &'a str,
        reason: &'a str,
        origin: ImportOrigin,
    },
    Failed {
        url: &'a str,
        failure: &'a ImportFailure,
        origin: ImportOrigin,
    },
    /// A multi-file batch finished; bulk markers have been cleared.
    BatchCompleted {
        record_ids: &'a [i64],
        origin: ImportOrigin,
    },
}

impl ImportEvent<'_> {
    #[must_use]
    pub fn origin(&self) -> ImportOrigin {
        match self {
            Self::Imported { origin, .. }
            | Self::Skipped { origin, .. }
            | Self::Failed { origin, .. }
            | Self::BatchCompleted { origin, .. } => *origin,
        }
    }
}

/// Receives import lifecycle events.
///
/// Observers that react to "new uploads" must ignore [`ImportOrigin::Sync`].
#[async_trait]
pub trait ImportObserver: Send + Sync {
    async fn on_event(&self, event: &ImportEvent<'_>);
}

/// Progress counters shared with the caller of an import.
#[derive(Debug, Default)]
pub struct ImportProgress {
    total: AtomicUsize,
    processed: AtomicUsize,
}

impl ImportProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptors seen so far.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Descriptors finished so far.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub(crate) fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn increment_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = ImportSummary::default();
        summary
            .results
            .push(ImportResult::imported("a", 1, true, StorageMode::Referenced));
        summary.results.push(ImportResult::skipped("b", "vetoed"));
        summary.results.push(ImportResult::failed(
            "c",
            ImportFailure::DisallowedMimeType {
                mime_type: "text/html".to_string(),
            },
        ));
        assert!(summary.any_imported());
        assert_eq!(summary.imported_count(), 1);
        assert_eq!(summary.skipped_count(), 1);
        assert_eq!(summary.failed_count(), 1);
        assert_eq!(summary.results[2].label(), "error");
        assert_eq!(summary.results[0].record_id(), Some(1));
    }

    #[test]
    fn test_progress_counters() {
        let progress = ImportProgress::new();
        progress.add_total(3);
        progress.increment_processed();
        assert_eq!(progress.total(), 3);
        assert_eq!(progress.processed(), 1);
    }
}
