//! Per-call import state.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use super::result::{ImportOrigin, ImportProgress};
use crate::protocol::{ListCursor, SourceDescriptor};

/// Caller veto: returns a skip reason to leave a descriptor untouched.
pub type DescriptorVeto = Arc<dyn Fn(&SourceDescriptor) -> Option<String> + Send + Sync>;

/// What to do when a descriptor's URL already has a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Refresh the existing record in place, keeping its id.
    #[default]
    Update,
    /// Report the descriptor as skipped.
    Skip,
}

/// State threaded through one import call.
///
/// Reconciliation builds one with [`ImportContext::for_sync`]; everything it
/// sets lives only as long as the context value.
#[derive(Clone, Default)]
pub struct ImportContext {
    pub duplicates: DuplicatePolicy,
    pub veto: Option<DescriptorVeto>,
    pub origin: Option<ImportOrigin>,
    /// Group to link imported records to.
    pub source_group_id: Option<i64>,
    /// Marker stamped on every imported record.
    pub sync_marker: Option<i64>,
    /// Where listing starts; updated with the next page after each call.
    pub cursor: Option<ListCursor>,
    pub progress: Option<Arc<ImportProgress>>,
    /// Start of the run the execution budget is measured from. Set on the
    /// first import call when absent and kept across listing pages.
    pub started_at: Option<SystemTime>,
}

impl fmt::Debug for ImportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportContext")
            .field("duplicates", &self.duplicates)
            .field("veto", &self.veto.is_some())
            .field("origin", &self.origin())
            .field("source_group_id", &self.source_group_id)
            .field("sync_marker", &self.sync_marker)
            .field("cursor", &self.cursor)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl ImportContext {
    /// Context for a manual or programmatic import.
    #[must_use]
    pub fn user() -> Self {
        Self::default()
    }

    /// Context for one reconciliation pass over `group_id`.
    #[must_use]
    pub fn for_sync(group_id: i64, marker: i64, progress: Arc<ImportProgress>) -> Self {
        Self {
            duplicates: DuplicatePolicy::Update,
            veto: None,
            origin: Some(ImportOrigin::Sync),
            source_group_id: Some(group_id),
            sync_marker: Some(marker),
            cursor: None,
            progress: Some(progress),
            started_at: None,
        }
    }

    /// Measures the budget from `started` instead of the first import call.
    #[must_use]
    pub fn with_started_at(mut self, started: SystemTime) -> Self {
        self.started_at = Some(started);
        self
    }

    /// Adds a veto hook.
    #[must_use]
    pub fn with_veto(mut self, veto: DescriptorVeto) -> Self {
        self.veto = Some(veto);
        self
    }

    /// Sets the duplicate policy.
    #[must_use]
    pub fn with_duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    #[must_use]
    pub fn origin(&self) -> ImportOrigin {
        self.origin.unwrap_or(ImportOrigin::User)
    }

    pub(crate) fn vetoed(&self, descriptor: &SourceDescriptor) -> Option<String> {
        self.veto.as_ref().and_then(|veto| veto(descriptor))
    }
}
