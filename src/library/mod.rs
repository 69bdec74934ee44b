//! Record lifecycle operations outside of import: deletion, hosting switch
//! and availability sweeps.

mod blob;

pub use blob::{BlobError, BlobStore};

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheError, ProxyCache};
use crate::credentials::{CredentialVault, VaultError};
use crate::protocol::{ProtocolRegistry, Transport, TransportError, UnsupportedTransport};
use crate::store::{ResourceRecord, ResourceStore, StorageMode, StoreError};

/// Errors from deleting a record.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Errors from moving a record between storage modes.
#[derive(Debug, Error)]
pub enum HostingError {
    #[error("resource #{0} not found")]
    NotFound(i64),

    /// Referenced records with credentials must stay referenced.
    #[error("resource #{id} carries credentials and is pinned to referenced hosting")]
    Pinned { id: i64 },

    /// The record's transport cannot move between modes.
    #[error("{transport} transport does not allow changing hosting of resource #{id}")]
    Unsupported { id: i64, transport: Transport },

    #[error(transparent)]
    UnsupportedTransport(#[from] UnsupportedTransport),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("credential vault error: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Result of one availability sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub checked: usize,
    pub available: usize,
    /// Ids of records found unavailable.
    pub unavailable: Vec<i64>,
}

/// Operations over stored records and their bytes.
pub struct Library {
    store: Arc<dyn ResourceStore>,
    registry: Arc<ProtocolRegistry>,
    cache: Arc<ProxyCache>,
    blobs: BlobStore,
    vault: Arc<CredentialVault>,
}

impl Library {
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<ProtocolRegistry>,
        cache: Arc<ProxyCache>,
        blobs: BlobStore,
        vault: Arc<CredentialVault>,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            blobs,
            vault,
        }
    }

    /// Deletes a record together with its library file and cache entry.
    ///
    /// Returns false when no record has this id.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError`] when any of the three removals fails; the
    /// record row is removed last so a failed file removal can be retried.
    #[instrument(skip(self))]
    pub async fn delete_resource(&self, id: i64) -> Result<bool, LibraryError> {
        let Some(record) = self.store.find_by_id(id).await? else {
            debug!(id, "delete requested for unknown resource");
            return Ok(false);
        };

        self.cache.invalidate(&record).await?;
        if let Some(path) = record.local_file() {
            self.blobs.remove(&path).await?;
        }
        let deleted = self.store.delete(id).await?;
        info!(id, url = %record.source_uri, "resource deleted");
        Ok(deleted)
    }

    /// Moves a record to `target` storage.
    ///
    /// # Errors
    ///
    /// Returns [`HostingError::Pinned`] or [`HostingError::Unsupported`] when
    /// the move is not allowed, otherwise the failing fetch or write.
    #[instrument(skip(self))]
    pub async fn switch_hosting(
        &self,
        id: i64,
        target: StorageMode,
    ) -> Result<ResourceRecord, HostingError> {
        let mut record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(HostingError::NotFound(id))?;
        if record.storage_mode() == target {
            return Ok(record);
        }
        if record.is_hosting_pinned() {
            return Err(HostingError::Pinned { id });
        }

        let credentials = self.vault.open(record.credentials.as_deref())?;
        let handler = self
            .registry
            .resolve_with_credentials(&record.source_uri, credentials)?;
        if !handler.supports_hosting_switch() {
            return Err(HostingError::Unsupported {
                id,
                transport: handler.transport(),
            });
        }

        match target {
            StorageMode::Referenced => {
                let previous = record.local_file();
                record.storage_mode_str = StorageMode::Referenced.as_str().to_string();
                record.local_path = None;
                self.store.update(&record).await?;
                if let Some(path) = previous {
                    self.blobs.remove(&path).await?;
                }
            }
            StorageMode::Embedded => {
                let temp = handler.fetch_temp_copy(&record.source_uri).await?;
                let stored = match self
                    .blobs
                    .persist(&temp.path, &record.display_name, None)
                    .await
                {
                    Ok(path) => path,
                    Err(error) => {
                        temp.discard().await;
                        return Err(error.into());
                    }
                };
                record.storage_mode_str = StorageMode::Embedded.as_str().to_string();
                record.local_path = Some(stored.to_string_lossy().into_owned());
                record.size_bytes = i64::try_from(temp.size_bytes).unwrap_or(i64::MAX);
                if let Err(error) = self.store.update(&record).await {
                    let _ = self.blobs.remove(&stored).await;
                    return Err(error.into());
                }
                self.cache.invalidate(&record).await?;
            }
        }

        info!(id, mode = %target, "hosting switched");
        Ok(record)
    }

    /// Probes every referenced record and stores the result.
    ///
    /// Records whose handler or credentials cannot be resolved are counted
    /// as unavailable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when records cannot be listed or updated.
    #[instrument(skip(self))]
    pub async fn check_availability(&self) -> Result<AvailabilityReport, StoreError> {
        let mut report = AvailabilityReport::default();
        for record in self.store.list_referenced().await? {
            report.checked += 1;
            let available = self.probe(&record).await;
            if available {
                report.available += 1;
            } else {
                report.unavailable.push(record.id);
            }
            if available != record.available {
                info!(id = record.id, available, url = %record.source_uri, "availability changed");
                self.store.set_availability(record.id, available).await?;
            }
        }
        Ok(report)
    }

    async fn probe(&self, record: &ResourceRecord) -> bool {
        let credentials = match self.vault.open(record.credentials.as_deref()) {
            Ok(credentials) => credentials,
            Err(error) => {
                warn!(id = record.id, error = %error, "cannot open stored credentials");
                return false;
            }
        };
        match self
            .registry
            .resolve_with_credentials(&record.source_uri, credentials)
        {
            Ok(handler) => handler.check_availability(&record.source_uri).await,
            Err(error) => {
                warn!(id = record.id, error = %error, "no handler for availability check");
                false
            }
        }
    }
}
