//! Content-addressed proxy cache for referenced resources.
//!
//! Entries live in the cache directory as `<sha256(source uri)>.<ext>`. An
//! entry is fresh while `now - mtime < ttl`; the mtime is stamped from the
//! injected [`Clock`] when the entry is written. Stale or missing entries are
//! refetched through the record's [`ProtocolHandler`](crate::protocol::ProtocolHandler)
//! and must pass two gates before replacing the entry:
//!
//! 1. the handler-reported mime type equals the record's stored type
//! 2. the sniffed content type equals the reported type
//!
//! A rejected refresh leaves the existing entry untouched; it is served as
//! stale when present.

mod error;

pub use error::CacheError;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::MirrorConfig;
use crate::credentials::{CredentialVault, hex_encode};
use crate::mime::{self, is_sniffable, sniff_mime};
use crate::naming;
use crate::protocol::{ProtocolRegistry, TempCopy};
use crate::store::{ResourceRecord, ResourceStore, StorageMode};

const SNIFF_LEN: u64 = 64;

/// Bytes ready to serve plus the response headers that go with them.
#[derive(Debug)]
pub struct CachedResponse {
    /// File the body is read from.
    pub path: PathBuf,
    pub content_type: String,
    pub content_disposition: String,
    pub content_length: u64,
    /// Open handle positioned at the start of the file.
    pub body: tokio::fs::File,
    /// True when a refresh failed and an expired entry is served instead.
    pub stale: bool,
}

/// Proxy cache over the configured cache directory.
pub struct ProxyCache {
    config: MirrorConfig,
    registry: Arc<ProtocolRegistry>,
    store: Arc<dyn ResourceStore>,
    vault: Arc<CredentialVault>,
    clock: Arc<dyn Clock>,
}

impl ProxyCache {
    #[must_use]
    pub fn new(
        config: MirrorConfig,
        registry: Arc<ProtocolRegistry>,
        store: Arc<dyn ResourceStore>,
        vault: Arc<CredentialVault>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            vault,
            clock,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.config.cache_dir
    }

    /// Cache key: hex SHA-256 of the source URI plus the type's extension.
    #[must_use]
    pub fn key_for(&self, record: &ResourceRecord) -> String {
        let digest = Sha256::digest(record.source_uri.as_bytes());
        let extension = self
            .config
            .mime_policy
            .extension_for(&record.mime_type)
            .unwrap_or_else(|| "bin".to_string());
        format!("{}.{extension}", hex_encode(&digest))
    }

    #[must_use]
    pub fn entry_path(&self, record: &ResourceRecord) -> PathBuf {
        self.config.cache_dir.join(self.key_for(record))
    }

    /// Byte-serving address for a record: `<proxy base>/<display name>`.
    #[must_use]
    pub fn address_for(&self, record: &ResourceRecord) -> String {
        format!(
            "{}/{}",
            self.config.proxy_base.trim_end_matches('/'),
            urlencoding::encode(&record.display_name)
        )
    }

    /// True if a fresh entry exists for the record.
    pub async fn is_cached(&self, record: &ResourceRecord) -> bool {
        self.is_fresh(record, &self.entry_path(record)).await
    }

    /// Returns the record's bytes, refreshing the cache entry when needed.
    ///
    /// Embedded records are served straight from the library.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unusable`] for unavailable or disallowed
    /// records, and the refresh error when no entry exists to fall back on.
    #[instrument(skip(self, record), fields(record_id = record.id, url = %record.source_uri))]
    pub async fn resolve(&self, record: &ResourceRecord) -> Result<CachedResponse, CacheError> {
        if !record.is_usable(&self.config.mime_policy) {
            return Err(CacheError::Unusable { id: record.id });
        }
        if record.storage_mode() == StorageMode::Embedded
            && let Some(path) = record.local_file()
        {
            return self.respond(record, path, false).await;
        }

        let entry = self.entry_path(record);
        if self.is_fresh(record, &entry).await {
            debug!(path = %entry.display(), "cache hit");
            return self.respond(record, entry, false).await;
        }

        match self.refresh(record, &entry).await {
            Ok(()) => {
                info!(path = %entry.display(), "cache refreshed");
                self.respond(record, entry, false).await
            }
            Err(error) => {
                if tokio::fs::try_exists(&entry).await.unwrap_or(false) {
                    warn!(error = %error, "cache refresh failed, serving stale copy");
                    self.respond(record, entry, true).await
                } else {
                    warn!(error = %error, "cache refresh failed");
                    Err(error)
                }
            }
        }
    }

    /// Resolves the record whose display name is `name` (percent-encoded or not).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] when no record carries the name.
    pub async fn serve_by_name(&self, name: &str) -> Result<CachedResponse, CacheError> {
        let decoded = urlencoding::decode(name)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| name.to_string());
        let record = self
            .store
            .find_by_display_name(&decoded)
            .await?
            .ok_or(CacheError::NotFound(decoded))?;
        self.resolve(&record).await
    }

    /// Deletes the record's cache entry; returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] when the file exists but cannot be removed.
    pub async fn invalidate(&self, record: &ResourceRecord) -> Result<bool, CacheError> {
        let entry = self.entry_path(record);
        match tokio::fs::remove_file(&entry).await {
            Ok(()) => {
                debug!(record_id = record.id, path = %entry.display(), "cache entry removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(entry, e)),
        }
    }

    /// Removes every file in the cache directory, fresh or not.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] on the first file that cannot be removed.
    #[instrument(skip(self))]
    pub async fn purge(&self) -> Result<usize, CacheError> {
        let dir = &self.config.cache_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::io(dir, e)),
        };
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(dir, e))?
        {
            let path = entry.path();
            if path.is_file() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| CacheError::io(&path, e))?;
                removed += 1;
            }
        }
        info!(removed, "cache purged");
        Ok(removed)
    }

    async fn is_fresh(&self, record: &ResourceRecord, entry: &Path) -> bool {
        let Ok(metadata) = tokio::fs::metadata(entry).await else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        let age = self
            .clock
            .now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        age < self.config.ttl_for(&record.mime_type)
    }

    async fn refresh(&self, record: &ResourceRecord, entry: &Path) -> Result<(), CacheError> {
        let credentials = self.vault.open(record.credentials.as_deref())?;
        let handler = self
            .registry
            .resolve_with_credentials(&record.source_uri, credentials)?;
        let temp = handler.fetch_temp_copy(&record.source_uri).await?;

        let outcome = match verify(record, &temp).await {
            Ok(()) => self.replace_entry(&temp.path, entry).await,
            Err(error) => Err(error),
        };
        temp.discard().await;
        outcome
    }

    async fn replace_entry(&self, source: &Path, entry: &Path) -> Result<(), CacheError> {
        let dir = &self.config.cache_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;

        // Concurrent refreshes each write their own part file; rename is atomic.
        let part = dir.join(format!(
            "{}.{:016x}.part",
            entry
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            rand::random::<u64>()
        ));
        let written = async {
            tokio::fs::copy(source, &part)
                .await
                .map_err(|e| CacheError::io(&part, e))?;
            stamp_mtime(&part, self.clock.now())
                .await
                .map_err(|e| CacheError::io(&part, e))?;
            tokio::fs::rename(&part, entry)
                .await
                .map_err(|e| CacheError::io(entry, e))
        }
        .await;
        if written.is_err() {
            let _ = tokio::fs::remove_file(&part).await;
        }
        written
    }

    async fn respond(
        &self,
        record: &ResourceRecord,
        path: PathBuf,
        stale: bool,
    ) -> Result<CachedResponse, CacheError> {
        let body = tokio::fs::File::open(&path)
            .await
            .map_err(|e| CacheError::io(&path, e))?;
        let content_length = body
            .metadata()
            .await
            .map_err(|e| CacheError::io(&path, e))?
            .len();

        let mut filename = naming::basename_from_url(&record.source_uri);
        if filename.trim().is_empty() {
            filename.clone_from(&record.display_name);
        }
        Ok(CachedResponse {
            path,
            content_type: record.mime_type.clone(),
            content_disposition: naming::content_disposition(&filename),
            content_length,
            body,
            stale,
        })
    }
}

async fn verify(record: &ResourceRecord, temp: &TempCopy) -> Result<(), CacheError> {
    let stored = mime::normalize_mime(&record.mime_type);
    let reported = mime::normalize_mime(&temp.mime_type);
    if reported != stored {
        return Err(CacheError::MimeChanged {
            url: record.source_uri.clone(),
            stored,
            reported,
        });
    }

    let head = read_head(&temp.path).await?;
    let sniffed = sniff_mime(&head);
    let consistent = match sniffed {
        Some(sniffed) => sniffed == reported,
        None => !is_sniffable(&reported),
    };
    if consistent {
        Ok(())
    } else {
        Err(CacheError::IntegrityMismatch {
            url: record.source_uri.clone(),
            claimed: reported,
            sniffed: sniffed.map(str::to_string),
        })
    }
}

async fn read_head(path: &Path) -> Result<Vec<u8>, CacheError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| CacheError::io(path, e))?;
    let mut head = Vec::with_capacity(64);
    file.take(SNIFF_LEN)
        .read_to_end(&mut head)
        .await
        .map_err(|e| CacheError::io(path, e))?;
    Ok(head)
}

async fn stamp_mtime(path: &Path, time: SystemTime) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_modified(time)
    })
    .await
    .map_err(io::Error::other)?
}
