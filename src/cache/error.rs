//! Proxy cache errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::credentials::VaultError;
use crate::protocol::{TransportError, UnsupportedTransport};
use crate::store::StoreError;

/// Errors from resolving or refreshing a cached copy.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The record is unavailable or its type is no longer allowed.
    #[error("resource #{id} is not usable")]
    Unusable {
        /// Record id.
        id: i64,
    },

    /// The remote now reports a different type than the record declares.
    #[error("mime type changed for {url}: stored {stored}, remote reports {reported}")]
    MimeChanged {
        url: String,
        stored: String,
        reported: String,
    },

    /// Content bytes do not match the claimed type.
    #[error("integrity mismatch for {url}: claimed {claimed}, content looks like {}", sniffed.as_deref().unwrap_or("unknown"))]
    IntegrityMismatch {
        url: String,
        claimed: String,
        sniffed: Option<String>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    UnsupportedTransport(#[from] UnsupportedTransport),

    #[error("credential vault error: {0}")]
    Vault(#[from] VaultError),

    /// Cache directory IO failed.
    #[error("cache IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No record carries the requested display name.
    #[error("no resource named '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the two refresh gates that reject fetched content.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::MimeChanged { .. } | Self::IntegrityMismatch { .. })
    }
}
