//! Errors fatal to a whole import call.

use thiserror::Error;

use crate::credentials::VaultError;
use crate::protocol::UnsupportedTransport;
use crate::store::StoreError;

/// Errors that abort an import call. Per-descriptor problems are reported
/// as [`ImportFailure`](super::ImportFailure) results instead.
#[derive(Debug, Error)]
pub enum ImportError {
    /// No handler can serve the URL.
    #[error(transparent)]
    UnsupportedTransport(#[from] UnsupportedTransport),

    /// Credentials could not be sealed or opened.
    #[error("credential vault error: {0}")]
    Vault(#[from] VaultError),

    /// The deferred queue could not be written or read.
    #[error("deferred queue error: {0}")]
    Deferred(#[source] StoreError),
}
