//! Per-transport access to remote files.
//!
//! # Architecture
//!
//! - [`ProtocolHandler`] - Async trait implemented once per transport
//! - [`Transport`] - Closed set of supported transports; builds handlers
//! - [`ProtocolRegistry`] - Picks the first compatible, available handler
//! - [`SourceDescriptor`] / [`Listing`] - Listing output, never persisted as records
//! - [`TempCopy`] - Bytes fetched into a local temp file owned by the caller
//!
//! Handlers do not enforce mime-type policy; they report what the remote
//! claims and leave allow-listing to the import pipeline.

mod error;
mod file;
mod ftp;
mod http;
mod registry;
mod sftp;

pub use error::{TransportError, UnsupportedTransport};
pub use file::FileHandler;
pub use ftp::FtpHandler;
pub use http::HttpHandler;
pub use registry::ProtocolRegistry;
pub use sftp::SftpHandler;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credentials::Credentials;
use crate::mime;

/// Default number of descriptors returned per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Mime type reported when neither the remote nor the file name tells us more.
pub const FALLBACK_MIME: &str = "application/octet-stream";

const USER_AGENT: &str = concat!("mirror/", env!("CARGO_PKG_VERSION"));

/// Supported transports, in default resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Local filesystem (`file://`).
    File,
    /// FTP (`ftp://`).
    Ftp,
    /// SFTP over SSH (`sftp://`).
    Sftp,
    /// HTTP and HTTPS.
    Http,
}

impl Transport {
    /// All transports in default priority order.
    pub const ALL: [Transport; 4] = [Self::File, Self::Ftp, Self::Sftp, Self::Http];

    /// URL prefixes this transport accepts (lowercase).
    #[must_use]
    pub fn prefixes(self) -> &'static [&'static str] {
        match self {
            Self::File => &["file://"],
            Self::Ftp => &["ftp://"],
            Self::Sftp => &["sftp://"],
            Self::Http => &["http://", "https://"],
        }
    }

    /// Cheap prefix match, no I/O.
    #[must_use]
    pub fn matches(self, url: &str) -> bool {
        let url = url.trim();
        self.prefixes().iter().any(|prefix| {
            url.len() >= prefix.len() && url[..prefix.len()].eq_ignore_ascii_case(prefix)
        })
    }

    /// Whether support for this transport is compiled in.
    #[must_use]
    pub fn is_available(self) -> bool {
        match self {
            Self::File | Self::Http => true,
            Self::Ftp => cfg!(feature = "ftp"),
            Self::Sftp => cfg!(feature = "sftp"),
        }
    }

    /// Whether files fetched over this transport must be embedded.
    #[must_use]
    pub fn should_be_local(self) -> bool {
        !matches!(self, Self::Http)
    }

    /// Constructs a handler for `url`.
    #[must_use]
    pub fn handler(self, url: &str, options: &HandlerOptions) -> Box<dyn ProtocolHandler> {
        match self {
            Self::File => Box::new(FileHandler::new(url, options)),
            Self::Ftp => Box::new(FtpHandler::new(url, options)),
            Self::Sftp => Box::new(SftpHandler::new(url, options)),
            Self::Http => Box::new(HttpHandler::new(url, options)),
        }
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Ftp => "ftp",
            Self::Sftp => "sftp",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared settings handed to every handler the registry constructs.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Maximum descriptors per listing page.
    pub page_size: usize,
    /// Directory for temp copies.
    pub temp_dir: PathBuf,
    /// HTTP client reused across handlers.
    pub http: reqwest::Client,
}

impl HandlerOptions {
    /// Builds options with an HTTP client using the given timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Client`] if the HTTP client cannot be built.
    pub fn new(
        page_size: usize,
        temp_dir: impl Into<PathBuf>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .gzip(true)
            .user_agent(USER_AGENT)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self {
            page_size: page_size.max(1),
            temp_dir: temp_dir.into(),
            http,
        })
    }
}

/// Ephemeral per-file metadata produced by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Remote locator of the single file.
    pub url: String,
    /// Mime type claimed by the remote (or derived from the name).
    pub mime_type: String,
    /// Size in bytes, 0 when unknown.
    pub size_bytes: u64,
    /// Local copy fetched during listing, if any.
    #[serde(skip)]
    pub temp_file: Option<PathBuf>,
    /// Transport policy: bytes must be embedded.
    pub should_be_local: bool,
    /// File name the remote suggested, e.g. via `Content-Disposition`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_name: Option<String>,
}

impl SourceDescriptor {
    /// Creates a descriptor without a temp copy.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: u64,
        should_be_local: bool,
    ) -> Self {
        Self {
            url: url.into(),
            mime_type: mime::normalize_mime(&mime_type.into()),
            size_bytes,
            temp_file: None,
            should_be_local,
            suggested_name: None,
        }
    }

    /// Attaches the name the remote suggested for the file.
    #[must_use]
    pub fn with_suggested_name(mut self, name: Option<String>) -> Self {
        self.suggested_name = name;
        self
    }
}

/// Continuation point for a paginated listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCursor {
    /// Index of the first entry of the next page.
    pub offset: usize,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Descriptors in listing order.
    pub descriptors: Vec<SourceDescriptor>,
    /// Set when more entries remain after this page.
    pub load_more: Option<ListCursor>,
}

impl Listing {
    /// A listing of exactly one file.
    #[must_use]
    pub fn single(descriptor: SourceDescriptor) -> Self {
        Self {
            descriptors: vec![descriptor],
            load_more: None,
        }
    }
}

/// Splits a full, ordered entry list into the page starting at `cursor`.
pub(crate) fn paginate<T>(
    entries: Vec<T>,
    cursor: Option<&ListCursor>,
    page_size: usize,
) -> (Vec<T>, Option<ListCursor>) {
    let offset = cursor.map_or(0, |c| c.offset);
    let total = entries.len();
    let page: Vec<T> = entries.into_iter().skip(offset).take(page_size).collect();
    let next = offset + page.len();
    let load_more = (next < total).then_some(ListCursor { offset: next });
    (page, load_more)
}

/// A fetched local copy. The caller deletes it.
#[derive(Debug, Clone)]
pub struct TempCopy {
    /// Location of the bytes.
    pub path: PathBuf,
    /// Mime type claimed by the remote.
    pub mime_type: String,
    /// Bytes written.
    pub size_bytes: u64,
}

impl TempCopy {
    /// Removes the temp file, ignoring a file that is already gone.
    pub async fn discard(self) {
        remove_temp_file(&self.path).await;
    }
}

pub(crate) async fn remove_temp_file(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %error, "failed to remove temp file");
    }
}

/// Fresh, unused temp file path under `dir`.
pub(crate) fn temp_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("mirror-{:016x}.tmp", rand::random::<u64>()))
}

/// Prefers a specific remote mime type, falling back to the name.
pub(crate) fn effective_mime(claimed: Option<&str>, name: &str) -> String {
    let claimed = claimed.map(mime::normalize_mime).filter(|m| !m.is_empty());
    match claimed {
        Some(m) if m != FALLBACK_MIME => m,
        _ => mime::mime_from_name(name)
            .map(str::to_string)
            .or(claimed)
            .unwrap_or_else(|| FALLBACK_MIME.to_string()),
    }
}

/// Transport-specific access to one target URL.
///
/// Handlers are constructed per URL and per call; attached credentials are
/// never shared across resolutions.
///
/// # Object Safety
///
/// Uses `async_trait` so the registry can hand out `Box<dyn ProtocolHandler>`.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The transport this handler speaks.
    fn transport(&self) -> Transport;

    /// The target URL the handler was built for.
    fn url(&self) -> &str;

    /// Prefix match of the target URL against the transport, no I/O.
    fn is_compatible(&self) -> bool {
        self.transport().matches(self.url())
    }

    /// Environment capability check, independent of the URL.
    fn is_available(&self) -> bool {
        self.transport().is_available()
    }

    /// Attaches credentials for subsequent fetches; `None` clears them.
    fn attach_credentials(&mut self, credentials: Option<Credentials>);

    /// Lists the target: one descriptor for a file, one per file for a directory.
    async fn list_remote_files(
        &self,
        cursor: Option<&ListCursor>,
    ) -> Result<Listing, TransportError>;

    /// Downloads `url` into a new temp file.
    async fn fetch_temp_copy(&self, url: &str) -> Result<TempCopy, TransportError>;

    /// Lightweight liveness probe for an already-imported file.
    async fn check_availability(&self, url: &str) -> bool;

    /// Whether records on this transport may move between storage modes.
    fn supports_hosting_switch(&self) -> bool;
}
