//! Error types for protocol handlers.
//!
//! Transport errors are recorded per descriptor and never abort a batch;
//! [`UnsupportedTransport`] is the one per-call fatal condition.

use std::path::PathBuf;

use thiserror::Error;

use super::Transport;

/// Errors raised while listing, fetching or probing a remote source.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level failure (DNS, connection refused, TLS).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Credentials missing or rejected.
    #[error("[AUTH] authentication failed for {host} fetching {url}\n  Suggestion: {suggestion}")]
    AuthRequired {
        /// The URL that required authentication.
        url: String,
        /// Remote host.
        host: String,
        /// User-facing hint.
        suggestion: &'static str,
    },

    /// Remote path does not exist.
    #[error("remote file not found: {url}")]
    NotFound {
        /// The missing URL.
        url: String,
    },

    /// Local file system failure (temp files, file transport).
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// URL cannot be parsed or lacks required parts.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// Protocol-level failure reported by an FTP/SFTP session.
    #[error("{transport} error for {url}: {message}")]
    Remote {
        /// Transport that failed.
        transport: Transport,
        /// URL being processed.
        url: String,
        /// Session error text.
        message: String,
    },

    /// Transport support was not compiled in.
    #[error("{transport} support is not available in this build")]
    Unavailable {
        /// The missing transport.
        transport: Transport,
    },

    /// HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl TransportError {
    /// Creates a network error, promoting client timeouts to [`Self::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an authentication error.
    pub fn auth_required(url: impl Into<String>, host: impl Into<String>) -> Self {
        Self::AuthRequired {
            url: url.into(),
            host: host.into(),
            suggestion: "Check the login and secret stored for this source.",
        }
    }

    /// Creates a not-found error.
    pub fn not_found(url: impl Into<String>) -> Self {
        Self::NotFound { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a session error for FTP/SFTP.
    pub fn remote(transport: Transport, url: impl Into<String>, message: impl ToString) -> Self {
        Self::Remote {
            transport,
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Returns true for authentication failures.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRequired { .. })
    }
}

/// No registered handler is both compatible with and available for a URL.
#[derive(Debug, Clone, Error)]
#[error("no protocol handler available for '{url}'\n  Suggestion: {suggestion}")]
pub struct UnsupportedTransport {
    /// The URL that could not be handled.
    pub url: String,
    /// How to fix the issue.
    pub suggestion: String,
}

impl UnsupportedTransport {
    /// Creates the error for `url`.
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            suggestion: "Use a file://, ftp://, sftp://, http:// or https:// URL supported by this build"
                .to_string(),
        }
    }
}
