//! Mirror Core Library
//!
//! Ingests remote files (local filesystem, FTP, SFTP, HTTP) into a managed
//! library, serves referenced files through a local proxy cache and keeps
//! source groups reconciled with their remote collections.
//!
//! # Architecture
//!
//! - [`protocol`] - Per-transport handlers and the handler registry
//! - [`import`] - Import pipeline, execution budget and deferred queue
//! - [`cache`] - Content-addressed proxy cache with integrity checks
//! - [`library`] - Embedded byte storage, deletion and hosting switches
//! - [`sync`] - Source group reconciliation
//! - [`store`] - Resource record and source group persistence
//! - [`engine`] - Wires the components together

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod import;
pub mod library;
pub mod mime;
pub mod naming;
pub mod protocol;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use cache::{CacheError, CachedResponse, ProxyCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MirrorConfig};
pub use credentials::{CredentialVault, Credentials, VaultError};
pub use db::{Database, DbError};
pub use engine::{EngineError, EngineOptions, Mirror};
pub use import::{
    ImportContext, ImportError, ImportEvent, ImportObserver, ImportOrigin, ImportPipeline,
    ImportSummary,
};
pub use library::{AvailabilityReport, HostingError, Library, LibraryError};
pub use mime::{MimePolicy, MimeRule};
pub use protocol::{
    ProtocolHandler, ProtocolRegistry, SourceDescriptor, Transport, TransportError,
    UnsupportedTransport,
};
pub use store::{ResourceRecord, ResourceStore, SourceGroup, SqliteStore, StorageMode, StoreError};
pub use sync::{SyncError, SyncOutcome, SyncReconciler};
