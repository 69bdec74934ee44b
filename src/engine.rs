//! Component wiring.
//!
//! [`Mirror::open`] constructs every component once and hands out shared
//! references; nothing in the crate looks components up globally.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::ProxyCache;
use crate::clock::Clock;
use crate::config::{ConfigError, MirrorConfig};
use crate::credentials::CredentialVault;
use crate::db::Database;
use crate::import::{
    DeferredQueue, ExecutionBudget, ImportObserver, ImportPipeline, PipelineDeps,
    SqliteDeferredQueue,
};
use crate::library::{BlobStore, Library};
use crate::protocol::{HandlerOptions, ProtocolRegistry, Transport, TransportError};
use crate::store::{ResourceStore, SqliteStore};
use crate::sync::SyncReconciler;

/// Errors from assembling the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The shared HTTP client could not be built.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cannot create directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Construction options beyond [`MirrorConfig`].
#[derive(Default)]
pub struct EngineOptions {
    /// Transports in resolution order; defaults to every transport.
    pub transports: Option<Vec<Transport>>,
    pub observers: Vec<Arc<dyn ImportObserver>>,
}

/// Fully wired engine.
pub struct Mirror {
    pub config: MirrorConfig,
    pub db: Database,
    pub store: Arc<dyn ResourceStore>,
    pub registry: Arc<ProtocolRegistry>,
    pub cache: Arc<ProxyCache>,
    pub library: Arc<Library>,
    pub pipeline: Arc<ImportPipeline>,
    pub reconciler: Arc<SyncReconciler>,
    pub deferred: Arc<SqliteDeferredQueue>,
    pub vault: Arc<CredentialVault>,
    pub clock: Arc<dyn Clock>,
}

impl Mirror {
    /// Wires every component with default options.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for invalid configuration, an unbuildable
    /// HTTP client or uncreatable data directories.
    pub async fn open(
        config: MirrorConfig,
        db: Database,
        vault: CredentialVault,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        Self::open_with(config, db, vault, clock, EngineOptions::default()).await
    }

    /// Wires every component.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub async fn open_with(
        config: MirrorConfig,
        db: Database,
        vault: CredentialVault,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        for dir in [&config.library_dir, &config.cache_dir, &config.temp_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| EngineError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }

        let handler_options = HandlerOptions::new(
            config.page_size,
            &config.temp_dir,
            config.connect_timeout,
            config.read_timeout,
        )?;
        let registry = Arc::new(match options.transports {
            Some(transports) => ProtocolRegistry::with_transports(transports, handler_options),
            None => ProtocolRegistry::new(handler_options),
        });

        let vault = Arc::new(vault);
        let store: Arc<dyn ResourceStore> = Arc::new(SqliteStore::new(db.clone()));
        let deferred = Arc::new(SqliteDeferredQueue::new(db.clone()));
        let blobs = BlobStore::new(&config.library_dir);

        let cache = Arc::new(ProxyCache::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&vault),
            Arc::clone(&clock),
        ));
        let library = Arc::new(Library::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&cache),
            blobs.clone(),
            Arc::clone(&vault),
        ));

        let budget = ExecutionBudget::new(
            config.execution_ceiling,
            config.safety_margin,
            Arc::clone(&clock),
        );
        let queue: Arc<dyn DeferredQueue> = deferred.clone();
        let mut pipeline = ImportPipeline::new(PipelineDeps {
            registry: Arc::clone(&registry),
            store: Arc::clone(&store),
            cache: Arc::clone(&cache),
            blobs,
            vault: Arc::clone(&vault),
            deferred: queue,
            policy: config.mime_policy.clone(),
            budget,
        });
        for observer in options.observers {
            pipeline = pipeline.with_observer(observer);
        }
        let pipeline = Arc::new(pipeline);

        let reconciler = Arc::new(SyncReconciler::new(
            Arc::clone(&pipeline),
            Arc::clone(&store),
            Arc::clone(&library),
            Arc::clone(&vault),
            Arc::clone(&clock),
        ));

        debug!(transports = ?registry.transports(), "engine wired");
        info!(
            library = %config.library_dir.display(),
            cache = %config.cache_dir.display(),
            "mirror engine ready"
        );
        Ok(Self {
            config,
            db,
            store,
            registry,
            cache,
            library,
            pipeline,
            reconciler,
            deferred,
            vault,
            clock,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_directories() {
        let dir = TempDir::new().unwrap();
        let config = MirrorConfig::rooted_at(dir.path());
        let mirror = Mirror::open(
            config,
            Database::new_in_memory().await.unwrap(),
            CredentialVault::from_key_material("k"),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        assert!(mirror.config.library_dir.is_dir());
        assert!(mirror.config.cache_dir.is_dir());
        assert!(mirror.config.temp_dir.is_dir());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = MirrorConfig::rooted_at(dir.path());
        config.execution_ceiling = Some(Duration::from_secs(1));
        let result = Mirror::open(
            config,
            Database::new_in_memory().await.unwrap(),
            CredentialVault::from_key_material("k"),
            Arc::new(SystemClock),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_open_with_restricted_transports() {
        let dir = TempDir::new().unwrap();
        let mirror = Mirror::open_with(
            MirrorConfig::rooted_at(dir.path()),
            Database::new_in_memory().await.unwrap(),
            CredentialVault::from_key_material("k"),
            Arc::new(SystemClock),
            EngineOptions {
                transports: Some(vec![Transport::File]),
                observers: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(mirror.registry.transports(), &[Transport::File]);
        assert!(mirror.registry.resolve("https://e.com/a.pdf").is_err());
    }
}
