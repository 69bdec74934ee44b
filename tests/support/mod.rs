//! Shared fixtures for integration tests: a temp-rooted engine on an
//! in-memory database with a manually driven clock.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mirror_core::{
    CredentialVault, Database, EngineOptions, ManualClock, Mirror, MirrorConfig, ResourceRecord,
};
use tempfile::TempDir;

/// Minimal PDF header; sniffs as `application/pdf`.
pub const PDF_BYTES: &[u8] = b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog >>\nendobj\ntrailer\n%%EOF\n";

/// PNG signature plus a stub IHDR chunk; sniffs as `image/png`.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x01\x00\x00\x00\x01";

/// Fixed starting instant for the manual clock.
pub fn epoch() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

/// Engine plus the directories and clock backing it.
pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub mirror: Mirror,
}

impl Harness {
    /// Engine with default settings and a frozen clock.
    pub async fn new() -> Self {
        Self::with_config(|_| {}, Arc::new(ManualClock::new(epoch()))).await
    }

    /// Engine whose config is adjusted by `tweak` before wiring.
    pub async fn with_config(
        tweak: impl FnOnce(&mut MirrorConfig),
        clock: Arc<ManualClock>,
    ) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = MirrorConfig::rooted_at(dir.path().join("data"));
        tweak(&mut config);
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create in-memory database");
        let mirror = Mirror::open_with(
            config,
            db,
            CredentialVault::from_key_material("integration-test-key"),
            clock.clone(),
            EngineOptions::default(),
        )
        .await
        .expect("Failed to open engine");
        Self { dir, clock, mirror }
    }

    /// Creates (or returns) a source directory under the temp root.
    pub fn source_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create source dir");
        path
    }

    /// Looks a record up by its source URL.
    pub async fn record(&self, url: &str) -> ResourceRecord {
        self.mirror
            .store
            .find_by_uri(url)
            .await
            .expect("store lookup failed")
            .unwrap_or_else(|| panic!("no record for {url}"))
    }
}

/// Writes `bytes` to `dir/name` and returns its `file://` URL.
pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("Failed to write source file");
    file_url(&path)
}

pub fn file_url(path: &Path) -> String {
    url::Url::from_file_path(path)
        .expect("absolute path")
        .to_string()
}

/// `file://` URL of a directory, with the trailing slash.
pub fn dir_url(path: &Path) -> String {
    url::Url::from_directory_path(path)
        .expect("absolute path")
        .to_string()
}
