//! Local filesystem transport.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};
use url::Url;

use super::{
    HandlerOptions, ListCursor, Listing, ProtocolHandler, SourceDescriptor, TempCopy, Transport,
    TransportError, effective_mime, paginate, temp_file_path,
};
use crate::credentials::Credentials;
use crate::mime;

/// Handler for `file://` URLs.
#[derive(Debug, Clone)]
pub struct FileHandler {
    url: String,
    page_size: usize,
    temp_dir: PathBuf,
}

impl FileHandler {
    /// Creates a handler for `url`.
    #[must_use]
    pub fn new(url: &str, options: &HandlerOptions) -> Self {
        Self {
            url: url.trim().to_string(),
            page_size: options.page_size,
            temp_dir: options.temp_dir.clone(),
        }
    }
}

fn to_path(url: &str) -> Result<PathBuf, TransportError> {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.to_file_path().ok())
        .ok_or_else(|| TransportError::invalid_url(url))
}

fn to_url(path: &Path) -> Result<String, TransportError> {
    Url::from_file_path(path)
        .map(String::from)
        .map_err(|()| TransportError::invalid_url(path.display().to_string()))
}

async fn sniffed_mime(path: &Path) -> Option<&'static str> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut head = [0_u8; 64];
    let read = file.read(&mut head).await.ok()?;
    mime::sniff_mime(&head[..read])
}

async fn describe(path: &Path, size_bytes: u64) -> Result<SourceDescriptor, TransportError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime_type = match mime::mime_from_name(&name) {
        Some(m) => m.to_string(),
        None => effective_mime(sniffed_mime(path).await, &name),
    };
    Ok(SourceDescriptor::new(to_url(path)?, mime_type, size_bytes, true))
}

#[async_trait]
impl ProtocolHandler for FileHandler {
    fn transport(&self) -> Transport {
        Transport::File
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn attach_credentials(&mut self, _credentials: Option<Credentials>) {}

    #[instrument(skip(self), fields(url = %self.url))]
    async fn list_remote_files(
        &self,
        cursor: Option<&ListCursor>,
    ) -> Result<Listing, TransportError> {
        let path = to_path(&self.url)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransportError::not_found(&self.url)
            } else {
                TransportError::io(&path, e)
            }
        })?;

        if metadata.is_file() {
            return Ok(Listing::single(describe(&path, metadata.len()).await?));
        }

        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| TransportError::io(&path, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TransportError::io(&path, e))?
        {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_file() {
                files.push((entry.path(), meta.len()));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(count = files.len(), "listed directory");

        let (page, load_more) = paginate(files, cursor, self.page_size);
        let mut descriptors = Vec::with_capacity(page.len());
        for (file_path, size) in page {
            descriptors.push(describe(&file_path, size).await?);
        }
        Ok(Listing {
            descriptors,
            load_more,
        })
    }

    async fn fetch_temp_copy(&self, url: &str) -> Result<TempCopy, TransportError> {
        let source = to_path(url)?;
        let target = temp_file_path(&self.temp_dir);
        let size_bytes = tokio::fs::copy(&source, &target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransportError::not_found(url)
            } else {
                TransportError::io(&source, e)
            }
        })?;
        let descriptor = describe(&source, size_bytes).await?;
        Ok(TempCopy {
            path: target,
            mime_type: descriptor.mime_type,
            size_bytes,
        })
    }

    async fn check_availability(&self, url: &str) -> bool {
        match to_path(url) {
            Ok(path) => tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file()),
            Err(_) => false,
        }
    }

    fn supports_hosting_switch(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tempfile::TempDir;

    fn options(temp: &Path, page_size: usize) -> HandlerOptions {
        HandlerOptions::new(page_size, temp, Duration::from_secs(5), Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_file_yields_one_descriptor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        let url = Url::from_file_path(&path).unwrap().to_string();

        let handler = FileHandler::new(&url, &options(dir.path(), 10));
        let listing = handler.list_remote_files(None).await.unwrap();
        assert_eq!(listing.descriptors.len(), 1);
        assert_eq!(listing.descriptors[0].mime_type, "application/pdf");
        assert_eq!(listing.descriptors[0].size_bytes, 8);
        assert!(listing.descriptors[0].should_be_local);
        assert!(listing.load_more.is_none());
    }

    #[tokio::test]
    async fn test_directory_listing_is_sorted_and_paginated() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        for name in ["c.txt", "a.txt", "b.txt"] {
            std::fs::write(src.join(name), name).unwrap();
        }
        std::fs::create_dir(src.join("nested")).unwrap();
        let url = Url::from_directory_path(&src).unwrap().to_string();

        let handler = FileHandler::new(&url, &options(dir.path(), 2));
        let first = handler.list_remote_files(None).await.unwrap();
        let names: Vec<String> = first
            .descriptors
            .iter()
            .map(|d| crate::naming::basename_from_url(&d.url))
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        let cursor = first.load_more.unwrap();

        let second = handler.list_remote_files(Some(&cursor)).await.unwrap();
        assert_eq!(second.descriptors.len(), 1);
        assert!(second.load_more.is_none());
    }

    #[tokio::test]
    async fn test_unknown_extension_is_sniffed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan");
        std::fs::write(&path, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]).unwrap();
        let url = Url::from_file_path(&path).unwrap().to_string();

        let handler = FileHandler::new(&url, &options(dir.path(), 10));
        let listing = handler.list_remote_files(None).await.unwrap();
        assert_eq!(listing.descriptors[0].mime_type, "image/png");
    }

    #[tokio::test]
    async fn test_fetch_temp_copy_and_availability() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let url = Url::from_file_path(&path).unwrap().to_string();
        let handler = FileHandler::new(&url, &options(dir.path(), 10));

        let copy = handler.fetch_temp_copy(&url).await.unwrap();
        assert_eq!(copy.size_bytes, 5);
        assert_eq!(copy.mime_type, "text/plain");
        assert_eq!(std::fs::read(&copy.path).unwrap(), b"hello");
        let temp = copy.path.clone();
        copy.discard().await;
        assert!(!temp.exists());

        assert!(handler.check_availability(&url).await);
        std::fs::remove_file(&path).unwrap();
        assert!(!handler.check_availability(&url).await);
    }

    #[tokio::test]
    async fn test_missing_path_is_not_found() {
        let dir = TempDir::new().unwrap();
        let url = Url::from_file_path(dir.path().join("nope.pdf"))
            .unwrap()
            .to_string();
        let handler = FileHandler::new(&url, &options(dir.path(), 10));
        let err = handler.list_remote_files(None).await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound { .. }));
    }
}
