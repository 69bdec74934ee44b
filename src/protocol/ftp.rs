//! FTP transport.
//!
//! The FTP client is blocking; every session runs inside
//! `spawn_blocking`. Without the `ftp` feature the handler reports itself
//! unavailable and the registry skips it.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, instrument};
use url::Url;

use super::{
    HandlerOptions, ListCursor, Listing, ProtocolHandler, SourceDescriptor, TempCopy, Transport,
    TransportError, effective_mime, paginate, remove_temp_file, temp_file_path,
};
use crate::credentials::Credentials;
use crate::naming::basename_from_url;

const DEFAULT_PORT: u16 = 21;

/// Handler for `ftp://` URLs.
#[derive(Debug, Clone)]
pub struct FtpHandler {
    url: String,
    page_size: usize,
    temp_dir: PathBuf,
    credentials: Option<Credentials>,
}

/// Connection parameters parsed from an `ftp://` URL.
#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    host: String,
    port: u16,
    path: String,
    login: String,
    secret: String,
}

impl Endpoint {
    fn parse(url: &str, credentials: Option<&Credentials>) -> Result<Self, TransportError> {
        let parsed = Url::parse(url).map_err(|_| TransportError::invalid_url(url))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TransportError::invalid_url(url))?
            .to_string();
        let path = urlencoding::decode(parsed.path())
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| parsed.path().to_string());
        let (login, secret) = match credentials {
            Some(creds) => (creds.login.clone(), creds.secret().to_string()),
            None => ("anonymous".to_string(), "anonymous".to_string()),
        };
        Ok(Self {
            url: url.to_string(),
            host,
            port: parsed.port().unwrap_or(DEFAULT_PORT),
            path: if path.is_empty() { "/".to_string() } else { path },
            login,
            secret,
        })
    }

    fn url_for(&self, path: &str) -> String {
        let encoded: Vec<String> = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        let port = if self.port == DEFAULT_PORT {
            String::new()
        } else {
            format!(":{}", self.port)
        };
        format!("ftp://{}{}{}", self.host, port, encoded.join("/"))
    }
}

impl FtpHandler {
    /// Creates a handler for `url`.
    #[must_use]
    pub fn new(url: &str, options: &HandlerOptions) -> Self {
        Self {
            url: url.trim().to_string(),
            page_size: options.page_size,
            temp_dir: options.temp_dir.clone(),
            credentials: None,
        }
    }

    fn endpoint(&self, url: &str) -> Result<Endpoint, TransportError> {
        Endpoint::parse(url, self.credentials.as_ref())
    }
}

async fn blocking<T, F>(url: &str, operation: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| TransportError::remote(Transport::Ftp, url, e))?
}

#[async_trait]
impl ProtocolHandler for FtpHandler {
    fn transport(&self) -> Transport {
        Transport::Ftp
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn attach_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials.filter(|c| !c.is_empty());
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn list_remote_files(
        &self,
        cursor: Option<&ListCursor>,
    ) -> Result<Listing, TransportError> {
        let endpoint = self.endpoint(&self.url)?;
        let entries = blocking(&self.url, move || session::list(&endpoint)).await?;
        debug!(count = entries.len(), "listed FTP path");

        let endpoint = self.endpoint(&self.url)?;
        let (page, load_more) = paginate(entries, cursor, self.page_size);
        let descriptors = page
            .into_iter()
            .map(|(path, size)| {
                let url = endpoint.url_for(&path);
                let mime_type = effective_mime(None, &basename_from_url(&url));
                SourceDescriptor::new(url, mime_type, size, true)
            })
            .collect();
        Ok(Listing {
            descriptors,
            load_more,
        })
    }

    async fn fetch_temp_copy(&self, url: &str) -> Result<TempCopy, TransportError> {
        let endpoint = self.endpoint(url)?;
        let path = temp_file_path(&self.temp_dir);
        let target = path.clone();
        match blocking(url, move || session::download(&endpoint, &target)).await {
            Ok(size_bytes) => Ok(TempCopy {
                path,
                mime_type: effective_mime(None, &basename_from_url(url)),
                size_bytes,
            }),
            Err(error) => {
                remove_temp_file(&path).await;
                Err(error)
            }
        }
    }

    async fn check_availability(&self, url: &str) -> bool {
        let Ok(endpoint) = self.endpoint(url) else {
            return false;
        };
        blocking(url, move || session::size(&endpoint))
            .await
            .is_ok()
    }

    fn supports_hosting_switch(&self) -> bool {
        self.credentials.is_none()
    }
}

#[cfg(feature = "ftp")]
mod session {
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::path::Path;

    use suppaftp::FtpStream;
    use suppaftp::types::FileType;

    use super::{Endpoint, Transport, TransportError};

    fn remote(endpoint: &Endpoint, error: impl ToString) -> TransportError {
        TransportError::remote(Transport::Ftp, &endpoint.url, error)
    }

    fn connect(endpoint: &Endpoint) -> Result<FtpStream, TransportError> {
        let mut stream = FtpStream::connect((endpoint.host.as_str(), endpoint.port))
            .map_err(|e| remote(endpoint, e))?;
        stream
            .login(&endpoint.login, &endpoint.secret)
            .map_err(|_| TransportError::auth_required(&endpoint.url, &endpoint.host))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| remote(endpoint, e))?;
        Ok(stream)
    }

    /// `(path, size)` for a file, or for every file in a directory, sorted.
    pub(super) fn list(endpoint: &Endpoint) -> Result<Vec<(String, u64)>, TransportError> {
        let mut stream = connect(endpoint)?;
        let result = list_with(&mut stream, endpoint);
        let _ = stream.quit();
        result
    }

    fn list_with(
        stream: &mut FtpStream,
        endpoint: &Endpoint,
    ) -> Result<Vec<(String, u64)>, TransportError> {
        if !endpoint.path.ends_with('/') {
            let size = stream
                .size(&endpoint.path)
                .map_err(|_| TransportError::not_found(&endpoint.url))?;
            return Ok(vec![(endpoint.path.clone(), size as u64)]);
        }

        let names = stream
            .nlst(Some(&endpoint.path))
            .map_err(|e| remote(endpoint, e))?;
        let mut files = Vec::new();
        for name in names {
            let base = name.rsplit('/').next().unwrap_or(&name);
            if base.is_empty() || base == "." || base == ".." {
                continue;
            }
            let full = format!("{}{}", endpoint.path, base);
            // SIZE fails on directories.
            if let Ok(size) = stream.size(&full) {
                files.push((full, size as u64));
            }
        }
        files.sort();
        Ok(files)
    }

    pub(super) fn download(endpoint: &Endpoint, target: &Path) -> Result<u64, TransportError> {
        let mut stream = connect(endpoint)?;
        let result = (|| {
            let file = File::create(target).map_err(|e| TransportError::io(target, e))?;
            let mut writer = BufWriter::new(file);
            let mut data = stream
                .retr_as_stream(&endpoint.path)
                .map_err(|_| TransportError::not_found(&endpoint.url))?;
            let copied = std::io::copy(&mut data, &mut writer)
                .map_err(|e| TransportError::io(target, e))?;
            stream
                .finalize_retr_stream(data)
                .map_err(|e| remote(endpoint, e))?;
            writer.flush().map_err(|e| TransportError::io(target, e))?;
            Ok(copied)
        })();
        let _ = stream.quit();
        result
    }

    pub(super) fn size(endpoint: &Endpoint) -> Result<u64, TransportError> {
        let mut stream = connect(endpoint)?;
        let result = stream
            .size(&endpoint.path)
            .map(|s| s as u64)
            .map_err(|_| TransportError::not_found(&endpoint.url));
        let _ = stream.quit();
        result
    }
}

#[cfg(not(feature = "ftp"))]
mod session {
    use std::path::Path;

    use super::{Endpoint, Transport, TransportError};

    fn unavailable() -> TransportError {
        TransportError::Unavailable {
            transport: Transport::Ftp,
        }
    }

    pub(super) fn list(_endpoint: &Endpoint) -> Result<Vec<(String, u64)>, TransportError> {
        Err(unavailable())
    }

    pub(super) fn download(_endpoint: &Endpoint, _target: &Path) -> Result<u64, TransportError> {
        Err(unavailable())
    }

    pub(super) fn size(_endpoint: &Endpoint) -> Result<u64, TransportError> {
        Err(unavailable())
    }
}
