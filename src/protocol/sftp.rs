//! SFTP transport (password authentication).
//!
//! Built on the blocking `ssh2` bindings and only available with the `sftp`
//! feature.

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

const DEFAULT_PORT: u16 = 22;

/// Handler for `sftp://` URLs.
#[derive(Debug, Clone)]
pub struct SftpHandler {
    url: String,
    page_size: usize,
    temp_dir: PathBuf,
    credentials: Option<Credentials>,
}

#[derive(Clone)]
struct Endpoint {
    url: String,
    host: String,
    port: u16,
    path: String,
    credentials: Credentials,
}

impl Endpoint {
    fn parse(url: &str, credentials: Option<&Credentials>) -> Result<Self, TransportError> {
        let parsed = Url::parse(url).map_err(|_| TransportError::invalid_url(url))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::invalid_url(url))?
            .to_string();
        // SFTP servers rarely allow anonymous sessions.
        let credentials = credentials
            .cloned()
            .ok_or_else(|| TransportError::auth_required(url, &host))?;
        let path = urlencoding::decode(parsed.path())
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| parsed.path().to_string());
        Ok(Self {
            url: url.to_string(),
            host,
            port: parsed.port().unwrap_or(DEFAULT_PORT),
            path: if path.is_empty() { "/".to_string() } else { path },
            credentials,
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
        format!("sftp://{}{}{}", self.host, port, encoded.join("/"))
    }
}

impl SftpHandler {
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
        .map_err(|e| TransportError::remote(Transport::Sftp, url, e))?
}

#[async_trait]
impl ProtocolHandler for SftpHandler {
    fn transport(&self) -> Transport {
        Transport::Sftp
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
        let session_endpoint = endpoint.clone();
        let entries = blocking(&self.url, move || session::list(&session_endpoint)).await?;
        debug!(count = entries.len(), "listed SFTP path");

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
        blocking(url, move || session::exists(&endpoint))
            .await
            .unwrap_or(false)
    }

    fn supports_hosting_switch(&self) -> bool {
        self.credentials.is_none()
    }
}

#[cfg(feature = "sftp")]
mod session {
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::net::TcpStream;
    use std::path::Path;

    use ssh2::{Session, Sftp};

    use super::{Endpoint, Transport, TransportError};

    fn remote(endpoint: &Endpoint, error: impl ToString) -> TransportError {
        TransportError::remote(Transport::Sftp, &endpoint.url, error)
    }

    fn connect(endpoint: &Endpoint) -> Result<(Session, Sftp), TransportError> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .map_err(|e| remote(endpoint, e))?;
        let mut session = Session::new().map_err(|e| remote(endpoint, e))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| remote(endpoint, e))?;
        session
            .userauth_password(&endpoint.credentials.login, endpoint.credentials.secret())
            .map_err(|_| TransportError::auth_required(&endpoint.url, &endpoint.host))?;
        let sftp = session.sftp().map_err(|e| remote(endpoint, e))?;
        Ok((session, sftp))
    }

    pub(super) fn list(endpoint: &Endpoint) -> Result<Vec<(String, u64)>, TransportError> {
        let (_session, sftp) = connect(endpoint)?;
        let path = Path::new(&endpoint.path);
        let stat = sftp
            .stat(path)
            .map_err(|_| TransportError::not_found(&endpoint.url))?;
        if !stat.is_dir() {
            return Ok(vec![(endpoint.path.clone(), stat.size.unwrap_or(0))]);
        }

        let mut files: Vec<(String, u64)> = sftp
            .readdir(path)
            .map_err(|e| remote(endpoint, e))?
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .map(|(entry, stat)| (entry.to_string_lossy().into_owned(), stat.size.unwrap_or(0)))
            .collect();
        files.sort();
        Ok(files)
    }

    pub(super) fn download(endpoint: &Endpoint, target: &Path) -> Result<u64, TransportError> {
        let (_session, sftp) = connect(endpoint)?;
        let mut remote_file = sftp
            .open(Path::new(&endpoint.path))
            .map_err(|_| TransportError::not_found(&endpoint.url))?;
        let file = File::create(target).map_err(|e| TransportError::io(target, e))?;
        let mut writer = BufWriter::new(file);
        let copied = std::io::copy(&mut remote_file, &mut writer)
            .map_err(|e| remote(endpoint, e))?;
        writer.flush().map_err(|e| TransportError::io(target, e))?;
        Ok(copied)
    }

    pub(super) fn exists(endpoint: &Endpoint) -> Result<bool, TransportError> {
        let (_session, sftp) = connect(endpoint)?;
        Ok(sftp
            .stat(Path::new(&endpoint.path))
            .is_ok_and(|stat| stat.is_file()))
    }
}

#[cfg(not(feature = "sftp"))]
mod session {
    use std::path::Path;

    use super::{Endpoint, Transport, TransportError};

    fn unavailable() -> TransportError {
        TransportError::Unavailable {
            transport: Transport::Sftp,
        }
    }

    pub(super) fn list(_endpoint: &Endpoint) -> Result<Vec<(String, u64)>, TransportError> {
        Err(unavailable())
    }

    pub(super) fn download(_endpoint: &Endpoint, _target: &Path) -> Result<u64, TransportError> {
        Err(unavailable())
    }

    pub(super) fn exists(_endpoint: &Endpoint) -> Result<bool, TransportError> {
        Err(unavailable())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_requires_credentials() {
        let err = Endpoint::parse("sftp://host/a.pdf", None).err().unwrap();
        assert!(err.is_auth());
    }

    #[test]
    fn test_endpoint_parses_port_and_path() {
        let creds = Credentials::new("u", "p");
        let endpoint = Endpoint::parse("sftp://host:2222/home/u/", Some(&creds)).unwrap();
        assert_eq!(endpoint.port, 2222);
        assert_eq!(endpoint.path, "/home/u/");
        assert_eq!(endpoint.url_for("/home/u/a.pdf"), "sftp://host:2222/home/u/a.pdf");
    }

    #[test]
    fn test_availability_follows_feature() {
        assert_eq!(Transport::Sftp.is_available(), cfg!(feature = "sftp"));
    }
}
