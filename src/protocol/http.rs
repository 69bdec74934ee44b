//! HTTP(S) transport.
//!
//! A URL ending in `/` whose response is `text/html` is read as a directory
//! index: file links below it are listed and probed with `HEAD`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    HandlerOptions, ListCursor, Listing, ProtocolHandler, SourceDescriptor, TempCopy, Transport,
    TransportError, effective_mime, paginate, remove_temp_file, temp_file_path,
};
use crate::credentials::Credentials;
use crate::mime;
use crate::naming::{basename_from_url, parse_content_disposition};

#[allow(clippy::expect_used)]
static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+)["']"#).expect("static regex compiles")
});

/// Handler for `http://` and `https://` URLs.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    url: String,
    page_size: usize,
    temp_dir: PathBuf,
    client: Client,
    credentials: Option<Credentials>,
}

impl HttpHandler {
    /// Creates a handler for `url` sharing the options' HTTP client.
    #[must_use]
    pub fn new(url: &str, options: &HandlerOptions) -> Self {
        Self {
            url: url.trim().to_string(),
            page_size: options.page_size,
            temp_dir: options.temp_dir.clone(),
            client: options.http.clone(),
            credentials: None,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(creds) => request.basic_auth(&creds.login, Some(creds.secret())),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, TransportError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| TransportError::network(url, e))?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response);
        }
        if matches!(status, 401 | 403 | 407) {
            let host = Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| url.to_string());
            return Err(TransportError::auth_required(url, host));
        }
        if status == 404 || status == 410 {
            return Err(TransportError::not_found(url));
        }
        Err(TransportError::http_status(url, status))
    }

    async fn probe(&self, url: &str) -> Result<SourceDescriptor, TransportError> {
        let response = self.send(self.client.head(url), url).await?;
        Ok(describe(url, &response))
    }

    async fn list_index(
        &self,
        base: &Url,
        html: &str,
        cursor: Option<&ListCursor>,
    ) -> Result<Listing, TransportError> {
        let links = index_links(base, html);
        debug!(count = links.len(), "parsed directory index");

        let (page, load_more) = paginate(links, cursor, self.page_size);
        let mut descriptors = Vec::with_capacity(page.len());
        for link in page {
            match self.probe(&link).await {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(error) => {
                    warn!(
                        url = %link,
                        error = %error,
                        "HEAD request failed; using name-derived type"
                    );
                    let name = basename_from_url(&link);
                    descriptors.push(SourceDescriptor::new(
                        link,
                        effective_mime(None, &name),
                        0,
                        false,
                    ));
                }
            }
        }
        Ok(Listing {
            descriptors,
            load_more,
        })
    }
}

fn header_str<'a>(response: &'a Response, name: &reqwest::header::HeaderName) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn describe(url: &str, response: &Response) -> SourceDescriptor {
    let suggested = header_str(response, &CONTENT_DISPOSITION)
        .and_then(parse_content_disposition)
        .filter(|name| !name.trim().is_empty());
    let name = suggested
        .clone()
        .unwrap_or_else(|| basename_from_url(url));
    let mime_type = effective_mime(header_str(response, &CONTENT_TYPE), &name);
    let size_bytes = header_str(response, &CONTENT_LENGTH)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);
    SourceDescriptor::new(url, mime_type, size_bytes, false).with_suggested_name(suggested)
}

fn is_html(response: &Response) -> bool {
    header_str(response, &CONTENT_TYPE).is_some_and(|ct| mime::normalize_mime(ct) == "text/html")
}

/// File links below `base`, resolved, de-duplicated, in document order.
fn index_links(base: &Url, html: &str) -> Vec<String> {
    let base_str = base.as_str();
    let mut seen = std::collections::HashSet::new();
    HREF_RE
        .captures_iter(html)
        .filter_map(|cap| cap.get(1))
        .filter_map(|m| base.join(m.as_str().trim()).ok())
        .map(|mut u| {
            u.set_query(None);
            u.set_fragment(None);
            String::from(u)
        })
        .filter(|link| link.starts_with(base_str) && link.len() > base_str.len())
        .filter(|link| !link.ends_with('/'))
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

async fn stream_to_file(
    response: Response,
    url: &str,
    path: &Path,
) -> Result<u64, TransportError> {
    let file = File::create(path)
        .await
        .map_err(|e| TransportError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TransportError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| TransportError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| TransportError::io(path, e))?;
    Ok(bytes_written)
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn transport(&self) -> Transport {
        Transport::Http
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
        let base = Url::parse(&self.url).map_err(|_| TransportError::invalid_url(&self.url))?;
        if !base.path().ends_with('/') {
            return Ok(Listing::single(self.probe(&self.url).await?));
        }

        let response = self.send(self.client.get(base.clone()), &self.url).await?;
        if !is_html(&response) {
            return Ok(Listing::single(describe(&self.url, &response)));
        }
        let html = response
            .text()
            .await
            .map_err(|e| TransportError::network(&self.url, e))?;
        self.list_index(&base, &html, cursor).await
    }

    #[instrument(skip(self))]
    async fn fetch_temp_copy(&self, url: &str) -> Result<TempCopy, TransportError> {
        let response = self.send(self.client.get(url), url).await?;
        let mime_type = describe(url, &response).mime_type;

        let path = temp_file_path(&self.temp_dir);
        match stream_to_file(response, url, &path).await {
            Ok(size_bytes) => Ok(TempCopy {
                path,
                mime_type,
                size_bytes,
            }),
            Err(error) => {
                remove_temp_file(&path).await;
                Err(error)
            }
        }
    }

    async fn check_availability(&self, url: &str) -> bool {
        match self.send(self.client.head(url), url).await {
            Ok(_) => true,
            Err(error) => {
                debug!(url, error = %error, "availability probe failed");
                false
            }
        }
    }

    fn supports_hosting_switch(&self) -> bool {
        self.credentials.is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_index_links_keeps_files_below_base() {
        let base = Url::parse("https://e.com/files/").unwrap();
        let html = r#"
            <a href="../">Parent</a>
            <a href="a.pdf">a</a>
            <a HREF='sub/b%20c.png?x=1'>b</a>
            <a href="sub/">dir</a>
            <a href="https://other.com/x.pdf">x</a>
            <a href="/files/a.pdf">dup</a>
            <a href="?C=N;O=D">sort</a>
        "#;
        assert_eq!(
            index_links(&base, html),
            vec![
                "https://e.com/files/a.pdf".to_string(),
                "https://e.com/files/sub/b%20c.png".to_string(),
            ]
        );
    }

    #[test]
    fn test_credentials_disable_hosting_switch() {
        let options = HandlerOptions::new(
            10,
            std::env::temp_dir(),
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(1),
        )
        .unwrap();
        let mut handler = HttpHandler::new("https://e.com/a.pdf", &options);
        assert!(handler.supports_hosting_switch());
        handler.attach_credentials(Some(Credentials::new("u", "p")));
        assert!(!handler.supports_hosting_switch());
        handler.attach_credentials(Some(Credentials::new("", "")));
        assert!(handler.supports_hosting_switch());
    }
}
