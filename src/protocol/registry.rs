//! Handler selection.
//!
//! The [`ProtocolRegistry`] holds a typed, ordered list of transports fixed
//! at construction and hands out a fresh handler per resolution.

use tracing::{debug, info, instrument, warn};

use super::{HandlerOptions, ProtocolHandler, Transport, UnsupportedTransport};
use crate::credentials::Credentials;

/// Priority-ordered set of transports.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    transports: Vec<Transport>,
    options: HandlerOptions,
}

impl ProtocolRegistry {
    /// Registry over every transport in default priority order.
    #[must_use]
    pub fn new(options: HandlerOptions) -> Self {
        Self::with_transports(Transport::ALL.to_vec(), options)
    }

    /// Registry over an explicit transport list, tried in the given order.
    #[must_use]
    pub fn with_transports(transports: Vec<Transport>, options: HandlerOptions) -> Self {
        let mut deduped: Vec<Transport> = Vec::with_capacity(transports.len());
        for transport in transports {
            if !deduped.contains(&transport) {
                deduped.push(transport);
            }
        }
        debug!(transports = ?deduped, "protocol registry configured");
        Self {
            transports: deduped,
            options,
        }
    }

    /// Drops transports rejected by `keep`.
    #[must_use]
    pub fn filtered(mut self, keep: impl Fn(Transport) -> bool) -> Self {
        self.transports.retain(|t| keep(*t));
        self
    }

    /// Transports in resolution order.
    #[must_use]
    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    /// Shared handler options.
    #[must_use]
    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    /// Returns a handler for the first transport that is available and compatible.
    ///
    /// Every rejection is logged with its reason.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedTransport`] when no transport qualifies.
    #[instrument(skip(self))]
    pub fn resolve(&self, url: &str) -> Result<Box<dyn ProtocolHandler>, UnsupportedTransport> {
        for transport in &self.transports {
            let handler = transport.handler(url, &self.options);
            if !handler.is_available() {
                if handler.is_compatible() {
                    info!(
                        transport = %transport,
                        url,
                        "handler rejected: unavailable in this build"
                    );
                } else {
                    debug!(transport = %transport, url, "handler rejected: unavailable");
                }
                continue;
            }
            if !handler.is_compatible() {
                debug!(transport = %transport, url, "handler rejected: incompatible URL");
                continue;
            }
            info!(transport = %transport, url, "protocol handler selected");
            return Ok(handler);
        }

        warn!(url, "no protocol handler available");
        Err(UnsupportedTransport::new(url))
    }

    /// Resolves `url` and attaches `credentials` before returning.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedTransport`] when no transport qualifies.
    pub fn resolve_with_credentials(
        &self,
        url: &str,
        credentials: Option<Credentials>,
    ) -> Result<Box<dyn ProtocolHandler>, UnsupportedTransport> {
        let mut handler = self.resolve(url)?;
        handler.attach_credentials(credentials);
        Ok(handler)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn options() -> HandlerOptions {
        HandlerOptions::new(
            10,
            std::env::temp_dir(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_picks_matching_transport() {
        let registry = ProtocolRegistry::new(options());
        assert_eq!(
            registry.resolve("https://e.com/a.pdf").unwrap().transport(),
            Transport::Http
        );
        assert_eq!(
            registry.resolve("file:///tmp/a.pdf").unwrap().transport(),
            Transport::File
        );
    }

    #[test]
    fn test_resolve_unknown_scheme_fails() {
        let registry = ProtocolRegistry::new(options());
        let err = registry.resolve("gopher://e.com/a").err().unwrap();
        assert_eq!(err.url, "gopher://e.com/a");
    }

    #[test]
    fn test_filtered_registry_rejects_removed_transport() {
        let registry = ProtocolRegistry::new(options()).filtered(|t| t != Transport::Http);
        assert!(registry.resolve("https://e.com/a.pdf").is_err());
        assert_eq!(registry.transports().len(), 3);
    }

    #[test]
    fn test_with_transports_dedupes_in_order() {
        let registry = ProtocolRegistry::with_transports(
            vec![Transport::Http, Transport::File, Transport::Http],
            options(),
        );
        assert_eq!(registry.transports(), &[Transport::Http, Transport::File]);
    }

    #[test]
    fn test_sftp_requires_feature() {
        let registry = ProtocolRegistry::new(options());
        assert_eq!(
            registry.resolve("sftp://h/a.pdf").is_ok(),
            cfg!(feature = "sftp")
        );
    }
}
