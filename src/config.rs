//! Engine configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::mime::{self, MimePolicy};
use crate::protocol::DEFAULT_PAGE_SIZE;

/// Default freshness window for cached copies.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default distance from the execution ceiling at which a batch stops.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// Invalid configuration values.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A value is outside its accepted range.
    #[error("invalid value for `{field}`: {value}. Expected {expected}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted range description.
        expected: &'static str,
    },

    /// The safety margin leaves no time to work.
    #[error("safety margin {margin:?} must be shorter than the execution ceiling {ceiling:?}")]
    MarginExceedsCeiling {
        /// Configured ceiling.
        ceiling: Duration,
        /// Configured margin.
        margin: Duration,
    },
}

/// Settings shared by the import pipeline, proxy cache and reconciler.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Root directory for embedded bytes.
    pub library_dir: PathBuf,
    /// Proxy cache directory.
    pub cache_dir: PathBuf,
    /// Directory for temp copies.
    pub temp_dir: PathBuf,
    /// Default cache freshness window.
    pub cache_ttl: Duration,
    /// Per-mime freshness windows, keyed by normalized mime type.
    pub cache_ttl_overrides: HashMap<String, Duration>,
    /// Wall-clock ceiling for one import run or sync pass; `None` means unmetered.
    pub execution_ceiling: Option<Duration>,
    /// Stop this long before the ceiling.
    pub safety_margin: Duration,
    /// Descriptors per listing page.
    pub page_size: usize,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP whole-request timeout.
    pub read_timeout: Duration,
    /// Base of the byte-serving address scheme (`<base>/<display name>`).
    pub proxy_base: String,
    /// Importable types.
    pub mime_policy: MimePolicy,
}

impl MirrorConfig {
    /// Default settings rooted at `data_dir`.
    #[must_use]
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            library_dir: data_dir.join("library"),
            cache_dir: data_dir.join("cache"),
            temp_dir: data_dir.join("tmp"),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_ttl_overrides: HashMap::new(),
            execution_ceiling: None,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            page_size: DEFAULT_PAGE_SIZE,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            proxy_base: "/mirror".to_string(),
            mime_policy: MimePolicy::default(),
        }
    }

    /// Freshness window for a mime type.
    #[must_use]
    pub fn ttl_for(&self, mime_type: &str) -> Duration {
        self.cache_ttl_overrides
            .get(&mime::normalize_mime(mime_type))
            .copied()
            .unwrap_or(self.cache_ttl)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10_000).contains(&self.page_size) {
            return Err(ConfigError::OutOfRange {
                field: "page_size",
                value: self.page_size.to_string(),
                expected: "1..=10000",
            });
        }
        for (field, value) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
        ] {
            if value.is_zero() || value > Duration::from_secs(3600) {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: format!("{value:?}"),
                    expected: "1s..=3600s",
                });
            }
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "cache_ttl",
                value: "0s".to_string(),
                expected: "a positive duration",
            });
        }
        if let Some(ceiling) = self.execution_ceiling
            && self.safety_margin >= ceiling
        {
            return Err(ConfigError::MarginExceedsCeiling {
                ceiling,
                margin: self.safety_margin,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MirrorConfig::rooted_at("/data");
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_dir, PathBuf::from("/data/cache"));
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
        assert!(config.execution_ceiling.is_none());
    }

    #[test]
    fn test_ttl_override_by_mime() {
        let mut config = MirrorConfig::rooted_at("/data");
        config
            .cache_ttl_overrides
            .insert("image/png".to_string(), Duration::from_secs(60));
        assert_eq!(config.ttl_for("IMAGE/PNG"), Duration::from_secs(60));
        assert_eq!(config.ttl_for("application/pdf"), DEFAULT_CACHE_TTL);
    }

    #[test]
    fn test_margin_must_be_below_ceiling() {
        let mut config = MirrorConfig::rooted_at("/data");
        config.execution_ceiling = Some(Duration::from_secs(5));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MarginExceedsCeiling { .. })
        ));
        config.execution_ceiling = Some(Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_page_size_range() {
        let mut config = MirrorConfig::rooted_at("/data");
        config.page_size = 0;
        assert!(config.validate().is_err());
    }
}
