//! Persisted record types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::mime::MimePolicy;

/// Where a resource's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Bytes copied into the library.
    Embedded,
    /// Bytes stay remote; served through the proxy cache.
    Referenced,
}

impl StorageMode {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Referenced => "referenced",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(Self::Embedded),
            "referenced" => Ok(Self::Referenced),
            _ => Err(format!("invalid storage mode: {s}")),
        }
    }
}

/// One imported remote file.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceRecord {
    /// Stable local identifier.
    pub id: i64,
    /// Remote locator, unique within the store.
    pub source_uri: String,
    /// Sanitized human label with extension.
    pub display_name: String,
    /// Stored mime type.
    pub mime_type: String,
    /// Size in bytes as reported at import.
    pub size_bytes: i64,
    /// Last known liveness of the remote source.
    pub available: bool,
    /// Storage mode (stored as text, parsed via `storage_mode()`).
    #[sqlx(rename = "storage_mode")]
    pub storage_mode_str: String,
    /// Library file path for embedded resources.
    pub local_path: Option<String>,
    /// Sealed credentials blob.
    pub credentials: Option<Vec<u8>>,
    /// Owning source group, if any.
    pub source_group_id: Option<i64>,
    /// Unix seconds of the last reconciliation pass that confirmed this record.
    pub sync_marker: Option<i64>,
    /// Set while a bulk import batch is still running.
    pub import_marker: bool,
    /// When the record was created.
    pub created_at: String,
    /// When the record was last updated.
    pub updated_at: String,
}

impl ResourceRecord {
    /// Returns the parsed storage mode.
    ///
    /// Falls back to `Referenced` if the column holds an unknown value.
    #[must_use]
    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode_str
            .parse()
            .unwrap_or(StorageMode::Referenced)
    }

    /// Returns true when credentials are stored for this record.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.credentials.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Referenced, credentialed records are pinned to their current mode.
    #[must_use]
    pub fn is_hosting_pinned(&self) -> bool {
        self.storage_mode() == StorageMode::Referenced && self.has_credentials()
    }

    /// Available and of a currently allowed type.
    #[must_use]
    pub fn is_usable(&self, policy: &MimePolicy) -> bool {
        self.available && policy.is_allowed(&self.mime_type)
    }

    /// Library path for embedded bytes.
    #[must_use]
    pub fn local_file(&self) -> Option<PathBuf> {
        self.local_path.as_deref().map(PathBuf::from)
    }
}

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({}, {}) <- {}",
            self.id,
            self.display_name,
            self.mime_type,
            self.storage_mode(),
            self.source_uri
        )
    }
}

/// Field set for creating or refreshing a record keyed by `source_uri`.
#[derive(Debug, Clone)]
pub struct NewResource<'a> {
    pub source_uri: &'a str,
    pub display_name: &'a str,
    pub mime_type: &'a str,
    pub size_bytes: i64,
    pub storage_mode: StorageMode,
    pub local_path: Option<&'a str>,
    pub credentials: Option<&'a [u8]>,
    pub source_group_id: Option<i64>,
    pub sync_marker: Option<i64>,
    pub import_marker: bool,
}

/// A remote collection reconciled as a unit.
#[derive(Debug, Clone, FromRow)]
pub struct SourceGroup {
    pub id: i64,
    pub name: String,
    /// Collection URL handed to the import pipeline.
    pub url: String,
    /// Sealed credentials blob.
    pub credentials: Option<Vec<u8>>,
    /// Delete records not confirmed by a pass.
    pub delete_unused: bool,
    /// Scheduling interval used by [`due`](Self::is_due).
    pub interval_secs: i64,
    /// Unix seconds of the last completed pass.
    pub last_synced_at: Option<i64>,
    pub created_at: String,
}

impl SourceGroup {
    /// Returns true if the interval has elapsed since the last pass.
    #[must_use]
    pub fn is_due(&self, now_unix: i64) -> bool {
        match self.last_synced_at {
            None => true,
            Some(last) => now_unix.saturating_sub(last) >= self.interval_secs,
        }
    }
}

/// Field set for creating a source group.
#[derive(Debug, Clone)]
pub struct NewSourceGroup<'a> {
    pub name: &'a str,
    pub url: &'a str,
    pub credentials: Option<&'a [u8]>,
    pub delete_unused: bool,
    pub interval_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(mode: &str, credentials: Option<Vec<u8>>) -> ResourceRecord {
        ResourceRecord {
            id: 1,
            source_uri: "https://example.com/a.pdf".to_string(),
            display_name: "a.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 10,
            available: true,
            storage_mode_str: mode.to_string(),
            local_path: None,
            credentials,
            source_group_id: None,
            sync_marker: None,
            import_marker: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_storage_mode_round_trip_strings() {
        assert_eq!("embedded".parse::<StorageMode>(), Ok(StorageMode::Embedded));
        assert_eq!(StorageMode::Referenced.to_string(), "referenced");
        assert!("elsewhere".parse::<StorageMode>().is_err());
    }

    #[test]
    fn test_referenced_with_credentials_is_pinned() {
        assert!(record("referenced", Some(vec![1, 2, 3])).is_hosting_pinned());
        assert!(!record("referenced", None).is_hosting_pinned());
        assert!(!record("embedded", Some(vec![1])).is_hosting_pinned());
    }

    #[test]
    fn test_usable_requires_availability_and_allowed_type() {
        let policy = MimePolicy::default();
        let mut rec = record("referenced", None);
        assert!(rec.is_usable(&policy));
        rec.available = false;
        assert!(!rec.is_usable(&policy));
        rec.available = true;
        rec.mime_type = "text/html".to_string();
        assert!(!rec.is_usable(&policy));
    }

    #[test]
    fn test_group_is_due() {
        let group = SourceGroup {
            id: 1,
            name: "g".to_string(),
            url: "file:///tmp".to_string(),
            credentials: None,
            delete_unused: true,
            interval_secs: 60,
            last_synced_at: Some(1_000),
            created_at: String::new(),
        };
        assert!(!group.is_due(1_030));
        assert!(group.is_due(1_060));
    }
}
