//! Mime-type policy: allow-listing, forced local hosting, extension mapping
//! and content sniffing.

use std::fmt;
use std::sync::Arc;

/// One allow-listed mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeRule {
    /// Normalized mime type (`type/subtype`, lowercase).
    pub mime: String,
    /// Extension appended to display names, without the dot.
    pub extension: String,
    /// Resources of this type are always embedded in the library.
    pub force_local: bool,
}

impl MimeRule {
    /// Creates a rule that allows referenced hosting.
    #[must_use]
    pub fn new(mime: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            mime: normalize_mime(&mime.into()),
            extension: extension.into().trim_start_matches('.').to_lowercase(),
            force_local: false,
        }
    }

    /// Marks the rule as requiring embedded storage.
    #[must_use]
    pub fn local_only(mut self) -> Self {
        self.force_local = true;
        self
    }
}

/// Extra veto over allow-listed types, composed at startup.
pub type MimePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Allow-list of importable mime types plus additional predicates.
#[derive(Clone)]
pub struct MimePolicy {
    rules: Vec<MimeRule>,
    predicates: Vec<MimePredicate>,
}

impl fmt::Debug for MimePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mimes: Vec<&str> = self.rules.iter().map(|r| r.mime.as_str()).collect();
        f.debug_struct("MimePolicy")
            .field("rules", &mimes)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl Default for MimePolicy {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl MimePolicy {
    /// Creates a policy from explicit rules.
    #[must_use]
    pub fn new(rules: Vec<MimeRule>) -> Self {
        Self {
            rules,
            predicates: Vec::new(),
        }
    }

    /// Adds a predicate that must also accept a type for it to be allowed.
    #[must_use]
    pub fn with_predicate(mut self, predicate: MimePredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Returns the configured rules.
    #[must_use]
    pub fn rules(&self) -> &[MimeRule] {
        &self.rules
    }

    fn rule_for(&self, mime: &str) -> Option<&MimeRule> {
        let mime = normalize_mime(mime);
        self.rules.iter().find(|rule| rule.mime == mime)
    }

    /// Returns true if `mime` is on the allow-list and every predicate accepts it.
    #[must_use]
    pub fn is_allowed(&self, mime: &str) -> bool {
        let normalized = normalize_mime(mime);
        self.rule_for(&normalized).is_some() && self.predicates.iter().all(|p| p(&normalized))
    }

    /// Returns true if resources of this type must be embedded.
    #[must_use]
    pub fn forces_local(&self, mime: &str) -> bool {
        self.rule_for(mime).is_some_and(|rule| rule.force_local)
    }

    /// Returns the configured extension for `mime`, falling back to the
    /// built-in table.
    #[must_use]
    pub fn extension_for(&self, mime: &str) -> Option<String> {
        self.rule_for(mime)
            .map(|rule| rule.extension.clone())
            .or_else(|| extension_from_mime(mime).map(str::to_string))
    }
}

fn default_rules() -> Vec<MimeRule> {
    vec![
        MimeRule::new("application/pdf", "pdf"),
        MimeRule::new("image/jpeg", "jpg"),
        MimeRule::new("image/png", "png"),
        MimeRule::new("image/gif", "gif"),
        MimeRule::new("image/webp", "webp"),
        MimeRule::new("image/svg+xml", "svg").local_only(),
        MimeRule::new("audio/mpeg", "mp3"),
        MimeRule::new("audio/ogg", "ogg"),
        MimeRule::new("audio/wav", "wav"),
        MimeRule::new("video/mp4", "mp4"),
        MimeRule::new("video/webm", "webm"),
        MimeRule::new("application/zip", "zip"),
        MimeRule::new("text/plain", "txt"),
        MimeRule::new("text/csv", "csv"),
        MimeRule::new("application/json", "json"),
    ]
}

/// Strips parameters and lowercases a mime type (`Text/HTML; charset=utf-8` → `text/html`).
#[must_use]
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Built-in extension table for common types.
#[must_use]
pub fn extension_from_mime(mime: &str) -> Option<&'static str> {
    let ext = match normalize_mime(mime).as_str() {
        "application/pdf" => "pdf",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "application/zip" => "zip",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "text/html" => "html",
        "application/json" => "json",
        _ => return None,
    };
    Some(ext)
}

/// Guesses a mime type from a file name's extension.
#[must_use]
pub fn mime_from_name(name: &str) -> Option<&'static str> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        _ => return None,
    };
    Some(mime)
}

const PDF_MAGIC: &[u8] = b"%PDF-";
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const GIF87_MAGIC: &[u8] = b"GIF87a";
const GIF89_MAGIC: &[u8] = b"GIF89a";
const ZIP_MAGIC: &[u8] = &[b'P', b'K', 0x03, 0x04];
const ID3_MAGIC: &[u8] = b"ID3";
const OGG_MAGIC: &[u8] = b"OggS";
const WEBM_MAGIC: &[u8] = &[0x1A, 0x45, 0xDF, 0xA3];

/// Detects a mime type from leading content bytes.
///
/// Returns `None` when no known signature matches; text formats have no
/// signature and always yield `None`.
#[must_use]
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(PDF_MAGIC) {
        return Some("application/pdf");
    }
    if bytes.starts_with(PNG_MAGIC) {
        return Some("image/png");
    }
    if bytes.starts_with(JPEG_MAGIC) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(GIF87_MAGIC) || bytes.starts_with(GIF89_MAGIC) {
        return Some("image/gif");
    }
    if bytes.starts_with(ZIP_MAGIC) {
        return Some("application/zip");
    }
    if bytes.starts_with(ID3_MAGIC)
        || (bytes.len() > 1 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0)
    {
        return Some("audio/mpeg");
    }
    if bytes.starts_with(OGG_MAGIC) {
        return Some("audio/ogg");
    }
    if bytes.starts_with(WEBM_MAGIC) {
        return Some("video/webm");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" {
        return match &bytes[8..12] {
            b"WEBP" => Some("image/webp"),
            b"WAVE" => Some("audio/wav"),
            _ => None,
        };
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return Some("video/mp4");
    }
    None
}

/// Returns true if [`sniff_mime`] can recognise content of this type.
#[must_use]
pub fn is_sniffable(mime: &str) -> bool {
    matches!(
        normalize_mime(mime).as_str(),
        "application/pdf"
            | "image/png"
            | "image/jpeg"
            | "image/gif"
            | "image/webp"
            | "application/zip"
            | "audio/mpeg"
            | "audio/ogg"
            | "audio/wav"
            | "video/mp4"
            | "video/webm"
    )
}
