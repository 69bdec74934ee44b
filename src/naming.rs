//! Display-name derivation and safe local file naming.

use std::path::{Component, Path, PathBuf};

use url::Url;

use crate::mime::{self, MimePolicy};

/// Last path segment of `url`, percent-decoded. Empty when the URL has none.
#[must_use]
pub fn basename_from_url(url: &str) -> String {
    let raw = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => url.rsplit('/').next().unwrap_or_default().to_string(),
    };
    urlencoding::decode(&raw)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or(raw)
}

/// Derives a record's display name: decoded basename, filesystem-safe, with
/// an extension matching `mime_type`.
#[must_use]
pub fn display_name(url: &str, mime_type: &str, policy: &MimePolicy) -> String {
    display_name_from(&basename_from_url(url), mime_type, policy)
}

/// Like [`display_name`], starting from a name the remote suggested.
#[must_use]
pub fn display_name_from(base: &str, mime_type: &str, policy: &MimePolicy) -> String {
    let mut name = sanitize_filename(base.trim());
    if name.trim_matches('_').is_empty() {
        name = "file".to_string();
    }

    let Some(extension) = policy.extension_for(mime_type) else {
        return name;
    };
    let has_matching_extension = name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case(&extension))
        || mime::mime_from_name(&name) == Some(mime::normalize_mime(mime_type).as_str());
    if has_matching_extension {
        name
    } else {
        format!("{name}.{extension}")
    }
}

/// Parses a Content-Disposition header to extract the filename.
///
/// Handles `filename="a.pdf"`, `filename=a.pdf` and RFC 5987
/// `filename*=UTF-8''a%20b.pdf`.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Builds an `inline` Content-Disposition value for `filename`.
#[must_use]
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() && c != '"' && !c.is_control() { c } else { '_' })
        .collect();
    if ascii == filename {
        format!("inline; filename=\"{filename}\"")
    } else {
        format!(
            "inline; filename=\"{ascii}\"; filename*=UTF-8''{}",
            urlencoding::encode(filename)
        )
    }
}

/// Replaces characters invalid on common filesystems: / \ : * ? " < > |
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

/// Inserts `_{suffix}` before the extension: `a.pdf` becomes `a_2.pdf`.
#[must_use]
pub fn suffixed_name(filename: &str, suffix: impl std::fmt::Display) -> String {
    let (stem, ext) = split_extension(filename);
    format!("{stem}_{suffix}{ext}")
}

/// True if `name` is `base` or `base` with a numeric suffix.
#[must_use]
pub fn is_numbered_variant(name: &str, base: &str) -> bool {
    if name == base {
        return true;
    }
    let (stem, ext) = split_extension(base);
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_suffix(ext))
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    }
}

/// Resolves a file path under `dir` that does not exist yet.
///
/// `file.pdf`, then `file_2.pdf`, `file_3.pdf`, ...
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.trim_matches('_').is_empty() {
            "file.bin".to_string()
        } else {
            sanitized
        }
    };
    let base_path = dir.join(&filename);
    if !base_path.exists() {
        return base_path;
    }

    for i in 2..1000 {
        let candidate = dir.join(suffixed_name(&filename, i));
        if !candidate.exists() {
            return candidate;
        }
    }

    dir.join(suffixed_name(&filename, format!("{:08x}", rand::random::<u32>())))
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
