//! Content types: `Content-Type` header parsing and the fixed file-extension table.

use std::fmt;
use std::path::Path;

use crate::item::CodecError;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";
pub const TEXT_HTML: &str = "text/html";
pub const TEXT_CSV: &str = "text/csv";
pub const TEXT_MARKDOWN: &str = "text/markdown";
pub const TEXT_URI_LIST: &str = "text/uri-list";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_JPEG: &str = "image/jpeg";
pub const IMAGE_GIF: &str = "image/gif";
pub const IMAGE_BMP: &str = "image/bmp";
pub const APPLICATION_JSON: &str = "application/json";
pub const APPLICATION_GEO_JSON: &str = "application/geo+json";
/// Assumed for a push that carries no `Content-Type`.
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

/// Extension (lowercase, no dot) to content type.
const EXTENSIONS: &[(&str, &str)] = &[
    ("txt", TEXT_PLAIN),
    ("text", TEXT_PLAIN),
    ("log", TEXT_PLAIN),
    ("md", TEXT_MARKDOWN),
    ("markdown", TEXT_MARKDOWN),
    ("csv", TEXT_CSV),
    ("html", TEXT_HTML),
    ("htm", TEXT_HTML),
    ("uri", TEXT_URI_LIST),
    ("uris", TEXT_URI_LIST),
    ("json", APPLICATION_JSON),
    ("geojson", APPLICATION_GEO_JSON),
    ("png", IMAGE_PNG),
    ("jpg", IMAGE_JPEG),
    ("jpeg", IMAGE_JPEG),
    ("gif", IMAGE_GIF),
    ("bmp", IMAGE_BMP),
];

/// Parsed `Content-Type`: lowercased essence (`type/subtype`) and optional charset.
/// Other parameters are accepted and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    essence: String,
    charset: Option<String>,
}

impl ContentType {
    /// Parse a header value such as `text/plain; charset=UTF-8`.
    ///
    /// `charset: utf-8` (colon instead of equals) is tolerated since some senders emit it.
    pub fn parse(header: &str) -> Self {
        let mut parts = header.split(';');
        let essence = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let mut charset = None;
        for param in parts {
            let param = param.trim();
            let Some((key, value)) = param.split_once('=').or_else(|| param.split_once(':')) else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("charset") {
                let value = value.trim().trim_matches('"').to_ascii_lowercase();
                if !value.is_empty() {
                    charset = Some(value);
                }
            }
        }
        Self { essence, charset }
    }

    pub fn essence(&self) -> &str {
        &self.essence
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub fn is_text(&self) -> bool {
        self.essence.starts_with("text/")
    }

    pub fn is_image(&self) -> bool {
        self.essence.starts_with("image/")
    }

    /// `application/json` or any `+json` structured-syntax suffix.
    pub fn is_structured(&self) -> bool {
        self.essence == APPLICATION_JSON
            || (self.essence.contains('/') && self.essence.ends_with("+json"))
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.charset {
            Some(charset) => write!(f, "{}; charset={}", self.essence, charset),
            None => f.write_str(&self.essence),
        }
    }
}

/// Look up the content type for a file extension (with or without the leading dot).
pub fn for_extension(ext: &str) -> Result<&'static str, CodecError> {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, ct)| *ct)
        .ok_or(CodecError::UnknownExtension(ext))
}

/// Content type for a path by its extension.
pub fn for_path(path: &Path) -> Result<&'static str, CodecError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| CodecError::UnknownExtension(String::new()))?;
    for_extension(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_charset() {
        let ct = ContentType::parse("Text/Plain; Charset=\"UTF-8\"");
        assert_eq!(ct.essence(), "text/plain");
        assert_eq!(ct.charset(), Some("utf-8"));
        assert!(ct.is_text());
        assert_eq!(ct.to_string(), "text/plain; charset=utf-8");
    }

    #[test]
    fn parse_tolerates_colon_and_extra_params() {
        let ct = ContentType::parse("text/plain; format=flowed; charset: latin1");
        assert_eq!(ct.charset(), Some("latin1"));
        let ct = ContentType::parse("image/png");
        assert_eq!(ct.charset(), None);
        assert!(ct.is_image());
    }

    #[test]
    fn structured_suffix() {
        assert!(ContentType::parse("application/json").is_structured());
        assert!(ContentType::parse("application/geo+json; charset=utf-8").is_structured());
        assert!(!ContentType::parse("application/xml").is_structured());
        assert!(!ContentType::parse("+json").is_structured());
    }

    #[test]
    fn extension_lookup() {
        assert_eq!(for_extension("PNG").unwrap(), IMAGE_PNG);
        assert_eq!(for_extension(".jpeg").unwrap(), IMAGE_JPEG);
        assert_eq!(for_extension("json").unwrap(), APPLICATION_JSON);
        assert_eq!(
            for_path(Path::new("/tmp/notes.TXT")).unwrap(),
            TEXT_PLAIN
        );
    }

    #[test]
    fn unknown_extension_is_reported() {
        assert!(matches!(
            for_extension("xyz"),
            Err(CodecError::UnknownExtension(e)) if e == "xyz"
        ));
        assert!(matches!(
            for_path(Path::new("Makefile")),
            Err(CodecError::UnknownExtension(_))
        ));
    }
}
