//! Item codec: the single transferable payload and its wire encoding.

use std::fmt;
use std::io::{self, Cursor};
use std::path::Path;

use image::{ImageFormat, RgbaImage};
use serde_json::{Map, Value};

use crate::mime::{self, ContentType};

/// Codec failure. Surfaced synchronously at encode/decode time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),
    #[error("malformed {content_type} payload: {reason}")]
    MalformedPayload { content_type: String, reason: String },
    #[error("unknown file extension {0:?}")]
    UnknownExtension(String),
}

/// Failure building an item from a local file.
#[derive(Debug, thiserror::Error)]
pub enum FileItemError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CodecError {
    fn malformed(ct: &ContentType, reason: impl fmt::Display) -> Self {
        CodecError::MalformedPayload {
            content_type: ct.essence().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Decoded RGBA8 bitmap. Equality is pixel equality.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(RgbaImage);

impl Bitmap {
    /// Build from raw RGBA8 pixels (row-major, 4 bytes per pixel).
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, CodecError> {
        let expected = width as usize * height as usize * 4;
        let got = pixels.len();
        RgbaImage::from_raw(width, height, pixels)
            .map(Bitmap)
            .ok_or_else(|| CodecError::MalformedPayload {
                content_type: mime::IMAGE_PNG.to_string(),
                reason: format!("expected {} pixel bytes, got {}", expected, got),
            })
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.0.as_raw()
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.0
    }

    fn to_png(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Cursor::new(Vec::new());
        self.0
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| CodecError::malformed(&ContentType::parse(mime::IMAGE_PNG), e))?;
        Ok(out.into_inner())
    }

    fn decode(bytes: &[u8], ct: &ContentType) -> Result<Self, CodecError> {
        let format = match ct.essence() {
            "image/png" => ImageFormat::Png,
            "image/jpeg" | "image/jpg" | "image/pjpeg" => ImageFormat::Jpeg,
            "image/gif" => ImageFormat::Gif,
            "image/bmp" | "image/x-ms-bmp" => ImageFormat::Bmp,
            _ => return Err(CodecError::UnsupportedContentType(ct.to_string())),
        };
        let img = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| CodecError::malformed(ct, e))?;
        Ok(Bitmap(img.to_rgba8()))
    }
}

impl From<RgbaImage> for Bitmap {
    fn from(img: RgbaImage) -> Self {
        Bitmap(img)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap({}x{})", self.width(), self.height())
    }
}

/// Which payload an [`Item`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Text,
    Image,
    Structured,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemKind::Text => "text",
            ItemKind::Image => "image",
            ItemKind::Structured => "structured",
        })
    }
}

/// The current item: exactly one payload kind, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Text(String),
    Image(Bitmap),
    /// JSON object; key order is irrelevant.
    Structured(Map<String, Value>),
}

/// Wire form of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedItem {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

impl Item {
    pub fn text(s: impl Into<String>) -> Self {
        Item::Text(s.into())
    }

    /// Structured item from a JSON value; only objects are accepted.
    pub fn from_json(value: Value) -> Result<Self, CodecError> {
        match value {
            Value::Object(map) => Ok(Item::Structured(map)),
            other => Err(CodecError::malformed(
                &ContentType::parse(mime::APPLICATION_JSON),
                format!("expected a JSON object, got {}", json_type_name(&other)),
            )),
        }
    }

    /// Item from a local file, typed by its extension.
    pub fn from_path(path: &Path) -> Result<Self, FileItemError> {
        let content_type = mime::for_path(path)?;
        let bytes = std::fs::read(path).map_err(|source| FileItemError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::decode(&bytes, content_type)?)
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            Item::Text(_) => ItemKind::Text,
            Item::Image(_) => ItemKind::Image,
            Item::Structured(_) => ItemKind::Structured,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Item::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&Bitmap> {
        match self {
            Item::Image(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Map<String, Value>> {
        match self {
            Item::Structured(m) => Some(m),
            _ => None,
        }
    }

    /// Content type used on the wire for this item.
    pub fn content_type(&self) -> &'static str {
        match self {
            Item::Text(_) => mime::TEXT_PLAIN_UTF8,
            Item::Image(_) => mime::IMAGE_PNG,
            Item::Structured(_) => mime::APPLICATION_JSON,
        }
    }

    /// Encode for transport. Text is UTF-8, images PNG, structured JSON.
    pub fn encode(&self) -> Result<EncodedItem, CodecError> {
        let body = match self {
            Item::Text(s) => s.as_bytes().to_vec(),
            Item::Image(b) => b.to_png()?,
            Item::Structured(m) => serde_json::to_vec(m).map_err(|e| {
                CodecError::malformed(&ContentType::parse(mime::APPLICATION_JSON), e)
            })?,
        };
        Ok(EncodedItem {
            body,
            content_type: self.content_type(),
        })
    }

    /// Decode wire bytes under the declared content type.
    pub fn decode(bytes: &[u8], content_type: &str) -> Result<Self, CodecError> {
        let ct = ContentType::parse(content_type);
        if ct.is_text() {
            decode_text(bytes, &ct).map(Item::Text)
        } else if ct.is_image() {
            Bitmap::decode(bytes, &ct).map(Item::Image)
        } else if ct.is_structured() {
            let value: Value =
                serde_json::from_slice(bytes).map_err(|e| CodecError::malformed(&ct, e))?;
            match value {
                Value::Object(map) => Ok(Item::Structured(map)),
                other => Err(CodecError::malformed(
                    &ct,
                    format!("expected a JSON object, got {}", json_type_name(&other)),
                )),
            }
        } else {
            Err(CodecError::UnsupportedContentType(content_type.to_string()))
        }
    }
}

impl From<Bitmap> for Item {
    fn from(b: Bitmap) -> Self {
        Item::Image(b)
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item({})", self.content_type())
    }
}

fn decode_text(bytes: &[u8], ct: &ContentType) -> Result<String, CodecError> {
    match ct.charset().unwrap_or("utf-8") {
        "utf-8" | "utf8" => {
            String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::malformed(ct, e))
        }
        "us-ascii" | "ascii" => {
            if bytes.is_ascii() {
                // ASCII is a subset of UTF-8.
                Ok(String::from_utf8_lossy(bytes).into_owned())
            } else {
                Err(CodecError::malformed(ct, "non-ASCII byte in us-ascii text"))
            }
        }
        "iso-8859-1" | "latin1" | "latin-1" => Ok(bytes.iter().map(|&b| b as char).collect()),
        other => Err(CodecError::malformed(
            ct,
            format!("unsupported charset {}", other),
        )),
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
