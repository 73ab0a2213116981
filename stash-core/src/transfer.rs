//! Transfer protocol: the four request/response operations, their HTTP mapping and bodies.

use serde::{Deserialize, Serialize};

use crate::item::CodecError;

/// Item count of the server's current slot, on pull/last responses.
pub const HEADER_COUNT: &str = "x-stash-count";
/// Count the caller already holds; lets `/pull` answer 304.
pub const HEADER_SINCE: &str = "x-stash-since";
/// Random per server start. Counters are only comparable within one instance.
pub const HEADER_INSTANCE: &str = "x-stash-instance";
/// Server device identity.
pub const HEADER_UUID: &str = "x-stash-uuid";

/// Largest accepted request or response body (16 MiB).
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Push,
    Pull,
    Last,
    Status,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Push,
        Operation::Pull,
        Operation::Last,
        Operation::Status,
    ];

    pub fn method(self) -> &'static str {
        match self {
            Operation::Push => "POST",
            Operation::Pull | Operation::Last | Operation::Status => "GET",
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Operation::Push => "/push",
            Operation::Pull => "/pull",
            Operation::Last => "/last",
            Operation::Status => "/status",
        }
    }

    /// Map an HTTP method and request target to an operation. The query string is ignored.
    pub fn route(method: &str, target: &str) -> Result<Operation, RouteError> {
        let path = target.split(&['?', '#'][..]).next().unwrap_or("");
        let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };
        let op = Operation::ALL
            .into_iter()
            .find(|op| op.path() == path)
            .ok_or(RouteError::NotFound)?;
        if method.eq_ignore_ascii_case(op.method()) {
            Ok(op)
        } else {
            Err(RouteError::MethodNotAllowed(op))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no such endpoint")]
    NotFound,
    #[error("method not allowed for {0:?}")]
    MethodNotAllowed(Operation),
}

/// `/status` body. Content type and size are absent while the slot is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    pub items_count: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// `/push` success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub success: u8,
    pub items_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedContentType,
    MalformedPayload,
    PayloadTooLarge,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::UnsupportedContentType => 415,
            ErrorKind::MalformedPayload | ErrorKind::BadRequest => 400,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::Internal => 500,
        }
    }
}

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }

    pub fn from_codec(err: &CodecError) -> Self {
        let kind = match err {
            CodecError::UnsupportedContentType(_) => ErrorKind::UnsupportedContentType,
            CodecError::MalformedPayload { .. } | CodecError::UnknownExtension(_) => {
                ErrorKind::MalformedPayload
            }
        };
        Self::new(kind, err.to_string())
    }

    /// Rebuild the codec error a server reported, if it was one.
    pub fn to_codec(&self, content_type: &str) -> Option<CodecError> {
        match self.error {
            ErrorKind::UnsupportedContentType => {
                Some(CodecError::UnsupportedContentType(content_type.to_string()))
            }
            ErrorKind::MalformedPayload => Some(CodecError::MalformedPayload {
                content_type: content_type.to_string(),
                reason: self.message.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes() {
        assert_eq!(Operation::route("POST", "/push"), Ok(Operation::Push));
        assert_eq!(Operation::route("get", "/pull?x=1"), Ok(Operation::Pull));
        assert_eq!(Operation::route("GET", "/last/"), Ok(Operation::Last));
        assert_eq!(Operation::route("GET", "/status"), Ok(Operation::Status));
        assert_eq!(
            Operation::route("GET", "/push"),
            Err(RouteError::MethodNotAllowed(Operation::Push))
        );
        assert_eq!(Operation::route("GET", "/"), Err(RouteError::NotFound));
        assert_eq!(Operation::route("GET", "/pushy"), Err(RouteError::NotFound));
    }

    #[test]
    fn status_body_json_shape() {
        let empty: StatusBody = serde_json::from_str(r#"{"items_count":0}"#).unwrap();
        assert_eq!(empty.content_type, None);
        let s = serde_json::to_value(StatusBody {
            items_count: 3,
            content_type: Some("text/plain; charset=utf-8".into()),
            size: Some(5),
        })
        .unwrap();
        assert_eq!(s["items_count"], 3);
        assert_eq!(s["content_type"], "text/plain; charset=utf-8");
    }

    #[test]
    fn codec_errors_survive_the_wire() {
        let err = CodecError::UnsupportedContentType("video/mp4".into());
        let body = ErrorBody::from_codec(&err);
        assert_eq!(body.error.http_status(), 415);
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("unsupported_content_type"));
        let back: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_codec("video/mp4"), Some(err));
        assert_eq!(ErrorBody::new(ErrorKind::NotFound, "x").to_codec("a/b"), None);
    }
}
