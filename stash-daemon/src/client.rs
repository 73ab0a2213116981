//! Client role: push/pull/last/status against one peer's transfer server.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use stash_core::transfer::{
    ErrorBody, ErrorKind, PushAck, StatusBody, HEADER_COUNT, HEADER_INSTANCE, HEADER_SINCE,
    HEADER_UUID, MAX_BODY_LEN,
};
use stash_core::{CodecError, DeviceId, Item, Operation, StatusReport};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// Local encode failure, or a codec error the peer reported for our push.
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("peer rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        kind: Option<ErrorKind>,
        message: String,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// What pull/last produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Pulled {
    Item(Item),
    /// Peer has nothing to offer.
    Empty,
    /// Conditional pull: the caller already holds the current item.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct PullResponse {
    pub outcome: Pulled,
    /// Count, type and identity the response carried. `content_type` is `None` for
    /// `Unchanged` since a 304 does not restate it.
    pub report: StatusReport,
}

#[derive(Debug, Clone)]
pub struct PushResponse {
    pub ack: PushAck,
    pub identity: Option<DeviceId>,
    pub instance: Option<Uuid>,
}

/// Identity headers every server response carries.
#[derive(Debug, Clone, Copy, Default)]
struct ServerTag {
    identity: Option<DeviceId>,
    instance: Option<Uuid>,
}

impl ServerTag {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            identity: header_str(headers, HEADER_UUID).and_then(|s| s.parse().ok()),
            instance: header_str(headers, HEADER_INSTANCE).and_then(|s| s.parse().ok()),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// HTTP client bound to one peer address. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StashClient {
    http: reqwest::Client,
    addr: SocketAddr,
}

impl StashClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { http, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn url(&self, op: Operation) -> String {
        format!("http://{}{}", self.addr, op.path())
    }

    /// Encode and push an item; it becomes the peer's current item.
    pub async fn push(&self, item: &Item) -> Result<PushResponse, ClientError> {
        let encoded = item.encode()?;
        self.push_raw(encoded.body, encoded.content_type).await
    }

    /// Push bytes as-is under `content_type`; the peer decides whether it can hold them.
    pub async fn push_raw(
        &self,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<PushResponse, ClientError> {
        tracing::debug!(peer = %self.addr, content_type, bytes = body.len(), "push");
        let resp = self
            .http
            .post(self.url(Operation::Push))
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        let resp = check(resp, Some(content_type)).await?;
        let tag = ServerTag::from_headers(resp.headers());
        let bytes = resp.bytes().await?;
        let ack: PushAck = serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::InvalidResponse(format!("push ack: {}", e)))?;
        Ok(PushResponse {
            ack,
            identity: tag.identity,
            instance: tag.instance,
        })
    }

    /// Fetch the current item. With `since`, the peer answers `Unchanged` if it is still
    /// at that count in that instance.
    pub async fn pull(&self, since: Option<(u64, Uuid)>) -> Result<PullResponse, ClientError> {
        self.fetch(Operation::Pull, since).await
    }

    /// Fetch the current item unconditionally.
    pub async fn last(&self) -> Result<PullResponse, ClientError> {
        self.fetch(Operation::Last, None).await
    }

    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        let resp = self.http.get(self.url(Operation::Status)).send().await?;
        let resp = check(resp, None).await?;
        let tag = ServerTag::from_headers(resp.headers());
        let bytes = resp.bytes().await?;
        let body: StatusBody = serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::InvalidResponse(format!("status body: {}", e)))?;
        Ok(StatusReport {
            identity: tag.identity,
            instance: tag.instance,
            content_type: body.content_type,
            items_count: body.items_count,
        })
    }

    async fn fetch(
        &self,
        op: Operation,
        since: Option<(u64, Uuid)>,
    ) -> Result<PullResponse, ClientError> {
        let mut req = self.http.get(self.url(op));
        if let Some((count, instance)) = since {
            req = req
                .header(HEADER_SINCE, count.to_string())
                .header(HEADER_INSTANCE, instance.to_string());
        }
        let resp = check(req.send().await?, None).await?;
        let tag = ServerTag::from_headers(resp.headers());
        let items_count = header_str(resp.headers(), HEADER_COUNT)
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| ClientError::InvalidResponse(format!("missing {}", HEADER_COUNT)))?;
        let content_type = header_str(resp.headers(), CONTENT_TYPE.as_str()).map(str::to_string);
        let status = resp.status();
        let (outcome, content_type) = match status {
            StatusCode::NO_CONTENT => (Pulled::Empty, None),
            StatusCode::NOT_MODIFIED => (Pulled::Unchanged, None),
            StatusCode::OK => {
                let ct = content_type.ok_or_else(|| {
                    ClientError::InvalidResponse("item without content type".into())
                })?;
                let bytes = resp.bytes().await?;
                if bytes.len() > MAX_BODY_LEN {
                    return Err(ClientError::InvalidResponse(format!(
                        "body of {} bytes exceeds limit",
                        bytes.len()
                    )));
                }
                (Pulled::Item(Item::decode(&bytes, &ct)?), Some(ct))
            }
            other => {
                return Err(ClientError::InvalidResponse(format!(
                    "unexpected status {}",
                    other
                )))
            }
        };
        tracing::debug!(peer = %self.addr, ?op, items_count, status = status.as_u16(), "fetched");
        Ok(PullResponse {
            outcome,
            report: StatusReport {
                identity: tag.identity,
                instance: tag.instance,
                content_type,
                items_count,
            },
        })
    }
}

/// Turn a non-success response into an error. `sent_type` lets a push rebuild the
/// codec error the server reported.
async fn check(
    resp: reqwest::Response,
    sent_type: Option<&str>,
) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(resp);
    }
    let bytes = resp.bytes().await?;
    match serde_json::from_slice::<ErrorBody>(&bytes) {
        Ok(body) => {
            if let Some(codec) = sent_type.and_then(|ct| body.to_codec(ct)) {
                return Err(ClientError::Codec(codec));
            }
            Err(ClientError::Rejected {
                status: status.as_u16(),
                kind: Some(body.error),
                message: body.message,
            })
        }
        Err(_) => Err(ClientError::Rejected {
            status: status.as_u16(),
            kind: None,
            message: String::from_utf8_lossy(&bytes).into_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::spawn_test_server;
    use rand::Rng;
    use stash_core::Bitmap;
    use std::collections::HashMap;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn every_kind_survives_the_trip() {
        let (addr, state) = spawn_test_server().await;
        let client = StashClient::new(addr, TIMEOUT).unwrap();

        let mut rng = rand::thread_rng();
        let pixels: Vec<u8> = (0..8 * 6 * 4).map(|_| rng.gen()).collect();
        let items = vec![
            Item::text("naïve café"),
            Item::Image(Bitmap::from_rgba(8, 6, pixels).unwrap()),
            Item::from_json(serde_json::json!({"lat": 51.5, "tags": ["a"]})).unwrap(),
        ];
        for (i, item) in items.into_iter().enumerate() {
            let pushed = client.push(&item).await.unwrap();
            assert_eq!(pushed.ack.items_count, i as u64 + 1);
            assert_eq!(pushed.identity, Some(state.identity()));
            let pulled = client.last().await.unwrap();
            assert_eq!(pulled.outcome, Pulled::Item(item));
            assert_eq!(pulled.report.items_count, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn empty_and_unchanged() {
        let (addr, state) = spawn_test_server().await;
        let client = StashClient::new(addr, TIMEOUT).unwrap();
        let r = client.pull(None).await.unwrap();
        assert_eq!(r.outcome, Pulled::Empty);
        assert_eq!(r.report.items_count, 0);
        assert_eq!(r.report.instance, Some(state.instance()));

        client.push(&Item::text("a")).await.unwrap();
        let r = client.pull(Some((1, state.instance()))).await.unwrap();
        assert_eq!(r.outcome, Pulled::Unchanged);
        let r = client.pull(Some((0, state.instance()))).await.unwrap();
        assert_eq!(r.outcome, Pulled::Item(Item::text("a")));
    }

    #[tokio::test]
    async fn rejected_push_reports_codec_error() {
        let (addr, state) = spawn_test_server().await;
        let client = StashClient::new(addr, TIMEOUT).unwrap();
        let err = client
            .push_raw(b"\x00\x01".to_vec(), "video/mp4")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Codec(CodecError::UnsupportedContentType(ref ct)) if ct == "video/mp4"
        ));
        let err = client
            .push_raw(b"{not json".to_vec(), "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Codec(CodecError::MalformedPayload { .. })));
        assert_eq!(client.status().await.unwrap().items_count, 0);
        assert!(state.current().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_peer_is_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = StashClient::new(addr, TIMEOUT).unwrap();
        assert!(matches!(
            client.status().await,
            Err(ClientError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_pushes_and_pulls_stay_consistent() {
        let (addr, _state) = spawn_test_server().await;
        let client = StashClient::new(addr, TIMEOUT).unwrap();
        let n = 24u64;

        let mut pushes = Vec::new();
        for i in 0..n {
            let c = client.clone();
            pushes.push(tokio::spawn(async move {
                let text = format!("item-{}", i);
                let ack = c.push(&Item::text(text.clone())).await.unwrap().ack;
                (ack.items_count, text)
            }));
        }
        let mut pulls = Vec::new();
        for _ in 0..n {
            let c = client.clone();
            pulls.push(tokio::spawn(async move { c.last().await.unwrap() }));
        }

        let mut by_count = HashMap::new();
        for p in pushes {
            let (count, text) = p.await.unwrap();
            assert!(by_count.insert(count, text).is_none(), "counts are unique");
        }
        assert_eq!(by_count.len() as u64, n);
        assert!((1..=n).all(|c| by_count.contains_key(&c)));

        // Whatever a pull saw, the count and the item belong to the same push.
        for p in pulls {
            let r = p.await.unwrap();
            match r.outcome {
                Pulled::Empty => assert_eq!(r.report.items_count, 0),
                Pulled::Item(item) => {
                    assert_eq!(item.as_text(), Some(by_count[&r.report.items_count].as_str()))
                }
                Pulled::Unchanged => panic!("last never answers unchanged"),
            }
        }
        assert_eq!(client.status().await.unwrap().items_count, n);
    }
}
