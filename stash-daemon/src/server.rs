//! Server role: HTTP responder for push/pull/last/status over the single current-item slot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use stash_core::mime;
use stash_core::transfer::{
    ErrorBody, ErrorKind, PushAck, RouteError, StatusBody, HEADER_COUNT, HEADER_INSTANCE,
    HEADER_SINCE, HEADER_UUID, MAX_BODY_LEN,
};
use stash_core::{CodecError, DeviceId, EncodedItem, Item, Operation};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use uuid::Uuid;

const MAX_HEAD_LEN: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;
/// A client that has not sent a full request by then is dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of the item this device offers. Supplied by the hosting application; always
/// accessed under the server's slot lock.
pub trait CurrentItemProvider: Send + 'static {
    fn current(&self) -> Option<Arc<Item>>;
    fn replace(&mut self, item: Arc<Item>);
}

/// Keeps the current item in memory.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    item: Option<Arc<Item>>,
}

impl MemoryProvider {
    pub fn with_item(item: Item) -> Self {
        Self {
            item: Some(Arc::new(item)),
        }
    }
}

impl CurrentItemProvider for MemoryProvider {
    fn current(&self) -> Option<Arc<Item>> {
        self.item.clone()
    }

    fn replace(&mut self, item: Arc<Item>) {
        self.item = Some(item);
    }
}

struct Slot {
    provider: Box<dyn CurrentItemProvider>,
    items_count: u64,
    /// Wire form of the last item served, reused while the provider returns the same Arc.
    encoded: Option<(Arc<Item>, Arc<EncodedItem>)>,
}

impl Slot {
    fn encoded_current(&mut self) -> Result<Option<Arc<EncodedItem>>, CodecError> {
        let Some(item) = self.provider.current() else {
            return Ok(None);
        };
        if let Some((cached, enc)) = &self.encoded {
            if Arc::ptr_eq(cached, &item) {
                return Ok(Some(enc.clone()));
            }
        }
        let enc = Arc::new(item.encode()?);
        self.encoded = Some((item, enc.clone()));
        Ok(Some(enc))
    }
}

/// Consistent view of the slot: the count always belongs to the item next to it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub items_count: u64,
    pub item: Option<Arc<EncodedItem>>,
}

/// Shared server state: the slot, its counter, and this instance's identity.
pub struct StashState {
    slot: Mutex<Slot>,
    identity: DeviceId,
    instance: Uuid,
}

impl StashState {
    pub fn new(identity: DeviceId) -> Self {
        Self::with_provider(identity, Box::new(MemoryProvider::default()))
    }

    pub fn with_provider(identity: DeviceId, provider: Box<dyn CurrentItemProvider>) -> Self {
        let items_count = u64::from(provider.current().is_some());
        Self {
            slot: Mutex::new(Slot {
                provider,
                items_count,
                encoded: None,
            }),
            identity,
            instance: Uuid::new_v4(),
        }
    }

    pub fn identity(&self) -> DeviceId {
        self.identity
    }

    /// Random per server start; counters are only comparable within one instance.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Replace the current item (last writer wins) and return the new count.
    pub async fn store(&self, item: Item) -> u64 {
        let item = Arc::new(item);
        let mut slot = self.slot.lock().await;
        slot.provider.replace(item);
        slot.items_count += 1;
        slot.items_count
    }

    pub async fn current(&self) -> Option<Arc<Item>> {
        self.slot.lock().await.provider.current()
    }

    pub async fn snapshot(&self) -> Result<Snapshot, CodecError> {
        let mut slot = self.slot.lock().await;
        Ok(Snapshot {
            item: slot.encoded_current()?,
            items_count: slot.items_count,
        })
    }

    pub async fn status(&self) -> Result<StatusBody, CodecError> {
        let snap = self.snapshot().await?;
        Ok(StatusBody {
            items_count: snap.items_count,
            content_type: snap.item.as_ref().map(|e| e.content_type.to_string()),
            size: snap.item.as_ref().map(|e| e.body.len() as u64),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind transfer port {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Server {
    listener: TcpListener,
    state: Arc<StashState>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, state: Arc<StashState>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &Arc<StashState> {
        &self.state
    }

    /// Accept connections until the task is dropped; one request per connection.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!(
            addr = %self.listener.local_addr()?,
            identity = %self.state.identity,
            "transfer server listening"
        );
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, peer, state).await {
                    tracing::debug!(%peer, "connection ended with error: {}", e);
                }
            });
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: Arc<StashState>,
) -> std::io::Result<()> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Err(_) => {
            tracing::debug!(%peer, "request timed out");
            return Ok(());
        }
        Ok(Err(RequestError::Closed)) => return Ok(()),
        Ok(Err(RequestError::Io(e))) => return Err(e),
        Ok(Err(RequestError::TooLarge(len))) => {
            tracing::warn!(%peer, len, "rejecting oversized body");
            let body = ErrorBody::new(
                ErrorKind::PayloadTooLarge,
                format!("body of {} bytes exceeds {}", len, MAX_BODY_LEN),
            );
            return write_response(&mut stream, &state, Response::error(body)).await;
        }
        Ok(Err(RequestError::Malformed(reason))) => {
            tracing::warn!(%peer, "malformed request: {}", reason);
            let body = ErrorBody::new(ErrorKind::BadRequest, reason);
            return write_response(&mut stream, &state, Response::error(body)).await;
        }
        Ok(Ok(r)) => r,
    };
    let method = request.method.clone();
    let target = request.target.clone();
    let response = respond(&state, request).await;
    tracing::debug!(%peer, %method, %target, status = response.status, "handled request");
    write_response(&mut stream, &state, response).await
}

#[derive(Debug, Default)]
struct Request {
    method: String,
    target: String,
    content_type: Option<String>,
    content_length: usize,
    since: Option<u64>,
    instance: Option<Uuid>,
    body: Vec<u8>,
}

#[derive(Debug)]
enum RequestError {
    /// Peer closed before sending anything.
    Closed,
    Io(std::io::Error),
    Malformed(String),
    TooLarge(usize),
}

async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Request, RequestError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 8192];
    let (mut request, head_len) = loop {
        let n = stream.read(&mut chunk).await.map_err(RequestError::Io)?;
        if n == 0 {
            return Err(if buf.is_empty() {
                RequestError::Closed
            } else {
                RequestError::Malformed("connection closed mid-request".into())
            });
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(parsed) = parse_head(&buf)? {
            break parsed;
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(RequestError::Malformed("request head too large".into()));
        }
    };
    if request.content_length > MAX_BODY_LEN {
        return Err(RequestError::TooLarge(request.content_length));
    }
    let mut body = buf.split_off(head_len);
    while body.len() < request.content_length {
        let n = stream.read(&mut chunk).await.map_err(RequestError::Io)?;
        if n == 0 {
            return Err(RequestError::Malformed("body shorter than content-length".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(request.content_length);
    request.body = body;
    Ok(request)
}

/// Parse the request line and headers once they are complete.
fn parse_head(buf: &[u8]) -> Result<Option<(Request, usize)>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RequestError::Malformed(e.to_string())),
    };
    let mut out = Request {
        method: req.method.unwrap_or("").to_string(),
        target: req.path.unwrap_or("/").to_string(),
        ..Request::default()
    };
    for h in req.headers.iter() {
        let value = std::str::from_utf8(h.value)
            .map_err(|_| RequestError::Malformed(format!("header {} is not UTF-8", h.name)))?
            .trim();
        if h.name.eq_ignore_ascii_case("Content-Type") {
            out.content_type = Some(value.to_string());
        } else if h.name.eq_ignore_ascii_case("Content-Length") {
            out.content_length = value
                .parse()
                .map_err(|_| RequestError::Malformed(format!("bad content-length {:?}", value)))?;
        } else if h.name.eq_ignore_ascii_case("Transfer-Encoding")
            && !value.eq_ignore_ascii_case("identity")
        {
            return Err(RequestError::Malformed(format!(
                "transfer-encoding {} not supported",
                value
            )));
        } else if h.name.eq_ignore_ascii_case(HEADER_SINCE) {
            out.since = value.parse().ok();
        } else if h.name.eq_ignore_ascii_case(HEADER_INSTANCE) {
            out.instance = value.parse().ok();
        }
    }
    Ok(Some((out, head_len)))
}

struct Response {
    status: u16,
    content_type: Option<String>,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Response {
    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: Some(mime::APPLICATION_JSON.to_string()),
                headers: Vec::new(),
                body,
            },
            Err(e) => {
                tracing::error!("failed to serialize response body: {}", e);
                Self::empty(500)
            }
        }
    }

    fn error(body: ErrorBody) -> Self {
        Self::json(body.error.http_status(), &body)
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn head(&self, state: &StashState) -> String {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        head.push_str(&format!("{}: {}\r\n", HEADER_UUID, state.identity));
        head.push_str(&format!("{}: {}\r\n", HEADER_INSTANCE, state.instance));
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(ct) = &self.content_type {
            head.push_str(&format!("Content-Type: {}\r\n", ct));
        }
        // 204 and 304 never carry a body.
        if !matches!(self.status, 204 | 304) {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("Connection: close\r\n\r\n");
        head
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        _ => "Internal Server Error",
    }
}

async fn write_response(
    stream: &mut TcpStream,
    state: &StashState,
    response: Response,
) -> std::io::Result<()> {
    stream.write_all(response.head(state).as_bytes()).await?;
    if !response.body.is_empty() {
        stream.write_all(&response.body).await?;
    }
    stream.flush().await?;
    stream.shutdown().await
}

async fn respond(state: &StashState, request: Request) -> Response {
    let op = match Operation::route(&request.method, &request.target) {
        Ok(op) => op,
        Err(RouteError::NotFound) => {
            return Response::error(ErrorBody::new(
                ErrorKind::NotFound,
                format!("no endpoint at {}", request.target),
            ))
        }
        Err(RouteError::MethodNotAllowed(op)) => {
            return Response::error(ErrorBody::new(
                ErrorKind::MethodNotAllowed,
                format!("{} expects {}", op.path(), op.method()),
            ))
            .header("Allow", op.method())
        }
    };
    match op {
        Operation::Push => push(state, request).await,
        Operation::Pull => {
            let since = request.since.zip(request.instance);
            serve_item(state, since).await
        }
        Operation::Last => serve_item(state, None).await,
        Operation::Status => match state.status().await {
            Ok(status) => {
                let count = status.items_count.to_string();
                Response::json(200, &status).header(HEADER_COUNT, count)
            }
            Err(e) => internal_error(e),
        },
    }
}

async fn push(state: &StashState, request: Request) -> Response {
    let content_type = request
        .content_type
        .as_deref()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);
    // Decode before taking the slot lock; a failed push leaves the slot untouched.
    let item = match Item::decode(&request.body, content_type) {
        Ok(item) => item,
        Err(e) => {
            tracing::warn!("rejected push: {}", e);
            return Response::error(ErrorBody::from_codec(&e));
        }
    };
    let kind = item.kind();
    let items_count = state.store(item).await;
    tracing::info!(%kind, items_count, bytes = request.body.len(), "stored pushed item");
    Response::json(
        200,
        &PushAck {
            success: 1,
            items_count,
        },
    )
}

/// Answer pull/last. `since` is the (count, instance) the caller already holds.
async fn serve_item(state: &StashState, since: Option<(u64, Uuid)>) -> Response {
    let snap = match state.snapshot().await {
        Ok(s) => s,
        Err(e) => return internal_error(e),
    };
    let count = snap.items_count.to_string();
    let Some(encoded) = snap.item else {
        return Response::empty(204).header(HEADER_COUNT, count);
    };
    if since == Some((snap.items_count, state.instance)) {
        return Response::empty(304).header(HEADER_COUNT, count);
    }
    Response {
        status: 200,
        content_type: Some(encoded.content_type.to_string()),
        headers: vec![(HEADER_COUNT, count)],
        body: encoded.body.clone(),
    }
}

fn internal_error(e: CodecError) -> Response {
    tracing::error!("failed to encode current item: {}", e);
    Response::error(ErrorBody::new(ErrorKind::Internal, e.to_string()))
}

#[cfg(test)]
pub(crate) async fn spawn_test_server() -> (SocketAddr, Arc<StashState>) {
    spawn_test_server_as(DeviceId::generate()).await
}

#[cfg(test)]
pub(crate) async fn spawn_test_server_as(identity: DeviceId) -> (SocketAddr, Arc<StashState>) {
    let state = Arc::new(StashState::new(identity));
    let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], 0)), state.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct RawResponse {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    }

    async fn raw(addr: SocketAddr, request: &[u8]) -> RawResponse {
        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(request).await.unwrap();
        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut resp = httparse::Response::new(&mut headers);
        let n = match resp.parse(&out).unwrap() {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => panic!("incomplete response"),
        };
        RawResponse {
            status: resp.code.unwrap(),
            headers: resp
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
            body: out[n..].to_vec(),
        }
    }

    #[tokio::test]
    async fn push_then_pull_over_raw_http() {
        let (addr, state) = spawn_test_server().await;
        let r = raw(
            addr,
            b"POST /push HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        assert_eq!(r.status, 200);
        let ack: PushAck = serde_json::from_slice(&r.body).unwrap();
        assert_eq!(ack, PushAck { success: 1, items_count: 1 });
        assert_eq!(r.headers[HEADER_UUID], state.identity().to_string());

        let r = raw(addr, b"GET /pull HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(r.status, 200);
        assert_eq!(r.body, b"hello");
        assert_eq!(r.headers[HEADER_COUNT], "1");
        assert_eq!(r.headers["content-type"], mime::TEXT_PLAIN_UTF8);
    }

    #[tokio::test]
    async fn conditional_pull_answers_not_modified() {
        let (addr, state) = spawn_test_server().await;
        state.store(Item::text("x")).await;
        let req = format!(
            "GET /pull HTTP/1.1\r\n{}: 1\r\n{}: {}\r\n\r\n",
            HEADER_SINCE,
            HEADER_INSTANCE,
            state.instance()
        );
        assert_eq!(raw(addr, req.as_bytes()).await.status, 304);

        // Same count from another instance is not current.
        let req = format!(
            "GET /pull HTTP/1.1\r\n{}: 1\r\n{}: {}\r\n\r\n",
            HEADER_SINCE,
            HEADER_INSTANCE,
            Uuid::new_v4()
        );
        assert_eq!(raw(addr, req.as_bytes()).await.status, 200);

        // `last` ignores the condition.
        let req = format!(
            "GET /last HTTP/1.1\r\n{}: 1\r\n{}: {}\r\n\r\n",
            HEADER_SINCE,
            HEADER_INSTANCE,
            state.instance()
        );
        assert_eq!(raw(addr, req.as_bytes()).await.status, 200);
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let (addr, state) = spawn_test_server().await;
        let r = raw(addr, b"GET /pull HTTP/1.1\r\n\r\n").await;
        assert_eq!(r.status, 204);
        assert_eq!(r.headers[HEADER_COUNT], "0");

        assert_eq!(raw(addr, b"GET /nope HTTP/1.1\r\n\r\n").await.status, 404);
        let r = raw(addr, b"DELETE /status HTTP/1.1\r\n\r\n").await;
        assert_eq!(r.status, 405);
        assert_eq!(r.headers["allow"], "GET");

        let r = raw(
            addr,
            b"POST /push HTTP/1.1\r\nContent-Type: video/mp4\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await;
        assert_eq!(r.status, 415);
        let err: ErrorBody = serde_json::from_slice(&r.body).unwrap();
        assert_eq!(err.error, ErrorKind::UnsupportedContentType);

        let r = raw(
            addr,
            b"POST /push HTTP/1.1\r\nContent-Type: image/png\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await;
        assert_eq!(r.status, 400);

        let big = format!(
            "POST /push HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_LEN + 1
        );
        assert_eq!(raw(addr, big.as_bytes()).await.status, 413);
        assert_eq!(raw(addr, b"NOT HTTP\r\n\r\n").await.status, 400);

        // None of the rejected pushes touched the slot.
        assert_eq!(state.status().await.unwrap().items_count, 0);
    }

    #[tokio::test]
    async fn status_reports_size_and_type() {
        let (addr, state) = spawn_test_server().await;
        state.store(Item::text("four")).await;
        let r = raw(addr, b"GET /status HTTP/1.1\r\n\r\n").await;
        assert_eq!(r.headers[HEADER_COUNT], "1");
        assert_eq!(r.headers[HEADER_UUID], state.identity().to_string());
        let body: StatusBody = serde_json::from_slice(&r.body).unwrap();
        assert_eq!(body.items_count, 1);
        assert_eq!(body.size, Some(4));
        assert_eq!(body.content_type.as_deref(), Some(mime::TEXT_PLAIN_UTF8));
    }

    #[tokio::test]
    async fn provider_seed_counts_as_one_item() {
        let state = StashState::with_provider(
            DeviceId::generate(),
            Box::new(MemoryProvider::with_item(Item::text("seed"))),
        );
        let snap = state.snapshot().await.unwrap();
        assert_eq!(snap.items_count, 1);
        assert_eq!(snap.item.unwrap().body, b"seed");
        assert_eq!(state.store(Item::text("next")).await, 2);
    }

    #[tokio::test]
    async fn body_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client
                .write_all(b"POST /push HTTP/1.1\r\nContent-Length: 10\r\n\r\n01234")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"56789").await.unwrap();
            client
        });
        let req = read_request(&mut server).await.unwrap();
        assert_eq!(req.body, b"0123456789");
        assert_eq!(req.method, "POST");
        writer.await.unwrap();
    }
}
