//! Shared mocks for the integration tests.
//!
//! The edge side is simulated with in-memory duplex pipes and scripted
//! connections; origins are real loopback TCP listeners.

#![allow(dead_code)]

use async_trait::async_trait;
use edge_tunnel::application::{AdmittedStream, ConnectionHandle, HandleSettings};
use edge_tunnel::domain::entities::{OriginTarget, RequestHead, ResponseHead, StreamKind};
use edge_tunnel::domain::ports::{
    EdgeConnection, EdgeConnector, EdgeStream, InboundStream, TransportError,
};
use edge_tunnel::domain::value_objects::ConnIndex;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ===== Edge side =====

/// Response heads the dispatcher sent on one stream.
pub type Heads = Arc<Mutex<Vec<ResponseHead>>>;

/// Edge half of an in-memory stream.
pub struct DuplexEdge {
    io: DuplexStream,
    heads: Heads,
}

impl AsyncRead for DuplexEdge {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexEdge {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[async_trait]
impl EdgeStream for DuplexEdge {
    async fn send_response_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        self.heads.lock().push(head.clone());
        Ok(())
    }
}

/// Build an inbound stream plus the client end of its pipe.
pub fn inbound(
    id: u64,
    kind: StreamKind,
    host: &str,
    request: Option<RequestHead>,
) -> (InboundStream, DuplexStream, Heads) {
    let (edge, client) = tokio::io::duplex(64 * 1024);
    let heads: Heads = Arc::new(Mutex::new(Vec::new()));
    let stream = InboundStream {
        id,
        kind,
        target: OriginTarget::new(host),
        request,
        io: Box::new(DuplexEdge {
            io: edge,
            heads: heads.clone(),
        }),
    };
    (stream, client, heads)
}

pub fn websocket_request() -> RequestHead {
    RequestHead::new("GET", "/ws")
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
}

pub type Feed = mpsc::UnboundedSender<Result<Option<InboundStream>, TransportError>>;

/// Edge connection driven by a channel the test holds.
///
/// Dropping the feed ends the accept loop as if the edge closed cleanly.
pub struct ScriptedConnection {
    script: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Option<InboundStream>, TransportError>>>,
    limit: usize,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl EdgeConnection for ScriptedConnection {
    async fn accept_stream(&self) -> Result<Option<InboundStream>, TransportError> {
        match self.script.lock().await.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }

    async fn close(&self, _graceful: bool) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn max_concurrent_streams(&self) -> usize {
        self.limit
    }
}

/// Connector handing out scripted connections.
///
/// The first `fail_first` attempts are refused. Every successful connect
/// leaves its feed behind so the test can push streams or hang up.
pub struct ScriptedConnector {
    fail_first: AtomicU64,
    pub attempts: Mutex<Vec<(ConnIndex, Instant)>>,
    pub feeds: Mutex<Vec<(ConnIndex, Feed)>>,
    pub closes: Arc<AtomicUsize>,
    limit: usize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(fail_first: u64) -> Self {
        Self {
            fail_first: AtomicU64::new(fail_first),
            attempts: Mutex::new(Vec::new()),
            feeds: Mutex::new(Vec::new()),
            closes: Arc::new(AtomicUsize::new(0)),
            limit: 100,
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn connected_indexes(&self) -> Vec<ConnIndex> {
        self.feeds.lock().iter().map(|(index, _)| *index).collect()
    }

    /// Hang up the connection at `index`, as the edge would.
    pub fn hang_up(&self, index: ConnIndex) {
        self.feeds.lock().retain(|(i, _)| *i != index);
    }

    pub fn feed(&self, index: ConnIndex) -> Option<Feed> {
        self.feeds
            .lock()
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, feed)| feed.clone())
    }
}

#[async_trait]
impl EdgeConnector for ScriptedConnector {
    async fn connect(&self, index: ConnIndex) -> Result<Box<dyn EdgeConnection>, TransportError> {
        self.attempts.lock().push((index, Instant::now()));

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectFailed("edge refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().push((index, tx));
        Ok(Box::new(ScriptedConnection {
            script: tokio::sync::Mutex::new(rx),
            limit: self.limit,
            closes: self.closes.clone(),
        }))
    }
}

/// An established handle whose streams come from the returned feed.
pub async fn established_handle() -> (Arc<ConnectionHandle>, Feed) {
    let connector = ScriptedConnector::new();
    let handle = Arc::new(ConnectionHandle::new(
        ConnIndex(0),
        HandleSettings {
            error_threshold: 5,
            drain_timeout: Duration::from_millis(500),
            max_streams: None,
        },
    ));
    handle
        .establish(&connector, Duration::from_secs(1))
        .await
        .unwrap();
    let feed = connector.feed(ConnIndex(0)).unwrap();
    (handle, feed)
}

/// Push a stream through the handle and take it back out admitted.
pub async fn admit(handle: &ConnectionHandle, feed: &Feed, stream: InboundStream) -> AdmittedStream {
    feed.send(Ok(Some(stream))).unwrap();
    handle.accept_next_stream().await.unwrap()
}

// ===== Origin side =====

/// Read one request head and its Content-Length body.
pub async fn read_request(sock: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = sock.read(&mut chunk).await.unwrap();
        assert!(n > 0, "origin saw EOF before the request head ended");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < length {
        let n = sock.read(&mut chunk).await.unwrap();
        assert!(n > 0, "origin saw EOF inside the request body");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

/// One-shot HTTP origin answering every request with `response`.
///
/// The request head is handed back through the join handle.
pub async fn http_origin(response: &'static [u8]) -> (String, tokio::task::JoinHandle<(String, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let request = read_request(&mut sock).await;
        sock.write_all(response).await.unwrap();
        sock.shutdown().await.unwrap();
        request
    });
    (addr, task)
}

/// TCP origin echoing bytes until EOF.
///
/// A non-empty `preamble` is sent after reading one request head, the way an
/// HTTP origin accepts an upgrade.
pub async fn echo_origin(preamble: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        if !preamble.is_empty() {
            read_request(&mut sock).await;
            sock.write_all(preamble).await.unwrap();
        }
        let (mut rd, mut wr) = sock.split();
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
        let _ = wr.shutdown().await;
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}
