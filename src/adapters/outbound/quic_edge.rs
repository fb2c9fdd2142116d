//! QUIC Edge Transport
//!
//! Implements the edge transport ports over QUIC (via Quinn). Each handle
//! owns one QUIC connection; the edge opens one bidirectional stream per
//! logical stream.
//!
//! Stream framing:
//! 1. edge -> agent: length-prefixed bincode [`StreamHeader`]
//! 2. agent -> edge: length-prefixed bincode [`ResponseHead`]
//! 3. raw bytes in both directions
//!
//! Right after the handshake the agent announces itself on a unidirectional
//! stream with a [`ConnectionHello`].
//!
//! A stream whose header is malformed or late is reset and surfaced as a
//! protocol error; streams behind it are unaffected.

use crate::domain::entities::{OriginTarget, RequestHead, ResponseHead, StreamKind};
use crate::domain::ports::{EdgeConnection, EdgeConnector, EdgeStream, InboundStream, TransportError};
use crate::domain::value_objects::ConnIndex;
use async_trait::async_trait;
use quinn::{ClientConfig, Connection as QuinnConnection, Endpoint, RecvStream, SendStream, VarInt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// ALPN token spoken by both ends.
pub const ALPN: &[u8] = b"edgetunnel/1";

/// Upper bound on one control frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// How long the edge may take to send a stream header.
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_GRACEFUL: u32 = 0;
const CLOSE_FORCED: u32 = 1;
const STREAM_REJECTED: u32 = 2;

/// First frame on every edge-opened stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub kind: StreamKind,
    pub target: OriginTarget,
    pub request: Option<RequestHead>,
}

/// Announcement sent once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHello {
    pub index: ConnIndex,
    pub version: String,
}

// ==================== Sans-IO Functions ====================

/// Encode a frame: big-endian `u32` length followed by bincode data.
pub fn encode_frame<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let data = bincode::serialize(value)?;
    if data.len() > MAX_FRAME_BYTES {
        anyhow::bail!("frame of {} bytes exceeds {}", data.len(), MAX_FRAME_BYTES);
    }

    let mut result = Vec::with_capacity(4 + data.len());
    result.extend_from_slice(&(data.len() as u32).to_be_bytes());
    result.extend_from_slice(&data);
    Ok(result)
}

/// Decode a frame body (without its length prefix).
pub fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> anyhow::Result<T> {
    Ok(bincode::deserialize(data)?)
}

/// Read one length-prefixed frame.
pub async fn read_frame<R, T>(recv: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::Protocol(format!("reading frame length: {}", e)))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Protocol(format!("frame too large: {} bytes", len)));
    }

    let mut data = vec![0u8; len];
    recv.read_exact(&mut data)
        .await
        .map_err(|e| TransportError::Protocol(format!("reading frame: {}", e)))?;
    decode_frame(&data).map_err(|e| TransportError::Protocol(format!("decoding frame: {}", e)))
}

// ==================== Connector ====================

/// Opens QUIC connections to the edge.
pub struct QuicEdgeConnector {
    endpoint: Endpoint,
    edge_addr: SocketAddr,
    server_name: String,
    max_streams: usize,
}

impl QuicEdgeConnector {
    /// Connector with a caller-provided client configuration.
    ///
    /// The stream limit is applied on top of `client_config`'s transport.
    pub fn new(
        mut client_config: ClientConfig,
        edge_addr: SocketAddr,
        server_name: impl Into<String>,
        max_streams: usize,
    ) -> anyhow::Result<Self> {
        let max_streams = max_streams.max(1);
        let mut transport = quinn::TransportConfig::default();
        transport
            .max_concurrent_bidi_streams(VarInt::from_u32(u32::try_from(max_streams).unwrap_or(u32::MAX)))
            .max_concurrent_uni_streams(VarInt::from_u32(0))
            .keep_alive_interval(Some(Duration::from_secs(15)));
        client_config.transport_config(Arc::new(transport));

        let bind: SocketAddr = if edge_addr.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            edge_addr,
            server_name: server_name.into(),
            max_streams,
        })
    }

    /// Connector that accepts any server certificate.
    ///
    /// For private edges with self-signed certificates only.
    pub fn insecure(
        edge_addr: SocketAddr,
        server_name: impl Into<String>,
        max_streams: usize,
    ) -> anyhow::Result<Self> {
        let mut crypto = quinn::rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
        ));
        Self::new(client_config, edge_addr, server_name, max_streams)
    }

    pub fn edge_addr(&self) -> SocketAddr {
        self.edge_addr
    }
}

#[async_trait]
impl EdgeConnector for QuicEdgeConnector {
    async fn connect(&self, index: ConnIndex) -> Result<Box<dyn EdgeConnection>, TransportError> {
        let conn = self
            .endpoint
            .connect(self.edge_addr, &self.server_name)
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let hello = ConnectionHello {
            index,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Err(e) = announce(&conn, &hello).await {
            conn.close(VarInt::from_u32(CLOSE_FORCED), b"hello failed");
            return Err(TransportError::ConnectFailed(format!("sending hello: {}", e)));
        }

        tracing::debug!(index = %index, remote = %conn.remote_address(), "quic connection up");
        Ok(Box::new(QuicEdgeConnection::new(conn, index, self.max_streams)))
    }
}

async fn announce(conn: &QuinnConnection, hello: &ConnectionHello) -> anyhow::Result<()> {
    let mut send = conn.open_uni().await?;
    send.write_all(&encode_frame(hello)?).await?;
    send.finish()?;
    Ok(())
}

// ==================== Connection ====================

type Accepted = Result<Option<InboundStream>, TransportError>;

/// One QUIC connection to the edge.
///
/// A background task accepts edge-opened streams and reads each stream's
/// header on its own task, so a slow header never holds up the streams
/// behind it. Headers arrive in completion order.
pub struct QuicEdgeConnection {
    conn: QuinnConnection,
    max_streams: usize,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    acceptor: JoinHandle<()>,
}

impl QuicEdgeConnection {
    fn new(conn: QuinnConnection, index: ConnIndex, max_streams: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_streams);
        let acceptor = tokio::spawn(accept_loop(conn.clone(), index, tx));
        Self {
            conn,
            max_streams,
            incoming: tokio::sync::Mutex::new(rx),
            acceptor,
        }
    }
}

impl Drop for QuicEdgeConnection {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl EdgeConnection for QuicEdgeConnection {
    async fn accept_stream(&self) -> Result<Option<InboundStream>, TransportError> {
        match self.incoming.lock().await.recv().await {
            Some(accepted) => accepted,
            None => Ok(None),
        }
    }

    async fn close(&self, graceful: bool) {
        self.acceptor.abort();
        let (code, reason): (u32, &[u8]) = if graceful {
            (CLOSE_GRACEFUL, b"drained")
        } else {
            (CLOSE_FORCED, b"closed")
        };
        self.conn.close(VarInt::from_u32(code), reason);
    }

    fn max_concurrent_streams(&self) -> usize {
        self.max_streams
    }
}

/// Accept streams until the connection ends, then report how it ended.
///
/// Header readers live in a `JoinSet`, so they stop with this task.
async fn accept_loop(conn: QuinnConnection, index: ConnIndex, tx: mpsc::Sender<Accepted>) {
    let mut headers = JoinSet::new();

    let end = loop {
        tokio::select! {
            accepted = conn.accept_bi() => match accepted {
                Ok((send, recv)) => {
                    headers.spawn(read_stream_header(send, recv, tx.clone()));
                }
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => break Ok(None),
                Err(e) => break Err(TransportError::ConnectionLost(e.to_string())),
            },
            Some(_) = headers.join_next(), if !headers.is_empty() => {}
        }
    };

    tracing::debug!(index = %index, pending_headers = headers.len(), "quic accept loop ended");
    let _ = tx.send(end).await;
}

async fn read_stream_header(mut send: SendStream, mut recv: RecvStream, tx: mpsc::Sender<Accepted>) {
    let id = send.id().index();

    let header = match tokio::time::timeout(HEADER_TIMEOUT, read_frame::<_, StreamHeader>(&mut recv)).await {
        Ok(Ok(header)) => header,
        Ok(Err(e)) => {
            reject(&mut send, &mut recv);
            let _ = tx.send(Err(e)).await;
            return;
        }
        Err(_) => {
            reject(&mut send, &mut recv);
            let _ = tx
                .send(Err(TransportError::Protocol(format!(
                    "timed out waiting for header on stream {}",
                    id
                ))))
                .await;
            return;
        }
    };

    let stream = InboundStream {
        id,
        kind: header.kind,
        target: header.target,
        request: header.request,
        io: Box::new(QuicStream { send, recv }),
    };
    let _ = tx.send(Ok(Some(stream))).await;
}

fn reject(send: &mut SendStream, recv: &mut RecvStream) {
    let _ = send.reset(VarInt::from_u32(STREAM_REJECTED));
    let _ = recv.stop(VarInt::from_u32(STREAM_REJECTED));
}

// ==================== Stream ====================

/// One edge-opened bidirectional stream.
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
}

#[async_trait]
impl EdgeStream for QuicStream {
    async fn send_response_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        let frame = encode_frame(head).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.send.write_all(&frame).await.map_err(io::Error::from)
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Skip server certificate verification for self-signed edge certificates.
#[derive(Debug)]
struct SkipServerVerification;

#[cfg_attr(coverage_nightly, coverage(off))]
impl quinn::rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        vec![
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            quinn::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            quinn::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            quinn::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            quinn::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA256,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA384,
            quinn::rustls::SignatureScheme::RSA_PSS_SHA512,
            quinn::rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> StreamHeader {
        StreamHeader {
            kind: StreamKind::Http,
            target: OriginTarget::new("app.example.com"),
            request: Some(RequestHead::new("GET", "/").with_header("Accept", "*/*")),
        }
    }

    #[test]
    fn test_encode_frame_has_length_prefix() {
        let frame = encode_frame(&header()).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;

        assert_eq!(len, frame.len() - 4);
        let decoded: StreamHeader = decode_frame(&frame[4..]).unwrap();
        assert_eq!(decoded, header());
    }

    #[test]
    fn test_encode_frame_rejects_oversize() {
        let mut head = ResponseHead::new(200);
        head.headers
            .push(("X-Big".to_string(), "a".repeat(MAX_FRAME_BYTES)));

        assert!(encode_frame(&head).is_err());
    }

    #[tokio::test]
    async fn test_read_frame() {
        let mut frame = encode_frame(&ResponseHead::new(101)).unwrap();
        frame.extend_from_slice(b"payload");
        let mut reader: &[u8] = &frame;

        let head: ResponseHead = read_frame(&mut reader).await.unwrap();

        assert_eq!(head.status, 101);
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn test_read_frame_rejects_large_length() {
        let mut reader: &[u8] = &[0xff, 0xff, 0xff, 0xff];

        let err = read_frame::<_, StreamHeader>(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(msg) if msg.contains("too large")));
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let frame = encode_frame(&header()).unwrap();
        let mut reader: &[u8] = &frame[..frame.len() - 2];

        let err = read_frame::<_, StreamHeader>(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_skip_verification_schemes() {
        use quinn::rustls::client::danger::ServerCertVerifier;
        let schemes = SkipServerVerification.supported_verify_schemes();
        assert!(schemes.contains(&quinn::rustls::SignatureScheme::ED25519));
    }
}
