//! Integration tests for the QUIC edge transport
//!
//! A loopback quinn server plays the edge against the real connector.

use edge_tunnel::adapters::outbound::{
    encode_frame, read_frame, ConnectionHello, QuicEdgeConnector, StreamHeader, ALPN,
};
use edge_tunnel::domain::entities::{OriginTarget, RequestHead, ResponseHead, StreamKind};
use edge_tunnel::domain::ports::{EdgeConnection, EdgeConnector, TransportError};
use edge_tunnel::ConnIndex;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

static INIT: Once = Once::new();

/// Initialize rustls CryptoProvider for tests
fn init_crypto() {
    INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

/// Edge endpoint with a self-signed certificate for `localhost`.
fn edge_endpoint() -> (quinn::Endpoint, SocketAddr) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key.into())
        .unwrap();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto).unwrap(),
    ));
    let endpoint = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();
    (endpoint, addr)
}

async fn handshake(
    connector: &QuicEdgeConnector,
    edge: &quinn::Endpoint,
    index: ConnIndex,
) -> (Box<dyn EdgeConnection>, quinn::Connection) {
    let (client, server) = tokio::join!(connector.connect(index), async {
        edge.accept().await.unwrap().await.unwrap()
    });
    (client.unwrap(), server)
}

fn edge_connector(addr: SocketAddr) -> QuicEdgeConnector {
    let connector = QuicEdgeConnector::insecure(addr, "localhost", 16).unwrap();
    assert_eq!(connector.edge_addr(), addr);
    connector
}

#[tokio::test]
async fn test_connect_announces_index() {
    init_crypto();
    let (edge, addr) = edge_endpoint();

    let connector = edge_connector(addr);
    let (client, server) = handshake(&connector, &edge, ConnIndex(3)).await;
    assert_eq!(client.max_concurrent_streams(), 16);

    let mut uni = server.accept_uni().await.unwrap();
    let hello: ConnectionHello = read_frame(&mut uni).await.unwrap();
    assert_eq!(hello.index, ConnIndex(3));
    assert_eq!(hello.version, env!("CARGO_PKG_VERSION"));

    client.close(true).await;
    let reason = tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .unwrap();
    match reason {
        quinn::ConnectionError::ApplicationClosed(close) => {
            assert_eq!(close.error_code, quinn::VarInt::from_u32(0));
        }
        other => panic!("unexpected close reason: {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_roundtrip_over_quic() {
    init_crypto();
    let (edge, addr) = edge_endpoint();
    let connector = edge_connector(addr);
    let (client, server) = handshake(&connector, &edge, ConnIndex(0)).await;

    let edge_side = tokio::spawn(async move {
        let (mut send, mut recv) = server.open_bi().await.unwrap();
        let header = StreamHeader {
            kind: StreamKind::Http,
            target: OriginTarget::new("app.example.com"),
            request: Some(RequestHead::new("POST", "/upload").with_header("Content-Length", "5")),
        };
        send.write_all(&encode_frame(&header).unwrap()).await.unwrap();
        send.write_all(b"hello").await.unwrap();
        send.finish().unwrap();

        let head: ResponseHead = read_frame(&mut recv).await.unwrap();
        let body = recv.read_to_end(1024).await.unwrap();
        (head, body, server)
    });

    let mut stream = tokio::time::timeout(Duration::from_secs(5), client.accept_stream())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stream.kind, StreamKind::Http);
    assert_eq!(stream.target.hostname, "app.example.com");
    assert_eq!(stream.request.as_ref().unwrap().content_length(), Some(5));

    let mut body = Vec::new();
    stream.io.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"hello");

    let mut head = ResponseHead::new(201);
    head.headers.push(("Content-Length".to_string(), "5".to_string()));
    stream.io.send_response_head(&head).await.unwrap();
    stream.io.write_all(b"world").await.unwrap();
    stream.io.shutdown().await.unwrap();

    let (seen, body, _server) = edge_side.await.unwrap();
    assert_eq!(seen, head);
    assert_eq!(body, b"world");
}

fn http_header(host: &str) -> StreamHeader {
    StreamHeader {
        kind: StreamKind::Http,
        target: OriginTarget::new(host),
        request: Some(RequestHead::new("GET", "/")),
    }
}

#[tokio::test]
async fn test_oversized_header_is_protocol_error() {
    init_crypto();
    let (edge, addr) = edge_endpoint();
    let connector = edge_connector(addr);
    let (client, server) = handshake(&connector, &edge, ConnIndex(0)).await;

    let (mut send, _recv) = server.open_bi().await.unwrap();
    send.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), client.accept_stream())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)));
    assert!(!err.is_fatal());

    // The connection keeps accepting after a rejected stream
    let (mut good, _good_recv) = server.open_bi().await.unwrap();
    good.write_all(&encode_frame(&http_header("after.example.com")).unwrap())
        .await
        .unwrap();

    let stream = tokio::time::timeout(Duration::from_secs(5), client.accept_stream())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stream.target.hostname, "after.example.com");
}

#[tokio::test]
async fn test_stalled_header_does_not_block_later_streams() {
    init_crypto();
    let (edge, addr) = edge_endpoint();
    let connector = edge_connector(addr);
    let (client, server) = handshake(&connector, &edge, ConnIndex(0)).await;

    // First stream sends one byte of its length prefix and then nothing
    let (mut stalled, _stalled_recv) = server.open_bi().await.unwrap();
    stalled.write_all(&[0]).await.unwrap();

    let (mut ready, _ready_recv) = server.open_bi().await.unwrap();
    ready
        .write_all(&encode_frame(&http_header("ready.example.com")).unwrap())
        .await
        .unwrap();

    // Well inside the header timeout
    let stream = tokio::time::timeout(Duration::from_secs(2), client.accept_stream())
        .await
        .expect("ready stream was held behind the stalled one")
        .unwrap()
        .unwrap();
    assert_eq!(stream.target.hostname, "ready.example.com");
    assert_eq!(stream.id, ready.id().index());
}

#[tokio::test]
async fn test_edge_close_ends_accept_loop() {
    init_crypto();
    let (edge, addr) = edge_endpoint();
    let connector = edge_connector(addr);
    let (client, server) = handshake(&connector, &edge, ConnIndex(1)).await;

    server.close(quinn::VarInt::from_u32(0), b"maintenance");

    let next = tokio::time::timeout(Duration::from_secs(5), client.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_connect_to_silent_edge_fails() {
    init_crypto();
    // A bound UDP socket that never answers
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let connector = QuicEdgeConnector::insecure(addr, "localhost", 4).unwrap();
    let res = tokio::time::timeout(Duration::from_millis(500), connector.connect(ConnIndex(0))).await;

    // Either still handshaking or refused; never connected
    assert!(!matches!(res, Ok(Ok(_))));
}
