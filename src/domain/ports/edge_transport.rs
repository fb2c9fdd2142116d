//! Edge Transport Port
//!
//! Defines the interface to the multiplexed transport that connects this agent
//! to the edge. The core only needs three things from it: open a connection,
//! accept logical streams on it, and close it.

use crate::domain::entities::{OriginTarget, RequestHead, ResponseHead, StreamKind};
use crate::domain::value_objects::ConnIndex;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream of one logical stream, edge side.
///
/// Reads yield the request body (HTTP) or client bytes (WebSocket, TCP);
/// writes go back to the edge after the response head has been sent.
#[async_trait]
pub trait EdgeStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Send the response status and headers ahead of any body bytes.
    ///
    /// For TCP streams this acknowledges the session (status 200) or
    /// refuses it (status 502).
    async fn send_response_head(&mut self, head: &ResponseHead) -> io::Result<()>;
}

/// A logical stream as yielded by an edge connection.
pub struct InboundStream {
    /// Transport-assigned identifier, unique per connection
    pub id: u64,
    pub kind: StreamKind,
    pub target: OriginTarget,
    /// Request line and headers. Present for HTTP and WebSocket.
    pub request: Option<RequestHead>,
    pub io: Box<dyn EdgeStream>,
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// One established edge connection.
#[async_trait]
pub trait EdgeConnection: Send + Sync {
    /// Wait for the next inbound stream.
    ///
    /// Returns `Ok(None)` when the edge closed the connection cleanly.
    async fn accept_stream(&self) -> Result<Option<InboundStream>, TransportError>;

    /// Release the underlying transport.
    ///
    /// `graceful` tells the peer that the close was intentional.
    async fn close(&self, graceful: bool);

    /// Hard cap on concurrently open streams, as negotiated with the edge.
    fn max_concurrent_streams(&self) -> usize;
}

/// Factory for edge connections.
#[async_trait]
pub trait EdgeConnector: Send + Sync {
    /// Open (handshake included) the connection that will live at `index`.
    async fn connect(&self, index: ConnIndex) -> Result<Box<dyn EdgeConnection>, TransportError>;
}

/// Errors raised by the edge transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not establish or negotiate the connection
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// Connection attempt exceeded its deadline
    #[error("connect timed out")]
    ConnectTimeout,
    /// An established connection went away
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// A single stream violated the framing protocol
    #[error("stream protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the connection is unusable after this error.
    ///
    /// Protocol errors are scoped to one stream; they only count toward the
    /// handle's consecutive error threshold.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}
