//! Domain Entities - Core tunnel objects
//!
//! These entities describe logical streams, their origin targets and the
//! lifecycle of edge connections. They carry no I/O and no runtime state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of a logical stream carried over an edge connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// One HTTP request/response cycle
    Http,
    /// An HTTP request upgraded to a WebSocket session
    WebSocket,
    /// A raw TCP session
    Tcp,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptor the edge attaches to a stream to say where it should go.
///
/// The origin resolver maps this to a concrete endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginTarget {
    /// Public hostname the stream was addressed to
    pub hostname: String,
}

impl OriginTarget {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

impl std::fmt::Display for OriginTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hostname)
    }
}

/// HTTP request line and headers as received from the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
        }
    }

    /// Builder-style header append.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the body length is delimited by transfer coding rather than Content-Length.
    pub fn has_transfer_encoding(&self) -> bool {
        self.header("transfer-encoding").is_some()
    }

    /// Whether this request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        upgrade && connection
    }
}

/// Response status and headers sent back to the edge before any body bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Lifecycle state of an edge connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    /// Transport handshake in progress
    Connecting,
    /// Accepting new streams
    Active,
    /// No longer accepting; waiting for in-flight streams
    Draining,
    /// Transport released
    Closed,
    /// Transport lost or too many consecutive errors
    Failed,
}

impl HandleState {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Active => 1,
            Self::Draining => 2,
            Self::Closed => 3,
            Self::Failed => 4,
        }
    }

    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Draining,
            3 => Self::Closed,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Terminal status of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Relayed until a clean close on both sides
    Success,
    /// Origin could not be resolved, dialed, or rejected the stream
    OriginError,
    /// The edge side failed, or the relay broke after data flowed
    TransportError,
    /// Malformed stream (missing request head, bad upgrade)
    ProtocolError,
    /// Cancelled by connection teardown or shutdown
    Cancelled,
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::OriginError => "origin_error",
            Self::TransportError => "transport_error",
            Self::ProtocolError => "protocol_error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Summary of one finished logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub id: u64,
    pub kind: StreamKind,
    pub outcome: StreamOutcome,
    /// Last status known for the stream, if the origin (or the tunnel) produced one
    pub status: Option<u16>,
    /// Bytes read from the edge and written to the origin
    pub bytes_to_origin: u64,
    /// Bytes read from the origin and written to the edge
    pub bytes_to_edge: u64,
    pub duration: Duration,
}

impl StreamReport {
    /// Whether the stream failed after some payload had already moved.
    pub fn is_partial(&self) -> bool {
        !self.outcome.is_success() && (self.bytes_to_origin > 0 || self.bytes_to_edge > 0)
    }
}
