mod ingress_resolver;
mod quic_edge;
mod tcp_origin;

pub use ingress_resolver::{IngressResolver, IngressRule};
pub use quic_edge::{
    decode_frame, encode_frame, read_frame, ConnectionHello, QuicEdgeConnection, QuicEdgeConnector,
    QuicStream, StreamHeader, ALPN, MAX_FRAME_BYTES,
};
pub use tcp_origin::TcpOriginDialer;
