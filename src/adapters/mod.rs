//! Adapters Layer
//!
//! Inbound: the metrics and readiness HTTP server.
//! Outbound: QUIC edge transport, ingress rules and the TCP origin dialer.

pub mod inbound;
pub mod outbound;
