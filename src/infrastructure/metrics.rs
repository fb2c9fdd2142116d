//! Tunnel Metrics
//!
//! Prometheus counters, gauges and the connect-latency histogram for the
//! tunnel. One instance is built at startup with its own registry and shared
//! by reference; nothing here registers into the process-global default.
//!
//! Gauges are integer-backed (`IntGauge`), so reading them for the scaling
//! loop is a single atomic load.

use crate::domain::entities::StreamKind;
use crate::domain::value_objects::{ResponseCode, BAD_GATEWAY};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Namespace shared by every series.
pub const METRICS_NAMESPACE: &str = "edgetunnel";
/// Subsystem for request/response series.
pub const TUNNEL_SUBSYSTEM: &str = "tunnel";
/// Subsystem for TCP session series.
pub const TCP_SUBSYSTEM: &str = "tcp";
/// Subsystem for connect latency and connect errors.
pub const PROXY_SUBSYSTEM: &str = "proxy";

/// Histogram boundaries for connect latency, in milliseconds.
pub const CONNECT_LATENCY_BUCKETS_MS: [f64; 8] = [1.0, 10.0, 25.0, 50.0, 100.0, 500.0, 1000.0, 5000.0];

const STATUS_CODE_LABEL: &str = "status_code";

/// Registry of tunnel metrics.
pub struct TunnelMetrics {
    registry: Registry,
    total_requests: IntCounter,
    concurrent_requests: IntGauge,
    concurrent_websocket_requests: IntGauge,
    response_by_code: IntCounterVec,
    early_response_by_code: IntCounterVec,
    request_errors: IntCounter,
    active_tcp_sessions: IntGauge,
    total_tcp_sessions: IntCounter,
    connect_latency: Histogram,
    connect_stream_errors: IntCounter,
}

fn opts(subsystem: &str, name: &str, help: &str) -> Opts {
    Opts::new(name, help)
        .namespace(METRICS_NAMESPACE)
        .subsystem(subsystem)
}

impl TunnelMetrics {
    /// Build every series and register it into a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let total_requests = IntCounter::with_opts(opts(
            TUNNEL_SUBSYSTEM,
            "total_requests",
            "Amount of requests proxied through all the tunnels",
        ))?;
        let concurrent_requests = IntGauge::with_opts(opts(
            TUNNEL_SUBSYSTEM,
            "concurrent_requests_per_tunnel",
            "Concurrent requests proxied through each tunnel",
        ))?;
        let concurrent_websocket_requests = IntGauge::with_opts(opts(
            TUNNEL_SUBSYSTEM,
            "concurrent_websocket_requests_per_tunnel",
            "Concurrent websocket requests proxied through each tunnel",
        ))?;
        let response_by_code = IntCounterVec::new(
            opts(
                TUNNEL_SUBSYSTEM,
                "response_by_code",
                "Count of responses by HTTP status code",
            ),
            &[STATUS_CODE_LABEL],
        )?;
        let early_response_by_code = IntCounterVec::new(
            opts(
                TUNNEL_SUBSYSTEM,
                "early_response_by_code",
                "Count of responses by HTTP status code, incremented as soon as it is known",
            ),
            &[STATUS_CODE_LABEL],
        )?;
        let request_errors = IntCounter::with_opts(opts(
            TUNNEL_SUBSYSTEM,
            "request_errors",
            "Count of error proxying to origin",
        ))?;
        let active_tcp_sessions = IntGauge::with_opts(opts(
            TCP_SUBSYSTEM,
            "active_sessions",
            "Concurrent count of TCP sessions that are being proxied to any origin",
        ))?;
        let total_tcp_sessions = IntCounter::with_opts(opts(
            TCP_SUBSYSTEM,
            "total_sessions",
            "Total count of TCP sessions that have been proxied to any origin",
        ))?;
        let connect_latency = Histogram::with_opts(
            HistogramOpts::new(
                "connect_latency",
                "Time it takes to establish and acknowledge connections in milliseconds",
            )
            .namespace(METRICS_NAMESPACE)
            .subsystem(PROXY_SUBSYSTEM)
            .buckets(CONNECT_LATENCY_BUCKETS_MS.to_vec()),
        )?;
        let connect_stream_errors = IntCounter::with_opts(opts(
            PROXY_SUBSYSTEM,
            "connect_streams_errors",
            "Total count of failure to establish and acknowledge connections",
        ))?;

        registry.register(Box::new(total_requests.clone()))?;
        registry.register(Box::new(concurrent_requests.clone()))?;
        registry.register(Box::new(concurrent_websocket_requests.clone()))?;
        registry.register(Box::new(response_by_code.clone()))?;
        registry.register(Box::new(early_response_by_code.clone()))?;
        registry.register(Box::new(request_errors.clone()))?;
        registry.register(Box::new(active_tcp_sessions.clone()))?;
        registry.register(Box::new(total_tcp_sessions.clone()))?;
        registry.register(Box::new(connect_latency.clone()))?;
        registry.register(Box::new(connect_stream_errors.clone()))?;

        Ok(Self {
            registry,
            total_requests,
            concurrent_requests,
            concurrent_websocket_requests,
            response_by_code,
            early_response_by_code,
            request_errors,
            active_tcp_sessions,
            total_tcp_sessions,
            connect_latency,
            connect_stream_errors,
        })
    }

    /// Underlying registry, for exposition.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export every series in the Prometheus text format.
    pub fn export_prometheus(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Record the start of a stream.
    ///
    /// HTTP and WebSocket bump their own concurrency gauge. TCP sessions count
    /// as requests too, so they bump the request gauge as well as the session
    /// counters.
    pub fn increment_request_started(&self, kind: StreamKind) {
        self.total_requests.inc();
        match kind {
            StreamKind::Http => self.concurrent_requests.inc(),
            StreamKind::WebSocket => self.concurrent_websocket_requests.inc(),
            StreamKind::Tcp => {
                self.concurrent_requests.inc();
                self.total_tcp_sessions.inc();
                self.active_tcp_sessions.inc();
            }
        }
    }

    /// Undo the concurrency part of [`increment_request_started`](Self::increment_request_started).
    ///
    /// Totals are left alone.
    pub fn decrement_concurrency(&self, kind: StreamKind) {
        match kind {
            StreamKind::Http => self.concurrent_requests.dec(),
            StreamKind::WebSocket => self.concurrent_websocket_requests.dec(),
            StreamKind::Tcp => {
                self.concurrent_requests.dec();
                self.active_tcp_sessions.dec();
            }
        }
    }

    /// Record the end of a stream that produced a status.
    pub fn record_request_completed(&self, kind: StreamKind, status: u16) {
        self.decrement_concurrency(kind);
        self.response_by_code
            .with_label_values(&[&ResponseCode::new(status).label()])
            .inc();
    }

    /// Record a status as soon as the origin decided it.
    ///
    /// This overlaps with the completion counter on purpose: one answers
    /// "what did the origin decide", the other "what finished".
    pub fn record_early_response(&self, status: u16) {
        self.early_response_by_code
            .with_label_values(&[&ResponseCode::new(status).label()])
            .inc();
    }

    pub fn record_request_error(&self) {
        self.request_errors.inc();
    }

    /// Observe a successful connect, in milliseconds.
    pub fn record_connect_latency(&self, elapsed: Duration) {
        self.connect_latency.observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_connect_failure(&self) {
        self.connect_stream_errors.inc();
    }

    /// Approximate number of in-flight streams of `kind`.
    ///
    /// A single relaxed load that races with concurrent updates. Clamped at
    /// zero in case a decrement was observed before its increment.
    pub fn read_approximate_concurrency(&self, kind: StreamKind) -> u64 {
        let raw = match kind {
            StreamKind::Http => self.concurrent_requests.get(),
            StreamKind::WebSocket => self.concurrent_websocket_requests.get(),
            StreamKind::Tcp => self.active_tcp_sessions.get(),
        };
        raw.max(0) as u64
    }

    // ===== Read accessors =====

    pub fn total_requests(&self) -> u64 {
        self.total_requests.get()
    }

    pub fn response_count(&self, status: u16) -> u64 {
        self.response_by_code
            .with_label_values(&[&ResponseCode::new(status).label()])
            .get()
    }

    pub fn early_response_count(&self, status: u16) -> u64 {
        self.early_response_by_code
            .with_label_values(&[&ResponseCode::new(status).label()])
            .get()
    }

    pub fn request_errors(&self) -> u64 {
        self.request_errors.get()
    }

    pub fn total_tcp_sessions(&self) -> u64 {
        self.total_tcp_sessions.get()
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_stream_errors.get()
    }

    /// Number of observations in the connect latency histogram.
    pub fn connect_latency_samples(&self) -> u64 {
        self.connect_latency.get_sample_count()
    }
}

/// RAII tracker for one admitted stream's concurrency gauge.
///
/// Created with the start increment and guarantees exactly one matching
/// decrement: through [`complete`](Self::complete), [`fail`](Self::fail), or
/// on drop when the stream is cancelled or its task panics. A dropped HTTP or
/// WebSocket request is completed with the last known status, or 502 when
/// the origin never answered.
pub struct InFlightRequest {
    metrics: Arc<TunnelMetrics>,
    kind: StreamKind,
    status: Option<u16>,
    finished: bool,
}

impl InFlightRequest {
    pub fn start(metrics: Arc<TunnelMetrics>, kind: StreamKind) -> Self {
        metrics.increment_request_started(kind);
        Self {
            metrics,
            kind,
            status: None,
            finished: false,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Note the origin's status and record it as an early response.
    pub fn respond(&mut self, status: u16) {
        self.metrics.record_early_response(status);
        self.status = Some(status);
    }

    /// Note a status without recording an early response.
    ///
    /// Used when the early response was recorded before the guard existed.
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Finish normally with the last known status.
    pub fn complete(mut self) {
        self.finish_with_status();
    }

    /// Finish after a transport failure before the origin answered.
    ///
    /// Counts a request error instead of a status-coded completion.
    pub fn fail(mut self) {
        self.finished = true;
        self.metrics.record_request_error();
        self.metrics.decrement_concurrency(self.kind);
    }

    fn finish_with_status(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        match self.kind {
            StreamKind::Tcp => self.metrics.decrement_concurrency(self.kind),
            StreamKind::Http | StreamKind::WebSocket => self
                .metrics
                .record_request_completed(self.kind, self.status.unwrap_or(BAD_GATEWAY)),
        }
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        self.finish_with_status();
    }
}
