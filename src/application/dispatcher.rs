//! Stream Dispatcher
//!
//! Proxies one admitted stream to its origin and keeps the request metrics
//! symmetric. Every started stream is tracked by an [`InFlightRequest`], so
//! the concurrency gauges are decremented exactly once whatever the exit.

use super::connection_handle::{AdmittedStream, ConnectionHandle};
use super::http1;
use super::relay::{ByteCounter, Metered};
use crate::domain::entities::{
    OriginTarget, RequestHead, ResponseHead, StreamKind, StreamOutcome, StreamReport,
};
use crate::domain::ports::{
    EdgeStream, InboundStream, OriginDialer, OriginEndpoint, OriginError, OriginIo,
    OriginResolver, ResolveError, TransportError,
};
use crate::domain::value_objects::BAD_GATEWAY;
use crate::infrastructure::{InFlightRequest, TunnelMetrics};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

type EdgeIo = Metered<Box<dyn EdgeStream>>;
type OriginConn = Metered<Box<dyn OriginIo>>;

const SWITCHING_PROTOCOLS: u16 = 101;

/// Why a stream did not finish cleanly.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error("origin answered the upgrade with status {0}")]
    UpgradeRejected(u16),
    #[error("{0} cannot carry {1} streams")]
    Unsupported(OriginEndpoint, StreamKind),
    #[error("edge stream i/o error: {0}")]
    Edge(#[source] io::Error),
    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),
    #[error("{0}")]
    Protocol(String),
}

impl StreamError {
    pub fn outcome(&self) -> StreamOutcome {
        match self {
            Self::Resolve(_) | Self::Origin(_) | Self::UpgradeRejected(_) | Self::Unsupported(..) => {
                StreamOutcome::OriginError
            }
            Self::Edge(_) | Self::Relay(_) => StreamOutcome::TransportError,
            Self::Protocol(_) => StreamOutcome::ProtocolError,
        }
    }
}

/// Per-stream progress that outlives a cancelled relay.
#[derive(Default)]
struct StreamContext {
    to_origin: ByteCounter,
    to_edge: ByteCounter,
    status: Option<u16>,
}

/// Routes admitted streams to their origins.
pub struct StreamDispatcher {
    resolver: Arc<dyn OriginResolver>,
    dialer: Arc<dyn OriginDialer>,
    metrics: Arc<TunnelMetrics>,
}

impl StreamDispatcher {
    pub fn new(
        resolver: Arc<dyn OriginResolver>,
        dialer: Arc<dyn OriginDialer>,
        metrics: Arc<TunnelMetrics>,
    ) -> Self {
        Self {
            resolver,
            dialer,
            metrics,
        }
    }

    /// Proxy one stream until it finishes or its handle cancels it.
    ///
    /// Relayed streams reset the handle's error streak; protocol errors
    /// count toward it.
    pub async fn dispatch(&self, handle: &ConnectionHandle, admitted: AdmittedStream) -> StreamReport {
        let (stream, mut cancel, _admission) = admitted.into_parts();
        let InboundStream {
            id,
            kind,
            target,
            request,
            io,
        } = stream;
        let started = Instant::now();
        let mut ctx = StreamContext::default();

        let outcome = tokio::select! {
            res = self.proxy(&mut ctx, kind, &target, request, io) => match res {
                Ok(()) => StreamOutcome::Success,
                Err(e) => {
                    tracing::warn!(
                        index = %handle.index(),
                        stream = id,
                        %kind,
                        target = %target,
                        "stream failed: {}",
                        e
                    );
                    if let StreamError::Protocol(reason) = &e {
                        handle.report_error(&TransportError::Protocol(reason.clone()));
                    }
                    e.outcome()
                }
            },
            _ = cancel.cancelled() => StreamOutcome::Cancelled,
        };

        if outcome.is_success() {
            handle.report_success();
        }

        let report = StreamReport {
            id,
            kind,
            outcome,
            status: ctx.status,
            bytes_to_origin: ctx.to_origin.get(),
            bytes_to_edge: ctx.to_edge.get(),
            duration: started.elapsed(),
        };

        tracing::debug!(
            index = %handle.index(),
            stream = report.id,
            kind = %report.kind,
            outcome = %report.outcome,
            status = ?report.status,
            bytes_to_origin = report.bytes_to_origin,
            bytes_to_edge = report.bytes_to_edge,
            partial = report.is_partial(),
            duration_ms = report.duration.as_millis() as u64,
            "stream finished"
        );
        report
    }

    async fn proxy(
        &self,
        ctx: &mut StreamContext,
        kind: StreamKind,
        target: &OriginTarget,
        request: Option<RequestHead>,
        io: Box<dyn EdgeStream>,
    ) -> Result<(), StreamError> {
        match kind {
            StreamKind::Http => self.proxy_http(ctx, target, request, io).await,
            StreamKind::WebSocket => self.proxy_websocket(ctx, target, request, io).await,
            StreamKind::Tcp => self.proxy_tcp(ctx, target, io).await,
        }
    }

    async fn proxy_http(
        &self,
        ctx: &mut StreamContext,
        target: &OriginTarget,
        request: Option<RequestHead>,
        io: Box<dyn EdgeStream>,
    ) -> Result<(), StreamError> {
        let request = request
            .ok_or_else(|| StreamError::Protocol("http stream without a request head".to_string()))?;
        let mut edge = Metered::new(io, ctx.to_origin.clone());
        let mut req = InFlightRequest::start(self.metrics.clone(), StreamKind::Http);

        let addr = match self.resolver.resolve(target) {
            Ok(OriginEndpoint::Http { addr }) | Ok(OriginEndpoint::Tcp { addr }) => addr,
            Ok(OriginEndpoint::Status(code)) => {
                req.respond(code);
                ctx.status = Some(code);
                send_local(&mut edge, empty_response(code))
                    .await
                    .map_err(StreamError::Edge)?;
                req.complete();
                return Ok(());
            }
            Err(e) => {
                req.respond(BAD_GATEWAY);
                ctx.status = Some(BAD_GATEWAY);
                let _ = send_local(&mut edge, empty_response(BAD_GATEWAY)).await;
                return Err(e.into());
            }
        };

        let origin = match self.connect_origin(&addr).await {
            Ok(origin) => origin,
            Err(e) => {
                req.fail();
                ctx.status = Some(BAD_GATEWAY);
                let _ = send_local(&mut edge, empty_response(BAD_GATEWAY)).await;
                return Err(e.into());
            }
        };
        let mut origin = Metered::new(origin, ctx.to_edge.clone());

        let (head, rest) =
            match exchange_head(&mut edge, &mut origin, &request, &target.hostname, false).await {
                Ok(res) => res,
                Err(e) => {
                    req.fail();
                    ctx.status = Some(BAD_GATEWAY);
                    let _ = send_local(&mut edge, empty_response(BAD_GATEWAY)).await;
                    return Err(e);
                }
            };

        ctx.status = Some(head.status);
        req.respond(head.status);
        edge.get_mut()
            .send_response_head(&head)
            .await
            .map_err(StreamError::Edge)?;

        if let Err(e) = relay_response_body(&mut edge, &mut origin, &rest).await {
            self.metrics.record_request_error();
            return Err(StreamError::Relay(e));
        }

        req.complete();
        Ok(())
    }

    async fn proxy_websocket(
        &self,
        ctx: &mut StreamContext,
        target: &OriginTarget,
        request: Option<RequestHead>,
        io: Box<dyn EdgeStream>,
    ) -> Result<(), StreamError> {
        let request = request
            .filter(|r| r.is_websocket_upgrade())
            .ok_or_else(|| {
                StreamError::Protocol("websocket stream without an upgrade request".to_string())
            })?;
        let mut edge = Metered::new(io, ctx.to_origin.clone());

        let addr = match self.resolver.resolve(target) {
            Ok(OriginEndpoint::Http { addr }) | Ok(OriginEndpoint::Tcp { addr }) => addr,
            Ok(OriginEndpoint::Status(code)) => {
                self.metrics.record_early_response(code);
                ctx.status = Some(code);
                send_local(&mut edge, empty_response(code))
                    .await
                    .map_err(StreamError::Edge)?;
                return Err(StreamError::UpgradeRejected(code));
            }
            Err(e) => {
                self.metrics.record_early_response(BAD_GATEWAY);
                ctx.status = Some(BAD_GATEWAY);
                let _ = send_local(&mut edge, empty_response(BAD_GATEWAY)).await;
                return Err(e.into());
            }
        };

        let origin = match self.connect_origin(&addr).await {
            Ok(origin) => origin,
            Err(e) => {
                self.metrics.record_request_error();
                ctx.status = Some(BAD_GATEWAY);
                let _ = send_local(&mut edge, empty_response(BAD_GATEWAY)).await;
                return Err(e.into());
            }
        };
        let mut origin = Metered::new(origin, ctx.to_edge.clone());

        let (head, rest) =
            match exchange_head(&mut edge, &mut origin, &request, &target.hostname, true).await {
                Ok(res) => res,
                Err(e) => {
                    self.metrics.record_request_error();
                    ctx.status = Some(BAD_GATEWAY);
                    let _ = send_local(&mut edge, empty_response(BAD_GATEWAY)).await;
                    return Err(e);
                }
            };
        ctx.status = Some(head.status);

        if head.status != SWITCHING_PROTOCOLS {
            self.metrics.record_early_response(head.status);
            edge.get_mut()
                .send_response_head(&head)
                .await
                .map_err(StreamError::Edge)?;
            relay_response_body(&mut edge, &mut origin, &rest)
                .await
                .map_err(StreamError::Relay)?;
            return Err(StreamError::UpgradeRejected(head.status));
        }

        // Only an accepted upgrade counts as a websocket request
        let mut session = InFlightRequest::start(self.metrics.clone(), StreamKind::WebSocket);
        session.respond(SWITCHING_PROTOCOLS);
        edge.get_mut()
            .send_response_head(&head)
            .await
            .map_err(StreamError::Edge)?;

        let relayed = async {
            if !rest.is_empty() {
                edge.write_all(&rest).await?;
            }
            tokio::io::copy_bidirectional(&mut edge, &mut origin).await?;
            Ok::<_, io::Error>(())
        }
        .await;

        if let Err(e) = relayed {
            self.metrics.record_request_error();
            return Err(StreamError::Relay(e));
        }

        session.complete();
        Ok(())
    }

    async fn proxy_tcp(
        &self,
        ctx: &mut StreamContext,
        target: &OriginTarget,
        io: Box<dyn EdgeStream>,
    ) -> Result<(), StreamError> {
        let mut edge = Metered::new(io, ctx.to_origin.clone());

        let addr = match self.resolver.resolve(target) {
            Ok(OriginEndpoint::Tcp { addr }) => addr,
            Ok(other) => {
                let _ = send_local(&mut edge, ResponseHead::new(BAD_GATEWAY)).await;
                return Err(StreamError::Unsupported(other, StreamKind::Tcp));
            }
            Err(e) => {
                let _ = send_local(&mut edge, ResponseHead::new(BAD_GATEWAY)).await;
                return Err(e.into());
            }
        };

        let origin = match self.connect_origin(&addr).await {
            Ok(origin) => origin,
            Err(e) => {
                let _ = send_local(&mut edge, ResponseHead::new(BAD_GATEWAY)).await;
                return Err(e.into());
            }
        };
        let mut origin = Metered::new(origin, ctx.to_edge.clone());

        let session = InFlightRequest::start(self.metrics.clone(), StreamKind::Tcp);
        edge.get_mut()
            .send_response_head(&ResponseHead::new(200))
            .await
            .map_err(StreamError::Edge)?;

        if let Err(e) = tokio::io::copy_bidirectional(&mut edge, &mut origin).await {
            self.metrics.record_request_error();
            return Err(StreamError::Relay(e));
        }

        session.complete();
        Ok(())
    }

    /// Dial the origin, observing connect latency or a connect failure.
    async fn connect_origin(&self, addr: &str) -> Result<Box<dyn OriginIo>, OriginError> {
        let started = Instant::now();
        match self.dialer.dial(addr).await {
            Ok(io) => {
                self.metrics.record_connect_latency(started.elapsed());
                Ok(io)
            }
            Err(e) => {
                self.metrics.record_connect_failure();
                Err(e)
            }
        }
    }
}

fn empty_response(status: u16) -> ResponseHead {
    let mut head = ResponseHead::new(status);
    head.headers
        .push(("Content-Length".to_string(), "0".to_string()));
    head
}

/// Answer the edge without an origin, then close our side.
async fn send_local(edge: &mut EdgeIo, head: ResponseHead) -> io::Result<()> {
    edge.get_mut().send_response_head(&head).await?;
    edge.shutdown().await
}

/// Send the request head and body, then read the origin's response head.
async fn exchange_head(
    edge: &mut EdgeIo,
    origin: &mut OriginConn,
    request: &RequestHead,
    host: &str,
    upgrade: bool,
) -> Result<(ResponseHead, Bytes), StreamError> {
    http1::write_request_head(origin, request, host, upgrade)
        .await
        .map_err(|e| StreamError::Origin(e.into()))?;

    if !upgrade {
        forward_request_body(edge, origin, request)
            .await
            .map_err(StreamError::Relay)?;
    }

    Ok(http1::read_response_head(origin, upgrade).await?)
}

/// Forward the request body by `Content-Length`, or until edge EOF when a
/// transfer coding delimits it.
async fn forward_request_body(
    edge: &mut EdgeIo,
    origin: &mut OriginConn,
    request: &RequestHead,
) -> io::Result<()> {
    use tokio::io::AsyncReadExt;

    if let Some(len) = request.content_length() {
        let mut body = (&mut *edge).take(len);
        let copied = tokio::io::copy(&mut body, origin).await?;
        if copied < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("request body ended after {} of {} bytes", copied, len),
            ));
        }
    } else if request.has_transfer_encoding() {
        tokio::io::copy(edge, origin).await?;
    }
    origin.flush().await
}

async fn relay_response_body(edge: &mut EdgeIo, origin: &mut OriginConn, rest: &[u8]) -> io::Result<()> {
    if !rest.is_empty() {
        edge.write_all(rest).await?;
    }
    tokio::io::copy(origin, edge).await?;
    edge.shutdown().await
}
