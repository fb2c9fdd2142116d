//! Metrics and Readiness Server
//!
//! Exposes the Prometheus registry and the pool's readiness over HTTP.

use crate::application::ConnectionPool;
use crate::infrastructure::{ShutdownController, TunnelMetrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Readiness response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: u16,
    pub ready_connections: usize,
    pub connector_id: String,
}

#[derive(Clone)]
pub struct MetricsState {
    pub metrics: Arc<TunnelMetrics>,
    pub pool: Arc<ConnectionPool>,
    pub connector_id: String,
}

/// HTTP server for `/metrics`, `/ready` and `/healthcheck`.
pub struct MetricsServer {
    listen_addr: String,
    state: MetricsState,
}

impl MetricsServer {
    pub fn new(
        listen_addr: String,
        metrics: Arc<TunnelMetrics>,
        pool: Arc<ConnectionPool>,
        connector_id: String,
    ) -> Self {
        Self {
            listen_addr,
            state: MetricsState {
                metrics,
                pool,
                connector_id,
            },
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let app = self.router().layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("metrics server listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;
        Ok(())
    }
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/ready", get(ready_handler))
        .route("/healthcheck", get(healthcheck_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.metrics.export_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ready_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let ready_connections = state.pool.ready_connections();
    let status = if ready_connections > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = ReadyResponse {
        status: status.as_u16(),
        ready_connections,
        connector_id: state.connector_id.clone(),
    };
    (status, Json(body))
}

async fn healthcheck_handler() -> &'static str {
    "OK\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{ConnectionHandle, HandleSettings};
    use crate::domain::entities::StreamKind;
    use crate::domain::ports::{EdgeConnection, EdgeConnector, InboundStream, TransportError};
    use crate::domain::value_objects::ConnIndex;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct IdleConnection;

    #[async_trait]
    impl EdgeConnection for IdleConnection {
        async fn accept_stream(&self) -> Result<Option<InboundStream>, TransportError> {
            std::future::pending().await
        }

        async fn close(&self, _graceful: bool) {}

        fn max_concurrent_streams(&self) -> usize {
            10
        }
    }

    struct IdleConnector;

    #[async_trait]
    impl EdgeConnector for IdleConnector {
        async fn connect(&self, _index: ConnIndex) -> Result<Box<dyn EdgeConnection>, TransportError> {
            Ok(Box::new(IdleConnection))
        }
    }

    fn state() -> MetricsState {
        MetricsState {
            metrics: Arc::new(TunnelMetrics::new().unwrap()),
            pool: Arc::new(ConnectionPool::new()),
            connector_id: "c0ffee".to_string(),
        }
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let app = router(state());

        let request = Request::builder()
            .uri("/healthcheck")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK\n");
    }

    #[tokio::test]
    async fn test_metrics_exposes_registry() {
        let state = state();
        state.metrics.increment_request_started(StreamKind::Http);
        state.metrics.record_request_completed(StreamKind::Http, 200);
        let app = router(state);

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("edgetunnel_tunnel_total_requests 1"));
        assert!(body.contains("edgetunnel_tunnel_response_by_code{status_code=\"200\"} 1"));
    }

    #[tokio::test]
    async fn test_ready_without_connections() {
        let app = router(state());

        let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], 503);
        assert_eq!(json["ready_connections"], 0);
        assert_eq!(json["connector_id"], "c0ffee");
    }

    #[tokio::test]
    async fn test_ready_with_active_connection() {
        let state = state();
        let handle = Arc::new(ConnectionHandle::new(ConnIndex(0), HandleSettings::default()));
        handle
            .establish(&IdleConnector, Duration::from_secs(1))
            .await
            .unwrap();
        state.pool.insert(handle);
        state.pool.insert(Arc::new(ConnectionHandle::new(
            ConnIndex(1),
            HandleSettings::default(),
        )));
        let app = router(state);

        let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], 200);
        assert_eq!(json["ready_connections"], 1);
    }
}
