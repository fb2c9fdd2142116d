//! edge-tunnel - Elastic Edge Tunnel Agent with Hexagonal Architecture
//!
//! This is the composition root that wires together all the components.

use anyhow::Context;
use edge_tunnel::adapters::inbound::MetricsServer;
use edge_tunnel::adapters::outbound::{IngressResolver, QuicEdgeConnector, TcpOriginDialer};
use edge_tunnel::infrastructure::shutdown_signal;
use edge_tunnel::{
    load_config, ConnectionPool, ConnectionSupervisor, ShutdownController, StreamDispatcher,
    TunnelMetrics,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let connector_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        "starting edge-tunnel connector={} edge={} min={} max={}",
        connector_id,
        cfg.edge_addr,
        cfg.min_connections,
        cfg.max_connections
    );

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapters
    let resolver = Arc::new(IngressResolver::parse(&cfg.ingress).context("parsing ingress rules")?);
    tracing::info!("loaded {} ingress rules", resolver.len());

    let dialer = Arc::new(TcpOriginDialer::new(cfg.origin_connect_timeout()));

    let edge_addr: SocketAddr = cfg
        .edge_addr
        .parse()
        .with_context(|| format!("invalid edge address {:?}", cfg.edge_addr))?;
    // TODO: load the edge's CA bundle instead of skipping server verification
    let connector = Arc::new(QuicEdgeConnector::insecure(
        edge_addr,
        cfg.edge_server_name.clone(),
        cfg.max_streams_per_connection,
    )?);

    // 2. Shared state
    let metrics = Arc::new(TunnelMetrics::new()?);
    let pool = Arc::new(ConnectionPool::new());
    let shutdown = ShutdownController::new();

    // 3. Application services
    let dispatcher = Arc::new(StreamDispatcher::new(resolver, dialer, metrics.clone()));
    let supervisor = ConnectionSupervisor::new(
        connector,
        dispatcher,
        metrics.clone(),
        pool.clone(),
        cfg.supervisor_settings(),
        shutdown.clone(),
    );

    // 4. Inbound adapter and signals
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let server = MetricsServer::new(cfg.metrics_addr.clone(), metrics, pool, connector_id);
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            tracing::error!("metrics server error: {:?}", e);
        }
    });

    supervisor.run().await;
    tracing::info!("edge-tunnel stopped");
    Ok(())
}
