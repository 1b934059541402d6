//! Gateway service entry point.
//!
//! Wires the serialized order dispatcher, the exchange WebSocket and the
//! downstream WebSocket server together and runs until interrupted.

use anyhow::Result;
use common::{upstream_channel, WsClient, WsClientConfig};
use deribit::Dispatcher;
use gateway::{api, create_router, AppState, GatewayConfig, SessionRegistry, SubscriptionBridge, UpstreamEvents};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting trading gateway");

    let config = GatewayConfig::from_env();
    info!("Configuration:");
    info!("  listen: {}:{}", config.address, config.port);
    info!("  upstream: {}", config.upstream_ws_url);
    info!(
        "  frame mode: {}",
        if config.binary_frames { "binary" } else { "text" }
    );
    info!("  metrics port: {}", config.metrics_port);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Order dispatcher: authenticates with the exchange before anything
    // else; missing or rejected credentials abort startup.
    let dispatcher = Arc::new(Dispatcher::from_env().await?);

    // Upstream WebSocket with the subscription bridge as its handler. The
    // writer handle exists first so the bridge can be built before the
    // socket.
    let (writer, commands) = upstream_channel();
    let bridge = Arc::new(SubscriptionBridge::new(writer.clone()));
    let upstream = WsClient::connect(
        WsClientConfig::new(config.upstream_ws_url.clone()),
        Arc::new(UpstreamEvents::new(bridge.clone())),
        writer,
        commands,
    )
    .await?;

    // Downstream WebSocket server plus the order-lifecycle HTTP API.
    let registry = Arc::new(SessionRegistry::new());
    let state = Arc::new(AppState {
        registry: registry.clone(),
        bridge: bridge.clone(),
        binary_frames: config.binary_frames,
    });
    let app = create_router(state).merge(api::create_router(Arc::new(api::ApiState {
        dispatcher: dispatcher.clone(),
    })));

    let addr = SocketAddr::from((config.address, config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    registry.close_all();
    upstream.close().await;
    dispatcher.stop().await;

    info!("Gateway stopped");
    Ok(())
}

/// Resolves once the process is asked to exit, via interrupt or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        signal::ctrl_c().await.expect("ctrl-c handler");
        info!("Interrupt received, shutting down");
    };

    #[cfg(unix)]
    let terminated = async {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        term.recv().await;
        info!("SIGTERM received, shutting down");
    };

    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminated => {}
    }
}
