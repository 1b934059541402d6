//! Gateway configuration, read once from the environment.

use std::env;
use std::net::{IpAddr, Ipv4Addr};

/// Runtime settings for the gateway binary. Loaded one-shot; the loader
/// returns a value and keeps no global state.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address for the downstream WebSocket server.
    pub address: IpAddr,
    /// Listen port for the downstream WebSocket server.
    pub port: u16,
    /// Send binary frames to downstream sessions instead of text.
    pub binary_frames: bool,
    /// Exchange WebSocket endpoint.
    pub upstream_ws_url: String,
    /// Prometheus exporter port.
    pub metrics_port: u16,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let address = env::var("GATEWAY_ADDR")
            .map(|v| v.parse().expect("GATEWAY_ADDR must be an IP address"))
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = env::var("GATEWAY_PORT")
            .map(|v| v.parse().expect("GATEWAY_PORT must be a number"))
            .unwrap_or(8000);
        let binary_frames = env::var("BINARY_PROTOCOL")
            .map(|v| v == "true")
            .unwrap_or(false);
        let upstream_ws_url = env::var("DERIBIT_WS_URL")
            .unwrap_or_else(|_| "wss://test.deribit.com/ws/api/v2".to_string());
        let metrics_port = env::var("METRICS_PORT")
            .map(|v| v.parse().expect("METRICS_PORT must be a number"))
            .unwrap_or(9000);

        Self {
            address,
            port,
            binary_frames,
            upstream_ws_url,
            metrics_port,
        }
    }
}
