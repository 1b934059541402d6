//! Shared upstream WebSocket plumbing for the trading gateway.
//!
//! The exchange connection is a single TLS WebSocket with one read loop and
//! one writer task. Everything that wants to put a frame on the wire goes
//! through an [`UpstreamWriter`] handle, so writes are serialized no matter
//! how many tasks hold one.

pub mod error;
pub mod messages;
pub mod ws_client;
pub mod ws_handler;

pub use error::{Error, Result};
pub use messages::UpstreamCommand;
pub use ws_client::{upstream_channel, ConnectionState, UpstreamWriter, WsClient, WsClientConfig};
pub use ws_handler::WsEvents;
