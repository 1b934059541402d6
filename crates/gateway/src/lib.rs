//! WebSocket gateway bridging downstream subscribers to the exchange.
//!
//! This service:
//! - Accepts WebSocket connections from local trading clients
//! - Forwards their orderbook/position subscriptions to the exchange
//! - Fans exchange channel data out to the matching sessions
//! - Exposes an HTTP API that drives the order-lifecycle dispatcher
//!
//! ## Architecture
//!
//! ```text
//! exchange WS: book.<symbol>.100ms / user.position.<symbol>
//!         ↓
//! SubscriptionBridge (weak-ref registry, swept before fan-out)
//!         ↓
//! SessionRegistry (per-session outbox, writes queued)
//!         ↓
//! downstream WebSocket clients
//! ```
//!
//! Order-lifecycle requests take a separate path through the serialized
//! dispatcher in the `deribit` crate.

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod session;
pub mod ws_server;

pub use bridge::{ChannelKind, SubscriptionBridge, UpstreamEvents};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use session::{SessionId, SessionRegistry, SessionState};
pub use ws_server::{create_router, AppState};
