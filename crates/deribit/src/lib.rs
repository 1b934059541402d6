//! Deribit JSON-RPC client with a serialized request dispatcher.
//!
//! This crate owns the authenticated side of the gateway:
//! - [`HttpClient`] issues single JSON-RPC calls over HTTPS
//! - [`Dispatcher`] serializes order-lifecycle requests through one worker
//!   task, keeps the bearer token fresh, and completes each caller's
//!   [`RpcHandle`] exactly once
//!
//! # Architecture
//!
//! ```text
//!  caller tasks                dispatcher worker
//!  ────────────                ─────────────────
//!  place_order ──┐
//!  cancel_order ─┼─► FIFO queue ─► freshness check ─► POST /api/v2/<method>
//!  get_* ────────┘      │               │                      │
//!                   RpcHandle      public/auth           complete handle
//! ```
//!
//! Requests are executed in enqueue order; the token is owned by the worker
//! and refreshed in-line when it is within a minute of expiry.

pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod types;

pub use auth::Credentials;
pub use dispatcher::{Dispatcher, DispatcherState, RpcHandle};
pub use error::{Error, Result};
pub use http::{HttpClient, HttpClientConfig, JsonRpcTransport};
pub use types::{OrderKind, OrderSide};
