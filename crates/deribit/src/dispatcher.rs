//! Serialized request dispatcher for the exchange's JSON-RPC API.
//!
//! Public operations never block the caller: each builds a params object,
//! pushes an envelope onto the FIFO queue and returns an [`RpcHandle`]. One
//! worker task drains the queue in order, re-authenticates when the bearer
//! token is within a minute of expiry, POSTs the call, and completes the
//! caller's handle exactly once.

use crate::auth::{Credentials, SessionToken};
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpClientConfig, JsonRpcTransport};
use crate::types::{OrderKind, OrderSide};
use metrics::counter;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One-shot handle for a queued request. Resolves exactly once with the
/// parsed response or an error; abandoning it is safe.
pub struct RpcHandle {
    rx: oneshot::Receiver<Result<Value>>,
}

impl RpcHandle {
    /// Wait for the dispatcher to complete this request.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(result) => result,
            // The worker is gone without completing the envelope; only
            // possible once the dispatcher has been stopped.
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// Observable dispatcher lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Initialising,
    Authenticating,
    Ready,
    Refreshing,
    Draining,
    Stopped,
}

const STATE_INITIALISING: u8 = 0;
const STATE_AUTHENTICATING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_REFRESHING: u8 = 3;
const STATE_DRAINING: u8 = 4;
const STATE_STOPPED: u8 = 5;

fn state_from(raw: u8) -> DispatcherState {
    match raw {
        STATE_AUTHENTICATING => DispatcherState::Authenticating,
        STATE_READY => DispatcherState::Ready,
        STATE_REFRESHING => DispatcherState::Refreshing,
        STATE_DRAINING => DispatcherState::Draining,
        STATE_STOPPED => DispatcherState::Stopped,
        _ => DispatcherState::Initialising,
    }
}

/// Request envelope: owned by the queue until the worker drains it, then
/// consumed when `done` fires.
struct RpcRequest {
    method: String,
    params: Value,
    done: oneshot::Sender<Result<Value>>,
    enqueued_at: Instant,
}

enum QueueItem {
    Rpc(RpcRequest),
    Shutdown,
}

/// Serialized upstream dispatcher.
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<QueueItem>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Arc<AtomicU8>,
    stopped: AtomicBool,
}

impl Dispatcher {
    /// Authenticate with the exchange and start the worker task. Fails fast
    /// when the credentials are rejected.
    pub async fn connect(
        credentials: Credentials,
        transport: Arc<dyn JsonRpcTransport>,
    ) -> Result<Self> {
        let state = Arc::new(AtomicU8::new(STATE_INITIALISING));
        let mut worker = Worker {
            credentials,
            transport,
            token: None,
            last_id: 0,
            state: state.clone(),
        };

        state.store(STATE_AUTHENTICATING, Ordering::SeqCst);
        worker.authenticate().await?;
        state.store(STATE_READY, Ordering::SeqCst);
        info!("Dispatcher authenticated and ready");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker.run(rx));

        Ok(Self {
            queue: tx,
            worker: Mutex::new(Some(handle)),
            state,
            stopped: AtomicBool::new(false),
        })
    }

    /// Construct from `DERIBIT_*` environment variables with the default
    /// HTTPS client.
    pub async fn from_env() -> Result<Self> {
        let credentials = Credentials::from_env()?;
        let transport = Arc::new(HttpClient::new(HttpClientConfig::default())?);
        Self::connect(credentials, transport).await
    }

    pub fn state(&self) -> DispatcherState {
        state_from(self.state.load(Ordering::SeqCst))
    }

    /// Place an order. `side` must be `buy` or `sell`; `kind` one of
    /// `limit`, `market`, `stop_limit`, `stop_market`. `price` is encoded
    /// for priced kinds and doubles as the trigger price for stop kinds;
    /// `reduce_only` is encoded only when set.
    pub fn place_order(
        &self,
        instrument: &str,
        side: &str,
        kind: &str,
        amount: f64,
        price: f64,
        reduce_only: bool,
    ) -> Result<RpcHandle> {
        let side: OrderSide = side.parse()?;
        let kind: OrderKind = kind.parse()?;

        let mut params = serde_json::Map::new();
        params.insert("instrument_name".to_string(), json!(instrument));
        params.insert("amount".to_string(), json!(amount));
        params.insert("type".to_string(), json!(kind.as_str()));
        if kind.is_priced() {
            params.insert("price".to_string(), json!(price));
        }
        if kind.is_triggered() {
            params.insert("trigger".to_string(), json!("last_price"));
            params.insert("trigger_price".to_string(), json!(price));
        }
        if reduce_only {
            params.insert("reduce_only".to_string(), json!(true));
        }

        Ok(self.enqueue(format!("private/{}", side), Value::Object(params)))
    }

    pub fn cancel_order(&self, order_id: &str) -> RpcHandle {
        self.enqueue(
            "private/cancel".to_string(),
            json!({ "order_id": order_id }),
        )
    }

    pub fn modify_order(&self, order_id: &str, new_price: f64, new_amount: f64) -> RpcHandle {
        self.enqueue(
            "private/edit".to_string(),
            json!({ "order_id": order_id, "amount": new_amount, "price": new_price }),
        )
    }

    pub fn get_active_orders(&self) -> RpcHandle {
        self.enqueue(
            "private/get_open_orders".to_string(),
            json!({ "type": "all" }),
        )
    }

    pub fn get_order_state(&self, order_id: &str) -> RpcHandle {
        self.enqueue(
            "private/get_order_state".to_string(),
            json!({ "order_id": order_id }),
        )
    }

    pub fn get_orderbook(&self, instrument: &str) -> RpcHandle {
        self.enqueue(
            "public/get_order_book".to_string(),
            json!({ "instrument_name": instrument, "depth": 1 }),
        )
    }

    pub fn get_instrument(&self, name: &str) -> RpcHandle {
        self.enqueue(
            "public/get_instrument".to_string(),
            json!({ "instrument_name": name }),
        )
    }

    pub fn get_instruments(&self, currency: &str, kind: &str) -> RpcHandle {
        self.enqueue(
            "public/get_instruments".to_string(),
            json!({ "currency": currency, "kind": kind, "expired": false }),
        )
    }

    pub fn get_positions(&self, currency: &str) -> RpcHandle {
        self.enqueue(
            "private/get_positions".to_string(),
            json!({ "currency": currency }),
        )
    }

    fn enqueue(&self, method: String, params: Value) -> RpcHandle {
        let (done, rx) = oneshot::channel();
        let handle = RpcHandle { rx };

        if self.stopped.load(Ordering::SeqCst) {
            let _ = done.send(Err(Error::Cancelled));
            return handle;
        }

        let request = RpcRequest {
            method,
            params,
            done,
            enqueued_at: Instant::now(),
        };
        if let Err(e) = self.queue.send(QueueItem::Rpc(request)) {
            if let QueueItem::Rpc(request) = e.0 {
                let _ = request.done.send(Err(Error::Cancelled));
            }
        }
        handle
    }

    /// Stop the worker. Queued envelopes behind the shutdown marker are
    /// completed with [`Error::Cancelled`]; the in-flight call finishes or
    /// times out. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.store(STATE_DRAINING, Ordering::SeqCst);
        let _ = self.queue.send(QueueItem::Shutdown);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        info!("Dispatcher stopped");
    }
}

/// Worker-side state: credentials, transport and the bearer token. Nothing
/// outside the worker reads the token.
struct Worker {
    credentials: Credentials,
    transport: Arc<dyn JsonRpcTransport>,
    token: Option<SessionToken>,
    last_id: u64,
    state: Arc<AtomicU8>,
}

impl Worker {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<QueueItem>) {
        while let Some(item) = queue.recv().await {
            match item {
                QueueItem::Rpc(request) => self.service(request).await,
                QueueItem::Shutdown => {
                    queue.close();
                    while let Ok(item) = queue.try_recv() {
                        if let QueueItem::Rpc(request) = item {
                            let _ = request.done.send(Err(Error::Cancelled));
                        }
                    }
                    break;
                }
            }
        }
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        debug!("Dispatcher worker exited");
    }

    async fn service(&mut self, request: RpcRequest) {
        counter!("deribit_rpcs_total").increment(1);
        debug!(
            method = %request.method,
            queued_for = ?request.enqueued_at.elapsed(),
            "Dispatching RPC"
        );

        if !self.token.as_ref().is_some_and(SessionToken::is_fresh) {
            self.state.store(STATE_REFRESHING, Ordering::SeqCst);
            let refreshed = self.authenticate().await;
            self.state.store(STATE_READY, Ordering::SeqCst);
            if let Err(e) = refreshed {
                warn!(method = %request.method, "Token refresh failed: {}", e);
                counter!("deribit_rpc_errors_total").increment(1);
                let _ = request.done.send(Err(e));
                return;
            }
        }

        let bearer = self
            .token
            .as_ref()
            .map(|token| token.access_token.clone())
            .unwrap_or_default();
        let result = self
            .call(&request.method, &request.params, Some(&bearer))
            .await;
        if result.is_err() {
            counter!("deribit_rpc_errors_total").increment(1);
        }
        let _ = request.done.send(result);
    }

    async fn call(&mut self, method: &str, params: &Value, bearer: Option<&str>) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": method,
            "params": params,
        });
        let url = self.credentials.rpc_url(method);
        let raw = self
            .transport
            .post_json(&url, body.to_string(), bearer)
            .await?;
        let parsed: Value = serde_json::from_str(&raw)?;
        Ok(parsed)
    }

    async fn authenticate(&mut self) -> Result<()> {
        counter!("deribit_auth_total").increment(1);
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "public/auth",
            "params": {
                "grant_type": "client_credentials",
                "client_id": self.credentials.api_key,
                "client_secret": self.credentials.api_secret,
            },
        });
        let raw = self
            .transport
            .post_json(&self.credentials.rpc_root(), body.to_string(), None)
            .await?;
        let parsed: Value = serde_json::from_str(&raw)?;
        match SessionToken::from_response(&parsed) {
            Some(token) => {
                debug!(expires_in = token.expires_in, "Authenticated with exchange");
                self.token = Some(token);
                Ok(())
            }
            None => Err(Error::Auth(raw)),
        }
    }

    /// JSON-RPC id: wall-clock milliseconds, clamped so it never decreases.
    fn next_id(&mut self) -> u64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_id = self.last_id.max(now_ms);
        self.last_id
    }
}
