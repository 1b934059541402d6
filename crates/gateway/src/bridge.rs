//! Subscription bridge: downstream subscribe requests go up, exchange
//! channel data fans out to the matching sessions.
//!
//! The registry holds weak session references and is swept before every
//! fan-out pass and on each disconnect, so a subscription can never keep a
//! dead session alive.

use crate::session::SessionState;
use async_trait::async_trait;
use common::{UpstreamWriter, WsEvents};
use metrics::counter;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

/// Kind of exchange channel a session subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Orderbook,
    Position,
}

struct Subscription {
    kind: ChannelKind,
    symbol: String,
    session: Weak<SessionState>,
}

/// Routes downstream subscribe requests upstream and exchange data back to
/// the matching sessions. One instance per gateway; owns its registry.
pub struct SubscriptionBridge {
    upstream: UpstreamWriter,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SubscriptionBridge {
    pub fn new(upstream: UpstreamWriter) -> Self {
        Self {
            upstream,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Handle one frame from a downstream session. Parse failures and
    /// unknown methods are logged and dropped, never propagated.
    pub fn handle_downstream(&self, session: &Arc<SessionState>, payload: &str) {
        let frame: Value = match serde_json::from_str(payload) {
            Ok(frame) => frame,
            Err(_) => {
                debug!(session = %session.id, "Invalid message from client: {}", payload);
                return;
            }
        };

        let (Some(method), Some(symbol)) = (
            frame.get("method").and_then(Value::as_str),
            frame.get("symbol").and_then(Value::as_str),
        ) else {
            return;
        };

        match method {
            "subscribe_orderbook" => self.subscribe(ChannelKind::Orderbook, symbol, session),
            "subscribe_position" => self.subscribe(ChannelKind::Position, symbol, session),
            other => debug!("Ignoring unknown method '{}' from client", other),
        }
    }

    fn subscribe(&self, kind: ChannelKind, symbol: &str, session: &Arc<SessionState>) {
        let request = match kind {
            ChannelKind::Orderbook => json!({
                "jsonrpc": "2.0",
                "id": 123,
                "method": "public/subscribe",
                "params": { "channels": [format!("book.{}.100ms", symbol)] },
            }),
            ChannelKind::Position => json!({
                "jsonrpc": "2.0",
                "id": 124,
                "method": "private/subscribe",
                "params": { "channels": [format!("user.position.{}", symbol)] },
            }),
        };

        info!(session = %session.id, ?kind, symbol, "Subscribing upstream");
        // The entry is recorded even when the send fails; subscribes are not
        // retried.
        if let Err(e) = self.upstream.send(request.to_string()) {
            warn!("Upstream subscribe send failed: {}", e);
        }

        self.subscriptions.lock().unwrap().push(Subscription {
            kind,
            symbol: symbol.to_string(),
            session: Arc::downgrade(session),
        });
        counter!("gateway_subscriptions_total").increment(1);
    }

    /// Handle one frame from the exchange.
    pub fn handle_upstream(&self, payload: &str) {
        let frame: Value = match serde_json::from_str(payload) {
            Ok(frame) => frame,
            Err(_) => {
                debug!("Unparseable upstream frame: {}", payload);
                return;
            }
        };

        // Frames carrying an id are subscribe acknowledgements; never fanned
        // out.
        if frame.get("id").is_some() {
            if let Some(error) = frame.get("error") {
                warn!("Upstream subscribe error: {}", error);
            } else {
                debug!("Upstream subscribe acknowledged");
            }
            return;
        }

        let Some(params) = frame.get("params") else {
            return;
        };
        let (Some(channel), Some(data)) = (
            params.get("channel").and_then(Value::as_str),
            params.get("data"),
        ) else {
            return;
        };

        if let Some((kind, symbol)) = parse_channel(channel) {
            self.fan_out(kind, symbol, data);
        }
    }

    fn fan_out(&self, kind: ChannelKind, symbol: &str, data: &Value) {
        let payload = data.to_string();
        let targets: Vec<Arc<SessionState>> = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.retain(|sub| sub.session.strong_count() > 0);
            subscriptions
                .iter()
                .filter(|sub| sub.kind == kind && sub.symbol == symbol)
                .filter_map(|sub| sub.session.upgrade())
                .collect()
        };

        for session in targets {
            match session.send(&payload) {
                Ok(()) => counter!("gateway_fanout_total").increment(1),
                Err(_) => {
                    debug!(session = %session.id, "Fan-out send failed");
                    counter!("gateway_fanout_errors_total").increment(1);
                }
            }
        }
    }

    /// Drop registry entries whose session is gone. Called on every
    /// downstream disconnect.
    pub fn sweep(&self) {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|sub| sub.session.strong_count() > 0);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

/// Split an exchange channel name into kind and symbol.
///
/// `book.BTC-PERP.100ms` → (Orderbook, "BTC-PERP");
/// `user.position.BTC-PERP` → (Position, "BTC-PERP").
pub fn parse_channel(channel: &str) -> Option<(ChannelKind, &str)> {
    if let Some(rest) = channel.strip_prefix("book.") {
        let symbol = rest.split('.').next().unwrap_or_default();
        (!symbol.is_empty()).then_some((ChannelKind::Orderbook, symbol))
    } else if let Some(symbol) = channel.strip_prefix("user.position.") {
        (!symbol.is_empty()).then_some((ChannelKind::Position, symbol))
    } else {
        None
    }
}

/// Exchange connection events, forwarded into the bridge.
pub struct UpstreamEvents {
    bridge: Arc<SubscriptionBridge>,
}

impl UpstreamEvents {
    pub fn new(bridge: Arc<SubscriptionBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl WsEvents for UpstreamEvents {
    async fn on_open(&self) {
        info!("Exchange WebSocket connected");
    }

    async fn on_message(&self, payload: &str) {
        self.bridge.handle_upstream(payload);
    }

    async fn on_close(&self) {
        info!("Exchange connection closed");
    }

    async fn on_error(&self, message: &str) {
        error!("Exchange WebSocket error: {}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use common::{upstream_channel, UpstreamCommand};
    use tokio::sync::mpsc;

    fn make_session() -> (Arc<SessionState>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(SessionState::new(tx, false)), rx)
    }

    fn recv_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<String> {
        match rx.try_recv() {
            Ok(Message::Text(text)) => Some(text.as_str().to_string()),
            Ok(other) => panic!("expected text frame, got {:?}", other),
            Err(_) => None,
        }
    }

    #[test]
    fn channel_names_parse_into_kind_and_symbol() {
        assert_eq!(
            parse_channel("book.BTC-PERP.100ms"),
            Some((ChannelKind::Orderbook, "BTC-PERP"))
        );
        assert_eq!(
            parse_channel("user.position.ETH-PERP"),
            Some((ChannelKind::Position, "ETH-PERP"))
        );
        assert_eq!(parse_channel("ticker.BTC-PERP.raw"), None);
        assert_eq!(parse_channel("book."), None);
        assert_eq!(parse_channel("user.position."), None);
    }

    #[test]
    fn orderbook_subscribe_sends_upstream_request_and_records_entry() {
        let (writer, mut commands) = upstream_channel();
        let bridge = SubscriptionBridge::new(writer);
        let (session, _rx) = make_session();

        bridge.handle_downstream(
            &session,
            r#"{"method":"subscribe_orderbook","symbol":"BTC-PERP"}"#,
        );

        let UpstreamCommand::Send(frame) = commands.try_recv().unwrap() else {
            panic!("expected a send command");
        };
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["id"], 123);
        assert_eq!(frame["method"], "public/subscribe");
        assert_eq!(frame["params"]["channels"], json!(["book.BTC-PERP.100ms"]));

        assert_eq!(bridge.subscription_count(), 1);
    }

    #[test]
    fn position_subscribe_uses_the_private_channel() {
        let (writer, mut commands) = upstream_channel();
        let bridge = SubscriptionBridge::new(writer);
        let (session, _rx) = make_session();

        bridge.handle_downstream(
            &session,
            r#"{"method":"subscribe_position","symbol":"BTC-PERP"}"#,
        );

        let UpstreamCommand::Send(frame) = commands.try_recv().unwrap() else {
            panic!("expected a send command");
        };
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["id"], 124);
        assert_eq!(frame["method"], "private/subscribe");
        assert_eq!(
            frame["params"]["channels"],
            json!(["user.position.BTC-PERP"])
        );
    }

    #[test]
    fn malformed_and_unknown_downstream_frames_are_dropped() {
        let (writer, mut commands) = upstream_channel();
        let bridge = SubscriptionBridge::new(writer);
        let (session, _rx) = make_session();

        bridge.handle_downstream(&session, "not json");
        bridge.handle_downstream(&session, r#"{"method":"subscribe_orderbook"}"#);
        bridge.handle_downstream(&session, r#"{"symbol":"BTC-PERP"}"#);
        bridge.handle_downstream(&session, r#"{"method":"unsubscribe","symbol":"BTC-PERP"}"#);

        assert_eq!(bridge.subscription_count(), 0);
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn entry_is_recorded_even_when_the_upstream_send_fails() {
        let (writer, commands) = upstream_channel();
        drop(commands);
        let bridge = SubscriptionBridge::new(writer);
        let (session, _rx) = make_session();

        bridge.handle_downstream(
            &session,
            r#"{"method":"subscribe_orderbook","symbol":"BTC-PERP"}"#,
        );
        assert_eq!(bridge.subscription_count(), 1);
    }

    #[test]
    fn fan_out_routes_by_kind_and_symbol() {
        let (writer, _commands) = upstream_channel();
        let bridge = SubscriptionBridge::new(writer);

        let (btc_a, mut rx_btc_a) = make_session();
        let (btc_b, mut rx_btc_b) = make_session();
        let (eth, mut rx_eth) = make_session();
        let (pos, mut rx_pos) = make_session();

        bridge.handle_downstream(&btc_a, r#"{"method":"subscribe_orderbook","symbol":"BTC-PERP"}"#);
        bridge.handle_downstream(&btc_b, r#"{"method":"subscribe_orderbook","symbol":"BTC-PERP"}"#);
        bridge.handle_downstream(&eth, r#"{"method":"subscribe_orderbook","symbol":"ETH-PERP"}"#);
        bridge.handle_downstream(&pos, r#"{"method":"subscribe_position","symbol":"BTC-PERP"}"#);

        bridge.handle_upstream(
            r#"{"params":{"channel":"book.BTC-PERP.100ms","data":{"bids":[]}}}"#,
        );

        assert_eq!(recv_text(&mut rx_btc_a).unwrap(), r#"{"bids":[]}"#);
        assert_eq!(recv_text(&mut rx_btc_b).unwrap(), r#"{"bids":[]}"#);
        assert!(recv_text(&mut rx_eth).is_none());
        assert!(recv_text(&mut rx_pos).is_none());

        bridge.handle_upstream(
            r#"{"params":{"channel":"user.position.BTC-PERP","data":{"size":10}}}"#,
        );

        assert_eq!(recv_text(&mut rx_pos).unwrap(), r#"{"size":10}"#);
        assert!(recv_text(&mut rx_btc_a).is_none());
    }

    #[test]
    fn ack_frames_are_never_fanned_out() {
        let (writer, _commands) = upstream_channel();
        let bridge = SubscriptionBridge::new(writer);
        let (session, mut rx) = make_session();

        bridge.handle_downstream(&session, r#"{"method":"subscribe_orderbook","symbol":"X"}"#);

        // Even with routable params, the id marks this as an acknowledgement.
        bridge.handle_upstream(
            r#"{"id":123,"params":{"channel":"book.X.100ms","data":{"bids":[]}}}"#,
        );
        bridge.handle_upstream(r#"{"id":123,"error":{"message":"denied"}}"#);
        bridge.handle_upstream("garbage frame");
        bridge.handle_upstream(r#"{"params":{"channel":"book.X.100ms"}}"#);

        assert!(recv_text(&mut rx).is_none());
    }

    #[test]
    fn dead_sessions_are_swept_before_fan_out() {
        let (writer, _commands) = upstream_channel();
        let bridge = SubscriptionBridge::new(writer);

        let (alive, mut rx_alive) = make_session();
        let (dead, _rx_dead) = make_session();

        bridge.handle_downstream(&alive, r#"{"method":"subscribe_orderbook","symbol":"X"}"#);
        bridge.handle_downstream(&dead, r#"{"method":"subscribe_orderbook","symbol":"X"}"#);
        assert_eq!(bridge.subscription_count(), 2);

        drop(dead);

        bridge.handle_upstream(r#"{"params":{"channel":"book.X.100ms","data":{"bids":[]}}}"#);

        assert_eq!(recv_text(&mut rx_alive).unwrap(), r#"{"bids":[]}"#);
        assert_eq!(bridge.subscription_count(), 1);
    }

    #[test]
    fn disconnect_sweep_drops_expired_entries() {
        let (writer, _commands) = upstream_channel();
        let bridge = SubscriptionBridge::new(writer);
        let (session, _rx) = make_session();

        bridge.handle_downstream(&session, r#"{"method":"subscribe_position","symbol":"X"}"#);
        assert_eq!(bridge.subscription_count(), 1);

        drop(session);
        bridge.sweep();
        assert_eq!(bridge.subscription_count(), 0);
    }

    #[test]
    fn send_failure_does_not_abort_the_pass() {
        let (writer, _commands) = upstream_channel();
        let bridge = SubscriptionBridge::new(writer);

        // First subscriber's outbox is gone but its Arc is alive.
        let (broken, rx_broken) = make_session();
        drop(rx_broken);
        let (healthy, mut rx_healthy) = make_session();

        bridge.handle_downstream(&broken, r#"{"method":"subscribe_orderbook","symbol":"X"}"#);
        bridge.handle_downstream(&healthy, r#"{"method":"subscribe_orderbook","symbol":"X"}"#);

        bridge.handle_upstream(r#"{"params":{"channel":"book.X.100ms","data":{"bids":[1]}}}"#);

        assert_eq!(recv_text(&mut rx_healthy).unwrap(), r#"{"bids":[1]}"#);
    }
}
