//! Secure WebSocket client for the upstream exchange connection.
//!
//! One read-loop task surfaces inbound frames to a [`WsEvents`] handler; one
//! writer task owns the sink and drains an [`UpstreamCommand`] channel, so
//! every outbound frame goes over the wire serialized regardless of which
//! task asked for it.

use crate::error::{Error, Result};
use crate::messages::UpstreamCommand;
use crate::ws_handler::WsEvents;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector,
};
use tracing::{debug, error, info, warn};
use url::Url;

/// Configuration for the upstream connection.
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Full `wss://host:port/path` URL of the exchange endpoint.
    pub url: String,
    /// Per-address TCP connect timeout.
    pub connect_timeout: Duration,
    /// Bound on the close-frame send during shutdown.
    pub shutdown_timeout: Duration,
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

/// Connection lifecycle, readable from any task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

fn state_from(raw: u8) -> ConnectionState {
    match raw {
        STATE_CONNECTING => ConnectionState::Connecting,
        STATE_CONNECTED => ConnectionState::Connected,
        _ => ConnectionState::Disconnected,
    }
}

/// Cloneable handle that enqueues frames for the writer task.
#[derive(Debug, Clone)]
pub struct UpstreamWriter {
    tx: mpsc::UnboundedSender<UpstreamCommand>,
}

impl UpstreamWriter {
    /// Queue a text frame for transmission.
    pub fn send(&self, frame: String) -> Result<()> {
        self.tx
            .send(UpstreamCommand::Send(frame))
            .map_err(|_| Error::ChannelClosed)
    }

    fn command(&self, cmd: UpstreamCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::ChannelClosed)
    }
}

/// Create the writer handle and the receiver the connection will drain.
///
/// The channel exists before the socket so the subscription bridge can be
/// wired up first and handed to [`WsClient::connect`] as part of its handler.
pub fn upstream_channel() -> (UpstreamWriter, mpsc::UnboundedReceiver<UpstreamCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UpstreamWriter { tx }, rx)
}

/// TLS WebSocket connection to the exchange.
pub struct WsClient {
    writer: UpstreamWriter,
    state: Arc<AtomicU8>,
    closing: Arc<AtomicBool>,
    shutdown_timeout: Duration,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsClient {
    /// Connect, perform the TLS + WebSocket handshakes, fire `on_open`, and
    /// spawn the read loop and writer task.
    pub async fn connect(
        config: WsClientConfig,
        handler: Arc<dyn WsEvents>,
        writer: UpstreamWriter,
        commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    ) -> Result<Self> {
        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let closing = Arc::new(AtomicBool::new(false));

        info!("Connecting to upstream WebSocket: {}", config.url);

        let handshake = async {
            let url = Url::parse(&config.url)?;
            let host = url.host_str().ok_or_else(|| {
                Error::Generic(format!("upstream URL '{}' has no host", config.url))
            })?;
            let port = url.port().unwrap_or(443);

            let candidates = resolve_endpoint(host, port)?;
            let tcp = open_tcp(&candidates, config.connect_timeout).await?;
            let connector = tls_connector()?;

            let pair =
                client_async_tls_with_config(config.url.as_str(), tcp, None, Some(connector))
                    .await?;
            Ok::<_, Error>(pair)
        };
        let (ws_stream, response) = match handshake.await {
            Ok(pair) => pair,
            Err(e) => {
                state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                return Err(e);
            }
        };
        debug!("WebSocket handshake complete, status: {:?}", response.status());

        state.store(STATE_CONNECTED, Ordering::SeqCst);
        let (mut write, mut read) = ws_stream.split();

        handler.on_open().await;

        let write_task = {
            let closing = closing.clone();
            let shutdown_timeout = config.shutdown_timeout;
            let mut commands = commands;
            tokio::spawn(async move {
                while let Some(cmd) = commands.recv().await {
                    match cmd {
                        UpstreamCommand::Send(frame) => {
                            if let Err(e) = write.send(Message::Text(frame.into())).await {
                                if !closing.load(Ordering::SeqCst) {
                                    warn!("Upstream send failed: {}", e);
                                    counter!("upstream_ws_errors_total").increment(1);
                                }
                                break;
                            }
                            counter!("upstream_ws_frames_sent_total").increment(1);
                        }
                        UpstreamCommand::Pong(data) => {
                            if write.send(Message::Pong(data.into())).await.is_err() {
                                break;
                            }
                        }
                        UpstreamCommand::Close => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "shutdown".into(),
                            };
                            let _ = tokio::time::timeout(
                                shutdown_timeout,
                                write.send(Message::Close(Some(frame))),
                            )
                            .await;
                            break;
                        }
                    }
                }
            })
        };

        let read_task = {
            let state = state.clone();
            let closing = closing.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => {
                            counter!("upstream_ws_messages_total").increment(1);
                            handler.on_message(text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if let Ok(text) = std::str::from_utf8(&data) {
                                counter!("upstream_ws_messages_total").increment(1);
                                handler.on_message(text).await;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = writer.command(UpstreamCommand::Pong(data.to_vec()));
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            info!("Upstream sent close frame: {:?}", frame);
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            let message = e.to_string();
                            if !closing.load(Ordering::SeqCst) && !is_teardown_error(&message) {
                                error!("Upstream WebSocket error: {}", message);
                                counter!("upstream_ws_errors_total").increment(1);
                                handler.on_error(&message).await;
                            }
                            break;
                        }
                        None => {
                            info!("Upstream WebSocket stream ended");
                            break;
                        }
                    }
                }
                state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                handler.on_close().await;
            })
        };

        Ok(Self {
            writer,
            state,
            closing,
            shutdown_timeout: config.shutdown_timeout,
            read_task: Mutex::new(Some(read_task)),
            write_task: Mutex::new(Some(write_task)),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        state_from(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Handle for enqueueing outbound frames.
    pub fn writer(&self) -> UpstreamWriter {
        self.writer.clone()
    }

    /// Signal the writer to send a close frame, then wait for the read loop
    /// to finish. Safe to call more than once.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing upstream connection");
        let _ = self.writer.command(UpstreamCommand::Close);

        if let Some(task) = self.read_task.lock().await.take() {
            let deadline = self.shutdown_timeout + Duration::from_secs(1);
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!("Upstream read loop did not stop in time, aborting");
            }
        }
        if let Some(task) = self.write_task.lock().await.take() {
            task.abort();
        }
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
    }
}

/// Resolve `host:port`, listing IPv4 candidates ahead of IPv6. Some dual
/// stack environments advertise v6 addresses they cannot route.
fn resolve_endpoint(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let mut candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Generic(format!("cannot resolve {}:{}: {}", host, port, e)))?
        .collect();
    if candidates.is_empty() {
        return Err(Error::Generic(format!(
            "{}:{} resolved to no addresses",
            host, port
        )));
    }
    // Stable sort keeps resolver order within each family.
    candidates.sort_by_key(SocketAddr::is_ipv6);
    Ok(candidates)
}

/// Try each candidate in turn, bounding every attempt by `connect_timeout`.
async fn open_tcp(candidates: &[SocketAddr], connect_timeout: Duration) -> Result<TcpStream> {
    let mut last_failure = "no candidate addresses".to_string();
    for addr in candidates {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("TCP {} unreachable: {}", addr, e);
                last_failure = e.to_string();
            }
            Err(_) => {
                debug!("TCP {} timed out after {:?}", addr, connect_timeout);
                last_failure = format!("connect to {} timed out", addr);
            }
        }
    }
    Err(Error::Generic(format!(
        "upstream endpoint unreachable: {}",
        last_failure
    )))
}

/// Certificate-verifying TLS connector backed by the platform trust store.
fn tls_connector() -> Result<Connector> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(tls)))
}

/// Errors that are part of a normal WebSocket teardown and should not be
/// surfaced through `on_error`.
fn is_teardown_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("operation canceled")
        || lower.contains("stream truncated")
        || lower.contains("end of file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_errors_are_suppressed() {
        assert!(is_teardown_error("Operation canceled"));
        assert!(is_teardown_error("TLS error: stream truncated"));
        assert!(is_teardown_error("End of file"));
        assert!(!is_teardown_error("connection reset by peer"));
        assert!(!is_teardown_error("handshake failure"));
    }

    #[test]
    fn state_roundtrip() {
        assert_eq!(state_from(STATE_DISCONNECTED), ConnectionState::Disconnected);
        assert_eq!(state_from(STATE_CONNECTING), ConnectionState::Connecting);
        assert_eq!(state_from(STATE_CONNECTED), ConnectionState::Connected);
        assert_eq!(state_from(250), ConnectionState::Disconnected);
    }

    #[test]
    fn endpoint_resolution_lists_ipv4_first() {
        let candidates = resolve_endpoint("localhost", 9).unwrap();
        assert!(!candidates.is_empty());
        // Once a v6 address appears, no v4 may follow it.
        let families: Vec<bool> = candidates.iter().map(SocketAddr::is_ipv6).collect();
        assert!(families.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn writer_enqueues_frames_in_order() {
        let (writer, mut rx) = upstream_channel();
        writer.send("first".to_string()).unwrap();
        writer.send("second".to_string()).unwrap();

        match rx.recv().await.unwrap() {
            UpstreamCommand::Send(frame) => assert_eq!(frame, "first"),
            other => panic!("unexpected command: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            UpstreamCommand::Send(frame) => assert_eq!(frame, "second"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn writer_fails_once_receiver_is_gone() {
        let (writer, rx) = upstream_channel();
        drop(rx);
        assert!(matches!(
            writer.send("frame".to_string()),
            Err(Error::ChannelClosed)
        ));
    }
}
