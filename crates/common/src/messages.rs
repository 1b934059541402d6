//! Control messages for the upstream writer task.

/// Commands accepted by the upstream connection's writer task.
#[derive(Debug, Clone)]
pub enum UpstreamCommand {
    /// Put a text frame on the wire.
    Send(String),
    /// Answer a ping from the exchange.
    Pong(Vec<u8>),
    /// Send a normal-code close frame and stop writing.
    Close,
}
