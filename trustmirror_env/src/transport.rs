//! Transport abstraction for the synchronization engine.

use crate::error::EnvError;
use async_trait::async_trait;

/// Factory for full-duplex connections to one endpoint.
///
/// # Implementations
///
/// - **Production**: `WsTransport` (WebSocket text frames)
/// - **Tests / Simulation**: `MemoryTransport` (channel pair with admission control)
///
/// # Connection Flow
///
/// ```text
/// Supervisor                 Transport                  Server
///   |                           |                          |
///   |-- connect(url) ---------->|-- handshake ------------>|
///   |<-- Ok(conn) --------------|                          |
///   |-- conn.recv() ----------->|<-- frame ----------------|
///   |-- conn.send(probe) ------>|-- frame ---------------->|
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Conn: Connection;

    /// Opens a new connection to `endpoint`.
    ///
    /// # Returns
    /// * `Ok(conn)` - The connection is open and ready for traffic
    /// * `Err(EnvError::ConnectFailed)` - Refused, unreachable or handshake failure
    /// * `Err(EnvError::InvalidEndpoint)` - The endpoint can never be dialed; not retried
    async fn connect(&self, endpoint: &str) -> Result<Self::Conn, EnvError>;
}

/// One established, full-duplex text-frame connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Sends one text frame.
    ///
    /// Fails with `EnvError::ConnectionClosed` once the connection is closed.
    async fn send(&mut self, frame: String) -> Result<(), EnvError>;

    /// Receives the next inbound text frame.
    ///
    /// # Returns
    /// * `Some(Ok(frame))` - A frame arrived
    /// * `Some(Err(e))` - The connection failed
    /// * `None` - The peer closed the connection
    ///
    /// # Cancellation
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a frame. The supervisor races it against timers.
    async fn recv(&mut self) -> Option<Result<String, EnvError>>;

    /// Returns true while the connection can carry outbound frames.
    fn is_open(&self) -> bool;

    /// Closes the connection. Closing an already-closed connection is `Ok`.
    async fn close(&mut self) -> Result<(), EnvError>;
}
