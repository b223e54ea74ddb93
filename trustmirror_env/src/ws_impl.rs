//! Production transport: WebSocket text frames via tokio-tungstenite.

use crate::error::EnvError;
use crate::transport::{Connection, Transport};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Connects to `ws://` endpoints.
///
/// TLS is not compiled in; `wss://` endpoints are rejected up front with
/// `EnvError::InvalidEndpoint` instead of failing every retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    /// Creates a new WebSocket transport.
    pub fn new() -> Self {
        Self
    }

    /// Checks that `endpoint` is a URL this transport can dial.
    pub fn check_endpoint(endpoint: &str) -> Result<(), EnvError> {
        if endpoint.starts_with("ws://") && endpoint.len() > "ws://".len() {
            Ok(())
        } else {
            Err(EnvError::InvalidEndpoint(endpoint.to_string()))
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    type Conn = WsConnection;

    async fn connect(&self, endpoint: &str) -> Result<WsConnection, EnvError> {
        Self::check_endpoint(endpoint)?;
        let (stream, response) = connect_async(endpoint).await.map_err(EnvError::connect)?;
        debug!("websocket handshake with {} complete ({})", endpoint, response.status());
        Ok(WsConnection { stream, open: true })
    }
}

/// One open WebSocket.
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    open: bool,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: String) -> Result<(), EnvError> {
        if !self.open {
            return Err(EnvError::ConnectionClosed);
        }
        self.stream.send(Message::Text(frame)).await.map_err(|e| {
            self.open = false;
            EnvError::network(e.to_string())
        })
    }

    async fn recv(&mut self) -> Option<Result<String, EnvError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!("websocket closed by peer: {:?}", frame);
                    self.open = false;
                    return None;
                }
                // Binary, ping and pong frames carry no application data
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.open = false;
                    return Some(Err(EnvError::network(e.to_string())));
                }
                None => {
                    self.open = false;
                    return None;
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> Result<(), EnvError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(EnvError::network(e.to_string())),
        }
    }
}
