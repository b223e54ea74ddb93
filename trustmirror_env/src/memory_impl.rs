//! In-memory transport backed by channel pairs.
//!
//! Each accepted `connect()` produces a `MemoryConnection` for the client and
//! a `MemoryPeer` for the test or simulated server. Admission is scripted, so
//! refusals and drops happen exactly where a scenario puts them.

use crate::error::EnvError;
use crate::transport::{Connection, Transport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Outcome of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The connection opens
    Accept,
    /// The connection is refused
    Refuse,
}

struct Shared {
    /// Scripted outcomes, consumed one per attempt
    admissions: VecDeque<Admission>,

    /// Outcome once the script is exhausted
    default_admission: Admission,

    /// Total `connect()` calls observed
    connect_attempts: usize,

    /// Server sides of accepted connections, oldest first
    peers: VecDeque<MemoryPeer>,
}

/// Channel-backed transport with scripted admission.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    /// Creates a transport that accepts every connection by default.
    pub fn new() -> Self {
        Self::with_default(Admission::Accept)
    }

    /// Creates a transport that refuses every connection by default.
    pub fn refusing() -> Self {
        Self::with_default(Admission::Refuse)
    }

    fn with_default(default_admission: Admission) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                admissions: VecDeque::new(),
                default_admission,
                connect_attempts: 0,
                peers: VecDeque::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues the outcome of the next unscripted attempt.
    pub fn push_admission(&self, admission: Admission) {
        self.state().admissions.push_back(admission);
    }

    /// Queues `n` refusals.
    pub fn refuse_next(&self, n: usize) {
        let mut state = self.state();
        for _ in 0..n {
            state.admissions.push_back(Admission::Refuse);
        }
    }

    /// Changes the outcome used once the script is exhausted.
    pub fn set_default_admission(&self, admission: Admission) {
        self.state().default_admission = admission;
    }

    /// Returns the number of `connect()` calls seen so far.
    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    /// Takes the oldest accepted connection's server side.
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.state().peers.pop_front()
    }

    /// Number of accepted connections whose peer has not been taken.
    pub fn pending_peers(&self) -> usize {
        self.state().peers.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Conn = MemoryConnection;

    async fn connect(&self, endpoint: &str) -> Result<MemoryConnection, EnvError> {
        let mut state = self.state();
        state.connect_attempts += 1;
        let fallback = state.default_admission;
        let admission = state.admissions.pop_front().unwrap_or(fallback);

        if admission == Admission::Refuse {
            return Err(EnvError::connect(format!("{endpoint}: connection refused")));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        state.peers.push_back(MemoryPeer {
            to_client: to_client_tx,
            from_client: from_client_rx,
            open: Arc::clone(&open),
        });

        Ok(MemoryConnection {
            rx: to_client_rx,
            tx: from_client_tx,
            open,
        })
    }
}

/// Client side of an in-memory connection.
pub struct MemoryConnection {
    rx: mpsc::UnboundedReceiver<Result<String, EnvError>>,
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, frame: String) -> Result<(), EnvError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(EnvError::ConnectionClosed);
        }
        self.tx.send(frame).map_err(|_| {
            self.open.store(false, Ordering::Release);
            EnvError::ConnectionClosed
        })
    }

    async fn recv(&mut self) -> Option<Result<String, EnvError>> {
        let next = self.rx.recv().await;
        if !matches!(next, Some(Ok(_))) {
            self.open.store(false, Ordering::Release);
        }
        next
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&mut self) -> Result<(), EnvError> {
        self.open.store(false, Ordering::Release);
        self.rx.close();
        Ok(())
    }
}

/// Server side of an in-memory connection.
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<Result<String, EnvError>>,
    from_client: mpsc::UnboundedReceiver<String>,
    open: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Delivers a frame to the client. Returns false if the client is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(Ok(frame.into())).is_ok()
    }

    /// Returns every frame the client sent that has not been read yet.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Waits for the next frame from the client.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Returns true while the client side considers the connection open.
    pub fn is_client_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Closes the connection cleanly from the server side.
    pub fn disconnect(self) {
        self.open.store(false, Ordering::Release);
    }

    /// Fails the connection with a transport error.
    pub fn fail(self, reason: impl Into<String>) {
        self.open.store(false, Ordering::Release);
        let _ = self.to_client.send(Err(EnvError::network(reason)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_admissions() {
        let transport = MemoryTransport::new();
        transport.refuse_next(2);

        assert!(transport.connect("mem://a").await.is_err());
        assert!(transport.connect("mem://a").await.is_err());
        assert!(transport.connect("mem://a").await.is_ok());
        assert_eq!(transport.connect_attempts(), 3);
        assert_eq!(transport.pending_peers(), 1);
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("mem://a").await.unwrap();
        let mut peer = transport.take_peer().unwrap();

        assert!(peer.send("hello"));
        assert_eq!(conn.recv().await.unwrap().unwrap(), "hello");

        conn.send("probe".to_string()).await.unwrap();
        assert_eq!(peer.drain(), vec!["probe".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("mem://a").await.unwrap();
        transport.take_peer().unwrap().disconnect();

        assert!(conn.recv().await.is_none());
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send("late".to_string()).await,
            Err(EnvError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_fail_surfaces_error() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("mem://a").await.unwrap();
        transport.take_peer().unwrap().fail("reset by peer");

        assert!(matches!(conn.recv().await, Some(Err(EnvError::NetworkError(_)))));
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("mem://a").await.unwrap();
        let peer = transport.take_peer().unwrap();

        assert!(conn.close().await.is_ok());
        assert!(conn.close().await.is_ok());
        assert!(!peer.is_client_open());
    }
}
