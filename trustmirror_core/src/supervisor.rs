//! Connection Supervisor - drives the lifecycle state machine against a
//! real transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Supervisor task                           │
//! │   select! (biased)                                           │
//! │    • host command (start / stop / shutdown)                  │
//! │    • Connecting: transport.connect(endpoint)                 │
//! │    • Open:       heartbeat due │ conn.recv()                 │
//! │    • Backoff:    retry timer                                 │
//! │            │                                                 │
//! │            ▼                                                 │
//! │   ConnectionState::handle(trigger) ──► actions               │
//! │            │                                                 │
//! │   frame ──► protocol::decode ──► StateStore::apply           │
//! │                               └─► anomaly alert broadcast    │
//! └──────────────────────────────────────────────────────────────┘
//!        │ watch / broadcast<ConnectivityStatus>   │ watch<StoreSnapshot>
//!        ▼                                         ▼
//!     dashboard                              rendering layer
//! ```
//!
//! Everything that touches the connection runs on this one task, so the
//! retry timer and the heartbeat are disarmed before the next event is
//! handled and can never fire into a later connection. The in-flight
//! connect and the retry deadline survive commands that leave the phase
//! unchanged, such as a repeated `start()`.
//!
//! # Usage
//!
//! ```ignore
//! use trustmirror_core::{ClientConfig, StateStore, Supervisor};
//! use trustmirror_env::{TokioContext, WsTransport};
//!
//! let handle = Supervisor::spawn(
//!     TokioContext::shared(),
//!     Arc::new(WsTransport::new()),
//!     StateStore::new(),
//!     ClientConfig::from_env()?,
//! );
//! handle.start();
//! // ... render from handle.store().snapshot() ...
//! handle.stop().await;
//! ```

use crate::config::{ClientConfig, ResyncPolicy};
use crate::connection::{Action, ConnectionState, Phase, Trigger};
use crate::heartbeat::HeartbeatMonitor;
use crate::model::Anomaly;
use crate::protocol::{self, UpdateEvent};
use crate::store::StateStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use trustmirror_env::{Connection, EnvError, MirrorContext, SessionId, Transport};

/// Connectivity as surfaced to the host (dashboard).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityStatus {
    pub phase: Phase,

    /// Retries since the last successful open
    pub reconnect_attempt: u32,

    /// True once the retry budget is exhausted, until the next `start()`
    pub terminal_failure: bool,

    /// Identifier of the open connection, if any
    pub session: Option<SessionId>,
}

impl ConnectivityStatus {
    fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            reconnect_attempt: 0,
            terminal_failure: false,
            session: None,
        }
    }
}

/// Counters shared between the supervisor and the host.
#[derive(Debug, Default)]
pub struct SyncStats {
    connect_attempts: AtomicU64,
    sessions_opened: AtomicU64,
    frames_received: AtomicU64,
    frames_applied: AtomicU64,
    frames_rejected: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_failed: AtomicU64,
}

impl SyncStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Transport `connect()` calls, including failures.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Successful opens.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    /// Successful opens after the first one.
    pub fn reconnects(&self) -> u64 {
        self.sessions_opened().saturating_sub(1)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Frames that changed the store.
    pub fn frames_applied(&self) -> u64 {
        self.frames_applied.load(Ordering::Relaxed)
    }

    /// Frames dropped by the decoder.
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    /// Heartbeats that were due but could not be written.
    pub fn heartbeats_failed(&self) -> u64 {
        self.heartbeats_failed.load(Ordering::Relaxed)
    }
}

enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Host-side handle: lifecycle hooks plus state accessors.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectivityStatus>,
    transitions: broadcast::Sender<ConnectivityStatus>,
    alerts: broadcast::Sender<Anomaly>,
    store: StateStore,
    stats: Arc<SyncStats>,
}

impl SupervisorHandle {
    /// Begins connecting. Ignored unless the supervisor is idle.
    ///
    /// Returns false if the supervisor task has exited.
    pub fn start(&self) -> bool {
        self.commands.send(Command::Start).is_ok()
    }

    /// Stops the connection and waits until the supervisor is idle.
    ///
    /// Cancels any pending retry, stops heartbeats and closes the transport.
    /// Safe to call repeatedly and from any phase.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Stop(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Stops the connection and ends the supervisor task.
    pub async fn shutdown(self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Current connectivity.
    pub fn status(&self) -> ConnectivityStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to the latest connectivity.
    ///
    /// A `watch` keeps only the newest value, so short-lived phases such as
    /// `Closing` may be skipped. Use [`Self::subscribe_transitions`] to see
    /// every change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.clone()
    }

    /// Subscribes to every connectivity change, in order.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectivityStatus> {
        self.transitions.subscribe()
    }

    /// Subscribes to anomaly alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Anomaly> {
        self.alerts.subscribe()
    }

    /// The store this supervisor writes to.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }
}

enum Step<C> {
    Command(Option<Command>),
    Connected(Result<C, EnvError>),
    Frame(Option<Result<String, EnvError>>),
    HeartbeatDue,
    RetryElapsed,
    CloseComplete,
}

type ConnectFuture<C> = Pin<Box<dyn Future<Output = Result<C, EnvError>> + Send>>;

/// Buffered status transitions per subscriber.
const TRANSITION_CAPACITY: usize = 64;

/// Owner of one connection's lifecycle.
///
/// Generic over the context and transport, so the same supervisor runs
/// against WebSockets in production and in-memory transports in simulation.
pub struct Supervisor<Ctx, T>
where
    Ctx: MirrorContext,
    T: Transport,
{
    ctx: Arc<Ctx>,
    transport: Arc<T>,
    config: ClientConfig,
    store: StateStore,

    state: ConnectionState,
    heartbeat: HeartbeatMonitor,

    /// In-flight `connect()`, present only in `Connecting`
    connecting: Option<ConnectFuture<T::Conn>>,

    /// Open connection, present only in `Open`
    conn: Option<T::Conn>,
    session: Option<SessionId>,

    /// Monotonic deadline of the pending retry, present only in `Backoff`
    retry_at: Option<Duration>,

    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectivityStatus>,
    transitions: broadcast::Sender<ConnectivityStatus>,
    alerts: broadcast::Sender<Anomaly>,
    stats: Arc<SyncStats>,
}

impl<Ctx, T> Supervisor<Ctx, T>
where
    Ctx: MirrorContext,
    T: Transport,
{
    /// Creates a supervisor and its handle. Call [`Supervisor::run`] to drive it.
    pub fn new(
        ctx: Arc<Ctx>,
        transport: Arc<T>,
        store: StateStore,
        config: ClientConfig,
    ) -> (Self, SupervisorHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectivityStatus::idle());
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (alerts, _) = broadcast::channel(config.alert_capacity.max(1));
        let stats = Arc::new(SyncStats::default());

        let handle = SupervisorHandle {
            commands: command_tx,
            status: status_rx,
            transitions: transitions.clone(),
            alerts: alerts.clone(),
            store: store.clone(),
            stats: Arc::clone(&stats),
        };

        let supervisor = Self {
            ctx,
            transport,
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval),
            config,
            store,
            state: ConnectionState::new(),
            connecting: None,
            conn: None,
            session: None,
            retry_at: None,
            commands,
            status_tx,
            transitions,
            alerts,
            stats,
        };
        (supervisor, handle)
    }

    /// Creates a supervisor and runs it on a task spawned by `ctx`.
    pub fn spawn(
        ctx: Arc<Ctx>,
        transport: Arc<T>,
        store: StateStore,
        config: ClientConfig,
    ) -> SupervisorHandle {
        let (supervisor, handle) = Self::new(Arc::clone(&ctx), transport, store, config);
        ctx.spawn("supervisor", supervisor.run());
        handle
    }

    /// Runs until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        debug!("supervisor for {} ready", self.config.endpoint);
        loop {
            let step = self.next_step().await;
            if !self.process(step).await {
                break;
            }
        }
        info!("supervisor for {} exited", self.config.endpoint);
    }

    /// Waits for whatever can happen in the current phase.
    async fn next_step(&mut self) -> Step<T::Conn> {
        match self.state.phase() {
            Phase::Idle => Step::Command(self.commands.recv().await),
            Phase::Connecting => {
                let transport = &self.transport;
                let endpoint = &self.config.endpoint;
                let connect = self
                    .connecting
                    .get_or_insert_with(|| Self::dial(transport, endpoint));
                tokio::select! {
                    biased;
                    cmd = self.commands.recv() => Step::Command(cmd),
                    result = connect => Step::Connected(result),
                }
            }
            Phase::Open => {
                let heartbeat_wait = self.heartbeat.time_until_due(self.ctx.now());
                let Some(conn) = self.conn.as_mut() else {
                    return Step::Frame(None);
                };
                tokio::select! {
                    biased;
                    cmd = self.commands.recv() => Step::Command(cmd),
                    _ = self.ctx.sleep(heartbeat_wait.unwrap_or_default()), if heartbeat_wait.is_some() => {
                        Step::HeartbeatDue
                    }
                    frame = conn.recv() => Step::Frame(frame),
                }
            }
            Phase::Backoff => {
                let delay = self
                    .retry_at
                    .map(|at| at.saturating_sub(self.ctx.now()))
                    .unwrap_or_default();
                tokio::select! {
                    biased;
                    cmd = self.commands.recv() => Step::Command(cmd),
                    _ = self.ctx.sleep(delay) => Step::RetryElapsed,
                }
            }
            Phase::Closing => Step::CloseComplete,
        }
    }

    /// Starts a connect that owns everything it needs, so it can be polled
    /// across loop passes.
    fn dial(transport: &Arc<T>, endpoint: &str) -> ConnectFuture<T::Conn> {
        let transport = Arc::clone(transport);
        let endpoint = endpoint.to_string();
        Box::pin(async move { transport.connect(&endpoint).await })
    }

    /// Handles one step. Returns false when the supervisor should exit.
    async fn process(&mut self, step: Step<T::Conn>) -> bool {
        match step {
            Step::Command(Some(Command::Start)) => self.fire(Trigger::Start).await,
            Step::Command(Some(Command::Stop(ack))) => {
                self.fire(Trigger::Stop).await;
                let _ = ack.send(());
            }
            Step::Command(Some(Command::Shutdown(ack))) => {
                self.fire(Trigger::Stop).await;
                let _ = ack.send(());
                return false;
            }
            Step::Command(None) => {
                // Every handle is gone; nobody can observe or restart us
                self.fire(Trigger::Stop).await;
                return false;
            }
            Step::Connected(Ok(conn)) => {
                self.connecting = None;
                self.conn = Some(conn);
                self.session = Some(self.ctx.derive_session_id(self.stats.sessions_opened()));
                SyncStats::bump(&self.stats.sessions_opened);
                self.fire(Trigger::Opened).await;
            }
            Step::Connected(Err(e)) if e.is_transient() => {
                self.connecting = None;
                warn!("connect to {} failed: {}", self.config.endpoint, e);
                self.fire(Trigger::ConnectFailed).await;
            }
            Step::Connected(Err(e)) => {
                self.connecting = None;
                error!("connect to {} rejected: {}", self.config.endpoint, e);
                self.fire(Trigger::ConnectRejected).await;
            }
            Step::Frame(Some(Ok(frame))) => self.dispatch(&frame),
            Step::Frame(Some(Err(e))) => {
                warn!("connection {} failed: {}", self.session_label(), e);
                self.release_connection().await;
                self.fire(Trigger::Closed).await;
            }
            Step::Frame(None) => {
                info!("connection {} closed by peer", self.session_label());
                self.release_connection().await;
                self.fire(Trigger::Closed).await;
            }
            Step::HeartbeatDue => {
                let now = self.ctx.now();
                let timestamp = self.ctx.unix_millis();
                if let Some(conn) = self.conn.as_mut() {
                    self.heartbeat.emit(conn, now, timestamp).await;
                    self.stats
                        .heartbeats_sent
                        .store(self.heartbeat.probes_sent(), Ordering::Relaxed);
                    self.stats
                        .heartbeats_failed
                        .store(self.heartbeat.probes_failed(), Ordering::Relaxed);
                }
            }
            Step::RetryElapsed => {
                self.retry_at = None;
                self.fire(Trigger::RetryElapsed).await;
            }
            Step::CloseComplete => self.fire(Trigger::CloseComplete).await,
        }
        true
    }

    /// Feeds a trigger through the state machine and performs its actions.
    async fn fire(&mut self, trigger: Trigger) {
        let reopening = trigger == Trigger::Opened && self.state.last_opened_at().is_some();
        let actions = self.state.handle(
            trigger,
            &self.config.backoff,
            self.ctx.random_unit(),
            self.ctx.now(),
        );
        for action in actions {
            self.execute(action).await;
        }
        if self.state.phase() != Phase::Connecting {
            self.connecting = None;
        }

        if reopening && self.state.phase() == Phase::Open {
            self.resync();
        }
        self.publish_status();

        if self.state.phase() == Phase::Closing {
            // The transport was closed by CloseTransport above
            self.state.handle(
                Trigger::CloseComplete,
                &self.config.backoff,
                0.0,
                self.ctx.now(),
            );
            self.publish_status();
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::OpenTransport => {
                SyncStats::bump(&self.stats.connect_attempts);
                info!(
                    "connecting to {} (retry {})",
                    self.config.endpoint,
                    self.state.reconnect_attempt()
                );
            }
            Action::StartHeartbeat => {
                info!("connection {} open", self.session_label());
                self.heartbeat.start(self.ctx.now());
            }
            Action::StopHeartbeat => self.heartbeat.stop(),
            Action::ScheduleRetry(delay) => {
                info!(
                    "reconnecting in {:.2}s (retry {}/{})",
                    delay.as_secs_f64(),
                    self.state.reconnect_attempt() + 1,
                    self.config.backoff.max_attempts
                );
                self.retry_at = Some(self.ctx.now() + delay);
            }
            Action::CancelRetry => self.retry_at = None,
            Action::CloseTransport => self.release_connection().await,
            Action::SurfaceFatal { attempts } => {
                error!(
                    "giving up on {} after {} reconnect attempts",
                    self.config.endpoint, attempts
                );
            }
        }
    }

    /// Decodes one frame and routes it. Never fails the connection.
    fn dispatch(&mut self, frame: &str) {
        SyncStats::bump(&self.stats.frames_received);
        match protocol::decode(frame) {
            Ok(UpdateEvent::Heartbeat) => debug!("server heartbeat"),
            Ok(UpdateEvent::AnomalyAlert(anomaly)) => {
                info!("anomaly {} ({:?}): {}", anomaly.id, anomaly.severity, anomaly.description);
                // No subscribers is fine
                let _ = self.alerts.send(anomaly);
            }
            Ok(event) => {
                if self.store.apply(&event) {
                    SyncStats::bump(&self.stats.frames_applied);
                }
            }
            Err(e) => {
                SyncStats::bump(&self.stats.frames_rejected);
                warn!("dropping frame on {}: {}", self.session_label(), e);
            }
        }
    }

    fn resync(&self) {
        match self.config.resync {
            ResyncPolicy::ClearOnReconnect => {
                info!("reconnected; clearing mirrored collections until bulk resync");
                self.store.clear_collections();
            }
            ResyncPolicy::RetainUntilBulk => {
                debug!("reconnected; retaining collections until bulk resync");
            }
        }
    }

    /// Closes and forgets the current connection, if any.
    async fn release_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!("close of {} failed: {}", self.session_label(), e);
            }
        }
        self.session = None;
    }

    fn publish_status(&self) {
        let next = ConnectivityStatus {
            phase: self.state.phase(),
            reconnect_attempt: self.state.reconnect_attempt(),
            terminal_failure: self.state.terminal_failure(),
            session: self.session,
        };
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!("connectivity: {} -> {}", current.phase, next.phase);
                *current = next.clone();
                true
            }
        });
        if changed {
            // No subscribers is fine
            let _ = self.transitions.send(next);
        }
    }

    fn session_label(&self) -> String {
        self.session
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use async_trait::async_trait;
    use trustmirror_env::{Admission, MemoryConnection, MemoryTransport, TokioContext, WsTransport};

    const BULK: &str = r#"{"type":"agent_update","timestamp":1,"data":[
        {"id":"a1","position":[0,0,0],"trustScore":80,"status":"active"},
        {"id":"a2","position":[1,0,0],"trustScore":60,"status":"inactive"}
    ]}"#;

    fn config(max_attempts: u32) -> ClientConfig {
        ClientConfig::default()
            .with_endpoint("mem://sim")
            .with_backoff(BackoffPolicy {
                max_attempts,
                ..Default::default()
            })
    }

    fn spawn(transport: &MemoryTransport, config: ClientConfig) -> (Arc<TokioContext>, SupervisorHandle) {
        let ctx = TokioContext::shared();
        let handle = Supervisor::spawn(
            Arc::clone(&ctx),
            Arc::new(transport.clone()),
            StateStore::new(),
            config,
        );
        (ctx, handle)
    }

    async fn wait_status<F>(handle: &SupervisorHandle, predicate: F) -> ConnectivityStatus
    where
        F: FnMut(&ConnectivityStatus) -> bool,
    {
        let mut rx = handle.subscribe_status();
        let status = rx.wait_for(predicate).await.expect("supervisor alive").clone();
        status
    }

    async fn wait_revision(handle: &SupervisorHandle, revision: u64) {
        let mut rx = handle.store().subscribe();
        rx.wait_for(|s| s.revision >= revision).await.expect("store alive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_then_delta_over_the_wire() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));

        handle.start();
        wait_status(&handle, |s| s.phase == Phase::Open).await;
        let peer = transport.take_peer().unwrap();

        peer.send(BULK);
        peer.send(r#"{"type":"agent_update","timestamp":2,"data":{"id":"a1","trustScore":42}}"#);
        wait_revision(&handle, 2).await;

        let snapshot = handle.store().snapshot();
        assert_eq!(snapshot.agents.len(), 2);
        assert_eq!(snapshot.agent("a1").unwrap().trust_score, 42.0);
        assert_eq!(handle.stats().frames_applied(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_errors_keep_connection_open() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));

        handle.start();
        wait_status(&handle, |s| s.phase == Phase::Open).await;
        let peer = transport.take_peer().unwrap();

        peer.send("{definitely not json");
        peer.send(r#"{"type":"agent_update","timestamp":1,"data":"oops"}"#);
        peer.send(r#"{"type":"heartbeat","timestamp":1}"#);
        peer.send(BULK);
        wait_revision(&handle, 1).await;

        assert_eq!(handle.stats().frames_received(), 4);
        assert_eq!(handle.stats().frames_rejected(), 2);
        assert_eq!(handle.status().phase, Phase::Open);
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects_after_backoff() {
        let transport = MemoryTransport::new();
        let (ctx, handle) = spawn(&transport, config(10));

        handle.start();
        let first = wait_status(&handle, |s| s.phase == Phase::Open).await.session;
        transport.refuse_next(3);

        let dropped_at = ctx.now();
        transport.take_peer().unwrap().disconnect();
        let reopened = wait_status(&handle, |s| s.phase == Phase::Open && s.session != first).await;
        let elapsed = ctx.now() - dropped_at;

        // Delays for retries 0..=3: 1 + 2 + 4 + 8 seconds, plus at most 10% jitter
        assert!(elapsed >= Duration::from_secs(15), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(16_500), "elapsed {:?}", elapsed);
        assert_eq!(reopened.reconnect_attempt, 0);
        assert_eq!(transport.connect_attempts(), 5);
        assert_eq!(handle.stats().reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_treated_like_close() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));

        handle.start();
        let first = wait_status(&handle, |s| s.phase == Phase::Open).await.session;
        transport.take_peer().unwrap().fail("connection reset");

        wait_status(&handle, |s| s.phase == Phase::Open && s.session != first).await;
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_is_terminal() {
        let transport = MemoryTransport::refusing();
        let (_ctx, handle) = spawn(&transport, config(3));

        handle.start();
        let status = wait_status(&handle, |s| s.terminal_failure).await;
        assert_eq!(status.phase, Phase::Idle);
        // Initial attempt plus three retries
        assert_eq!(transport.connect_attempts(), 4);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.connect_attempts(), 4);

        // Only an explicit start() tries again
        transport.set_default_admission(Admission::Accept);
        handle.start();
        let status = wait_status(&handle, |s| s.phase == Phase::Open).await;
        assert!(!status.terminal_failure);
        assert_eq!(transport.connect_attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_cancels_retry() {
        let transport = MemoryTransport::refusing();
        let (_ctx, handle) = spawn(&transport, config(10));

        handle.start();
        wait_status(&handle, |s| s.phase == Phase::Backoff).await;
        handle.stop().await;

        assert_eq!(handle.status().phase, Phase::Idle);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.connect_attempts(), 1);
        assert!(!handle.status().terminal_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_closes_transport() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));

        handle.start();
        wait_status(&handle, |s| s.phase == Phase::Open).await;
        let mut peer = transport.take_peer().unwrap();

        handle.stop().await;
        handle.stop().await;

        assert_eq!(handle.status().phase, Phase::Idle);
        assert!(!peer.is_client_open());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(peer.drain().is_empty(), "no heartbeat after stop");
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_idle_is_noop() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));

        handle.stop().await;
        assert_eq!(handle.status(), ConnectivityStatus::idle());
        assert_eq!(transport.connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_only_while_open() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));

        handle.start();
        wait_status(&handle, |s| s.phase == Phase::Open).await;
        let mut peer = transport.take_peer().unwrap();

        tokio::time::sleep(Duration::from_secs(95)).await;
        let probes = peer.drain();
        assert_eq!(probes.len(), 3);
        for probe in &probes {
            assert_eq!(protocol::decode(probe).unwrap(), UpdateEvent::Heartbeat);
        }

        transport.set_default_admission(Admission::Refuse);
        peer.disconnect();
        wait_status(&handle, |s| s.phase == Phase::Backoff).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.stats().heartbeats_sent(), 3);
        assert_eq!(handle.stats().heartbeats_failed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anomaly_alerts_are_forwarded_not_stored() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));
        let mut alerts = handle.subscribe_alerts();

        handle.start();
        wait_status(&handle, |s| s.phase == Phase::Open).await;
        let peer = transport.take_peer().unwrap();
        peer.send(
            r#"{"type":"anomaly_alert","timestamp":3,"data":{"id":"x1","type":"sybil","severity":"critical","position":[1,1,1],"description":"burst"}}"#,
        );

        let anomaly = alerts.recv().await.unwrap();
        assert_eq!(anomaly.id, "x1");
        assert_eq!(handle.store().snapshot().revision, 0);
    }

    async fn reconnect_with_bulk(handle: &SupervisorHandle, transport: &MemoryTransport) {
        handle.start();
        let first = wait_status(handle, |s| s.phase == Phase::Open).await.session;
        let peer = transport.take_peer().unwrap();
        peer.send(BULK);
        wait_revision(handle, 1).await;

        peer.disconnect();
        wait_status(handle, |s| s.phase == Phase::Open && s.session != first).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_clears_collections_by_default() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));

        reconnect_with_bulk(&handle, &transport).await;

        let snapshot = handle.store().snapshot();
        assert!(snapshot.agents.is_empty());
        assert!(snapshot.trust_scores.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retain_policy_keeps_collections() {
        let transport = MemoryTransport::new();
        let config = config(10).with_resync(ResyncPolicy::RetainUntilBulk);
        let (_ctx, handle) = spawn(&transport, config);

        reconnect_with_bulk(&handle, &transport).await;

        assert_eq!(handle.store().snapshot().agents.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_keeps_retry_deadline() {
        let transport = MemoryTransport::refusing();
        let config = ClientConfig::default()
            .with_endpoint("mem://sim")
            .with_backoff(BackoffPolicy {
                jitter_ratio: 0.0,
                ..Default::default()
            });
        let (_ctx, handle) = spawn(&transport, config);

        handle.start();
        wait_status(&handle, |s| s.phase == Phase::Backoff).await;

        // Retries are due at 1s, 3s and 7s
        for _ in 0..16 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert!(handle.start());
        }
        assert_eq!(transport.connect_attempts(), 4);
        assert_eq!(handle.stats().connect_attempts(), 4);
        assert_eq!(handle.status().reconnect_attempt, 3);
    }

    /// Memory transport whose handshake takes `latency`.
    #[derive(Clone)]
    struct SlowTransport {
        inner: MemoryTransport,
        latency: Duration,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        type Conn = MemoryConnection;

        async fn connect(&self, endpoint: &str) -> Result<MemoryConnection, EnvError> {
            tokio::time::sleep(self.latency).await;
            self.inner.connect(endpoint).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_keeps_connect_in_flight() {
        let transport = SlowTransport {
            inner: MemoryTransport::new(),
            latency: Duration::from_secs(5),
        };
        let ctx = TokioContext::shared();
        let handle = Supervisor::spawn(
            Arc::clone(&ctx),
            Arc::new(transport.clone()),
            StateStore::new(),
            config(10),
        );
        let began = ctx.now();

        handle.start();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.start();
        }
        wait_status(&handle, |s| s.phase == Phase::Open).await;
        let elapsed = ctx.now() - began;

        assert!(elapsed >= Duration::from_secs(5), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "elapsed {:?}", elapsed);
        assert_eq!(transport.inner.connect_attempts(), 1);
        assert_eq!(handle.stats().connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_connect_in_flight() {
        let transport = SlowTransport {
            inner: MemoryTransport::new(),
            latency: Duration::from_secs(5),
        };
        let ctx = TokioContext::shared();
        let handle = Supervisor::spawn(
            Arc::clone(&ctx),
            Arc::new(transport.clone()),
            StateStore::new(),
            config(10),
        );

        handle.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.status().phase, Phase::Idle);
        assert_eq!(transport.inner.connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_endpoint_fails_without_backoff() {
        let ctx = TokioContext::shared();
        let handle = Supervisor::spawn(
            Arc::clone(&ctx),
            Arc::new(WsTransport::new()),
            StateStore::new(),
            config(10).with_endpoint("wss://mirror.example"),
        );
        let began = ctx.now();

        handle.start();
        let status = wait_status(&handle, |s| s.terminal_failure).await;

        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.reconnect_attempt, 0);
        assert_eq!(handle.stats().connect_attempts(), 1);
        assert_eq!(ctx.now(), began);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.stats().connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_include_closing() {
        let transport = MemoryTransport::new();
        let (_ctx, handle) = spawn(&transport, config(10));
        let mut transitions = handle.subscribe_transitions();

        handle.start();
        wait_status(&handle, |s| s.phase == Phase::Open).await;
        handle.stop().await;

        let mut phases = Vec::new();
        while let Ok(status) = transitions.try_recv() {
            phases.push(status.phase);
        }
        assert_eq!(
            phases,
            vec![Phase::Connecting, Phase::Open, Phase::Closing, Phase::Idle]
        );
        assert_eq!(handle.subscribe_status().borrow().phase, Phase::Idle);
    }
}
