//! Scenario runner - executes chaos engineering test scenarios.
//!
//! Every scenario runs the production `Supervisor` inside a current-thread
//! Tokio runtime with a paused clock. The harness plays the server side:
//! it accepts connections, sends the Oracle's bulk resync on each one,
//! streams deltas every tick and injects faults on the scenario's script.

use crate::context::SimContext;
use crate::network::{SimNetworkController, SimTransport};
use crate::oracle::Oracle;
use crate::scenarios::ScenarioId;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use trustmirror_core::backoff::BackoffPolicy;
use trustmirror_core::model::Anomaly;
use trustmirror_core::protocol::{self, UpdateEvent};
use trustmirror_core::quality::{QualityConfig, QualityController, QualityTier};
use trustmirror_core::{ClientConfig, ConnectivityStatus, Phase, StateStore, Supervisor, SupervisorHandle};
use trustmirror_env::{MemoryPeer, MirrorContext, SessionId};

const SIM_ENDPOINT: &str = "mem://trust-sim";

/// Idle time granted for in-flight frames before comparing with ground truth
const SETTLE_SECS: f64 = 5.0;

const NETWORK_SALT: u64 = 0x6e65_7477_6f72_6b00;
const CHAOS_SALT: u64 = 0x6368_616f_7300_0000;

/// Frames the decoder must reject.
const GARBAGE: &[&str] = &[
    "{\"type\":\"agent_update\",\"data\":",
    "not json at all",
    r#"{"data":[],"timestamp":1}"#,
    r#"{"type":"agent_update","timestamp":1,"data":{"trustScore":10}}"#,
    r#"{"type":"trust_update","timestamp":1,"data":{"id":"ts-x","value":250}}"#,
    r#"{"type":"simulation_update","timestamp":1,"data":"running"}"#,
    r#"{"type":"agent_update","timestamp":"yesterday","data":[]}"#,
    r#"[{"type":"heartbeat"}]"#,
];

/// Simulation failures.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Failed to build simulation runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Mirror diverged from ground truth: {0}")]
    Diverged(String),

    #[error("{0}")]
    Assertion(String),
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), SimError> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Assertion(message()))
    }
}

fn converged(divergence: Option<String>) -> Result<(), SimError> {
    match divergence {
        None => Ok(()),
        Some(reason) => Err(SimError::Diverged(reason)),
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total harness ticks executed
    pub total_ticks: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Number of ground truth agents at end
    pub final_agent_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Frames the server delivered, garbage included
    pub frames_sent: u64,

    /// Malformed frames injected
    pub garbage_sent: u64,

    /// Frames the client read / applied / rejected
    pub frames_received: u64,
    pub frames_applied: u64,
    pub frames_rejected: u64,

    /// Probes sent by the client and seen by the server
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub heartbeats_failed: u64,

    /// Connection attempts seen by the network, and how many were refused
    pub connect_attempts: u64,
    pub refused: u64,

    pub sessions_opened: u64,

    /// Session open when counters were last collected
    pub last_session: Option<SessionId>,

    /// Connections dropped by the server
    pub server_drops: u64,

    pub alerts_sent: u64,
    pub alerts_received: u64,
    pub alerts_lagged: u64,

    /// Closed quality windows and the last tier emitted
    pub quality_windows: u64,
    pub final_tier: Option<QualityTier>,
}

/// Server side of one scenario.
struct Harness {
    ctx: Arc<SimContext>,
    transport: SimTransport,
    handle: SupervisorHandle,
    alerts: broadcast::Receiver<Anomaly>,
    oracle: Oracle,

    /// Server side of the open connection
    peer: Option<MemoryPeer>,

    chaos_rng: ChaCha8Rng,

    /// Probability per tick of injecting a malformed frame
    garbage_rate: f64,

    dt: Duration,
    ticks: u64,
    metrics: ScenarioMetrics,
}

impl Harness {
    /// Must be called inside the simulation runtime.
    fn new(seed: u64, num_agents: usize, dt: Duration, config: ClientConfig) -> Self {
        let ctx = SimContext::shared(seed);
        let transport = SimTransport::new(SimNetworkController::new(seed ^ NETWORK_SALT));
        let handle = Supervisor::spawn(
            Arc::clone(&ctx),
            Arc::new(transport.clone()),
            StateStore::new(),
            config,
        );
        let alerts = handle.subscribe_alerts();

        // Physics seed is decoupled from the network seed
        let physics_seed = seed.wrapping_mul(0x9e3779b97f4a7c15);

        Self {
            ctx,
            transport,
            handle,
            alerts,
            oracle: Oracle::with_population(physics_seed, num_agents),
            peer: None,
            chaos_rng: ChaCha8Rng::seed_from_u64(seed ^ CHAOS_SALT),
            garbage_rate: 0.0,
            dt,
            ticks: 0,
            metrics: ScenarioMetrics::default(),
        }
    }

    fn controller(&self) -> &SimNetworkController {
        self.transport.controller()
    }

    fn status(&self) -> ConnectivityStatus {
        self.handle.status()
    }

    fn start(&self) {
        self.handle.start();
    }

    fn ticks_in(&self, secs: f64) -> u64 {
        (secs / self.dt.as_secs_f64()).round().max(0.0) as u64
    }

    /// One tick with the world evolving.
    async fn tick(&mut self) {
        self.advance(true).await;
    }

    /// One tick with the world frozen.
    async fn idle_tick(&mut self) {
        self.advance(false).await;
    }

    async fn advance(&mut self, evolve: bool) {
        // Yields to the supervisor; virtual time moves only here
        tokio::time::sleep(self.dt).await;
        self.ticks += 1;

        self.accept_connections();
        if evolve {
            let events = self.oracle.step(self.dt.as_secs_f64());
            self.push(events);
        }
        if self.garbage_rate > 0.0 && self.chaos_rng.gen::<f64>() < self.garbage_rate {
            self.inject_garbage();
        }
        self.collect();
    }

    async fn run_for(&mut self, secs: f64) {
        for _ in 0..self.ticks_in(secs) {
            self.tick().await;
        }
    }

    /// Ticks until `predicate` holds. Returns false on timeout.
    async fn run_until<F>(&mut self, max_secs: f64, mut predicate: F) -> bool
    where
        F: FnMut(&ConnectivityStatus) -> bool,
    {
        for _ in 0..self.ticks_in(max_secs) {
            if predicate(&self.status()) {
                return true;
            }
            self.tick().await;
        }
        predicate(&self.status())
    }

    /// Adopts newly accepted connections and resyncs each one.
    fn accept_connections(&mut self) {
        while let Some(peer) = self.transport.accept() {
            self.collect();
            if let Some(old) = self.peer.replace(peer) {
                old.disconnect();
            }
            debug!("server accepted connection at t={:.1}s", self.oracle.time());
            let resync = self.oracle.resync_events();
            self.push(resync);
        }
    }

    fn push(&mut self, events: Vec<UpdateEvent>) {
        let timestamp = self.oracle.time_ms();
        for event in events {
            let is_alert = matches!(event, UpdateEvent::AnomalyAlert(_));
            match protocol::encode(&event, timestamp) {
                Ok(frame) => {
                    if self.send(frame) && is_alert {
                        self.metrics.alerts_sent += 1;
                    }
                }
                Err(e) => warn!("failed to encode {}: {}", event.kind(), e),
            }
        }
    }

    fn send(&mut self, frame: String) -> bool {
        let delivered = self.peer.as_ref().map(|peer| peer.send(frame)).unwrap_or(false);
        if delivered {
            self.metrics.frames_sent += 1;
        } else {
            // Client side is gone
            self.peer = None;
        }
        delivered
    }

    fn inject_garbage(&mut self) {
        let frame = GARBAGE[self.chaos_rng.gen_range(0..GARBAGE.len())];
        if self.send(frame.to_string()) {
            self.metrics.garbage_sent += 1;
        }
    }

    /// Reads client probes and forwarded alerts.
    fn collect(&mut self) {
        if let Some(peer) = self.peer.as_mut() {
            for frame in peer.drain() {
                if matches!(protocol::decode(&frame), Ok(UpdateEvent::Heartbeat)) {
                    self.metrics.heartbeats_received += 1;
                }
            }
        }
        loop {
            match self.alerts.try_recv() {
                Ok(_) => self.metrics.alerts_received += 1,
                Err(TryRecvError::Lagged(missed)) => self.metrics.alerts_lagged += missed,
                Err(_) => break,
            }
        }
    }

    /// Server-side close of the open connection.
    fn drop_connection(&mut self) -> bool {
        self.collect();
        match self.peer.take() {
            Some(peer) => {
                peer.disconnect();
                self.metrics.server_drops += 1;
                true
            }
            None => false,
        }
    }

    fn partition(&mut self) {
        self.controller().partition();
        self.drop_connection();
    }

    fn heal(&self) {
        self.controller().heal();
    }

    /// Drops the connection and waits for a fresh session.
    async fn force_resync(&mut self, max_secs: f64) -> bool {
        let before = self.status().session;
        self.drop_connection();
        self.run_until(max_secs, |s| s.phase == Phase::Open && s.session.is_some() && s.session != before)
            .await
    }

    /// Lets in-flight frames drain, then compares the mirror with ground truth.
    async fn settle(&mut self) -> Option<String> {
        for _ in 0..self.ticks_in(SETTLE_SECS) {
            self.idle_tick().await;
        }
        self.finish();
        self.oracle.divergence(&self.handle.store().snapshot())
    }

    /// Copies client and network counters into the metrics.
    fn finish(&mut self) {
        let stats = self.handle.stats();
        self.metrics.frames_received = stats.frames_received();
        self.metrics.frames_applied = stats.frames_applied();
        self.metrics.frames_rejected = stats.frames_rejected();
        self.metrics.heartbeats_sent = stats.heartbeats_sent();
        self.metrics.heartbeats_failed = stats.heartbeats_failed();
        self.metrics.sessions_opened = stats.sessions_opened();
        if let Some(session) = self.status().session {
            self.metrics.last_session = Some(session);
        }
        self.metrics.connect_attempts = self.controller().connect_attempts();
        self.metrics.refused = self.controller().refused();
    }
}

/// Runs chaos scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of simulated agents
    num_agents: usize,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Duration of the scenario's main phase in seconds
    max_duration_secs: f64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_agents: usize) -> Self {
        Self {
            seed,
            num_agents,
            tick_rate_hz: 10,
            max_duration_secs: 120.0,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the main-phase duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs.max(0.0);
        self
    }

    fn tick(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz))
    }

    fn client_config(&self, scenario: ScenarioId) -> ClientConfig {
        let max_attempts = match scenario {
            ScenarioId::RetryExhaustion => 4,
            ScenarioId::ChaosStorm => 50,
            _ => BackoffPolicy::default().max_attempts,
        };
        ClientConfig::default()
            .with_endpoint(SIM_ENDPOINT)
            .with_backoff(BackoffPolicy {
                max_attempts,
                ..Default::default()
            })
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        if scenario.is_extreme() {
            warn!("🔥 EXTREME SCENARIO - Pushing to the limit!");
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build();

        match runtime {
            Ok(runtime) => runtime.block_on(self.run_in_sim(scenario)),
            Err(e) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                total_ticks: 0,
                final_time_secs: 0.0,
                final_agent_count: 0,
                failure_reason: Some(SimError::from(e).to_string()),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    async fn run_in_sim(&self, scenario: ScenarioId) -> ScenarioResult {
        let mut h = Harness::new(self.seed, self.num_agents, self.tick(), self.client_config(scenario));

        let outcome = match scenario {
            ScenarioId::CleanSync => self.run_clean_sync(&mut h).await,
            ScenarioId::FlakyStartup => self.run_flaky_startup(&mut h).await,
            ScenarioId::MidStreamDrop => self.run_mid_stream_drop(&mut h).await,
            ScenarioId::Partition => self.run_partition(&mut h).await,
            ScenarioId::RetryExhaustion => self.run_retry_exhaustion(&mut h).await,
            ScenarioId::StopDuringBackoff => self.run_stop_during_backoff(&mut h).await,
            ScenarioId::GarbageFrames => self.run_garbage_frames(&mut h).await,
            ScenarioId::StaleEntities => self.run_stale_entities(&mut h).await,
            ScenarioId::FrameStutter => self.run_frame_stutter(&mut h).await,
            ScenarioId::ChaosStorm => self.run_chaos_storm(&mut h).await,
        };
        h.finish();

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            total_ticks: h.ticks,
            final_time_secs: h.ctx.now().as_secs_f64(),
            final_agent_count: h.oracle.agent_count(),
            failure_reason: outcome.err().map(|e| e.to_string()),
            metrics: h.metrics.clone(),
        };
        h.handle.clone().shutdown().await;
        result
    }

    /// DST-001: CleanSync - healthy network.
    ///
    /// **Assertion**: mirror equals ground truth, one session, a heartbeat
    /// every 30s, every alert forwarded.
    async fn run_clean_sync(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-001: CleanSync");
        h.start();
        h.run_for(self.max_duration_secs).await;
        converged(h.settle().await)?;

        let m = &h.metrics;
        ensure(m.sessions_opened == 1, || format!("{} sessions opened", m.sessions_opened))?;
        ensure(m.frames_rejected == 0, || format!("{} frames rejected", m.frames_rejected))?;
        ensure(m.frames_received == m.frames_sent, || {
            format!("client read {} of {} frames", m.frames_received, m.frames_sent)
        })?;
        let expected_probes = (h.ctx.now().as_secs_f64() / 30.0).floor() as u64;
        ensure(m.heartbeats_sent + 1 >= expected_probes, || {
            format!("{} heartbeats, expected ~{}", m.heartbeats_sent, expected_probes)
        })?;
        ensure(m.heartbeats_received == m.heartbeats_sent, || {
            format!("server saw {} of {} heartbeats", m.heartbeats_received, m.heartbeats_sent)
        })?;
        ensure(m.alerts_received == m.alerts_sent, || {
            format!("{} of {} alerts forwarded", m.alerts_received, m.alerts_sent)
        })
    }

    /// DST-002: FlakyStartup - the first four connects are refused.
    async fn run_flaky_startup(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-002: FlakyStartup");
        h.controller().refuse_next(4);
        h.start();

        let opened = h.run_until(self.max_duration_secs.max(30.0), |s| s.phase == Phase::Open).await;
        ensure(opened, || "never connected".to_string())?;
        // Retries 0..=3 wait 1 + 2 + 4 + 8 seconds before jitter
        let open_at = h.ctx.now();
        ensure(open_at >= Duration::from_secs(15), || format!("opened too early: {:?}", open_at))?;
        ensure(open_at <= Duration::from_millis(16_500 + 200), || format!("opened too late: {:?}", open_at))?;

        h.run_for(10.0).await;
        converged(h.settle().await)?;
        ensure(h.metrics.connect_attempts == 5, || format!("{} attempts", h.metrics.connect_attempts))?;
        ensure(h.status().reconnect_attempt == 0, || "attempt counter not reset".to_string())
    }

    /// DST-003: MidStreamDrop - the server closes the connection every 15s.
    async fn run_mid_stream_drop(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-003: MidStreamDrop");
        h.start();

        let rounds = (self.max_duration_secs.max(45.0) / 15.0) as u32;
        for round in 0..rounds {
            h.run_for(14.0).await;
            let reconnected = h.force_resync(10.0).await;
            ensure(reconnected, || format!("no reconnect after drop {}", round + 1))?;
        }
        converged(h.settle().await)?;

        let m = &h.metrics;
        ensure(m.sessions_opened == m.server_drops + 1, || {
            format!("{} sessions for {} drops", m.sessions_opened, m.server_drops)
        })?;
        ensure(m.frames_rejected == 0, || format!("{} frames rejected", m.frames_rejected))
    }

    /// DST-004: Partition - 20s without connectivity.
    ///
    /// **Assertion**: never Open and no heartbeat while partitioned; the
    /// mirror converges after heal.
    async fn run_partition(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-004: Partition");
        h.start();
        h.run_for(10.0).await;

        let before = h.status().session;
        let probes_before = h.handle.stats().heartbeats_sent();
        h.partition();
        for _ in 0..h.ticks_in(20.0) {
            h.tick().await;
            ensure(h.status().phase != Phase::Open, || "open during partition".to_string())?;
        }
        let probes_after = h.handle.stats().heartbeats_sent();
        ensure(probes_after == probes_before, || {
            format!("{} heartbeats while partitioned", probes_after - probes_before)
        })?;

        h.heal();
        let reopened = h
            .run_until(60.0, |s| s.phase == Phase::Open && s.session != before)
            .await;
        ensure(reopened, || "no reconnect after heal".to_string())?;
        h.run_for(10.0).await;
        converged(h.settle().await)?;
        ensure(h.metrics.sessions_opened == 2, || format!("{} sessions", h.metrics.sessions_opened))
    }

    /// DST-005: RetryExhaustion - the retry budget (4) runs out.
    ///
    /// **Assertion**: terminal Idle after 5 attempts, nothing more until
    /// `start()`, which recovers once the network heals.
    async fn run_retry_exhaustion(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-005: RetryExhaustion");
        h.partition();
        h.start();

        let terminal = h.run_until(60.0, |s| s.terminal_failure).await;
        ensure(terminal, || format!("not terminal: {:?}", h.status()))?;
        ensure(h.status().phase == Phase::Idle, || "terminal but not idle".to_string())?;
        let attempts = h.controller().connect_attempts();
        ensure(attempts == 5, || format!("{} attempts, expected 5", attempts))?;

        h.heal();
        h.run_for(60.0).await;
        let later = h.controller().connect_attempts();
        ensure(later == attempts, || format!("{} attempts after terminal failure", later - attempts))?;

        h.start();
        let opened = h.run_until(10.0, |s| s.phase == Phase::Open).await;
        ensure(opened, || "start() did not recover".to_string())?;
        ensure(!h.status().terminal_failure, || "terminal flag not cleared".to_string())?;
        converged(h.settle().await)
    }

    /// DST-006: StopDuringBackoff - `stop()` cancels the pending retry.
    async fn run_stop_during_backoff(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-006: StopDuringBackoff");
        h.partition();
        h.start();

        let backing_off = h.run_until(10.0, |s| s.phase == Phase::Backoff).await;
        ensure(backing_off, || "never entered backoff".to_string())?;
        h.handle.stop().await;
        h.handle.stop().await;
        ensure(h.status().phase == Phase::Idle, || format!("{:?} after stop", h.status().phase))?;

        let attempts = h.controller().connect_attempts();
        h.heal();
        h.run_for(60.0).await;
        let later = h.controller().connect_attempts();
        ensure(later == attempts, || format!("{} attempts after stop", later - attempts))?;
        ensure(!h.status().terminal_failure, || "stop reported as terminal".to_string())?;

        h.start();
        let opened = h.run_until(10.0, |s| s.phase == Phase::Open).await;
        ensure(opened, || "no restart after stop".to_string())?;
        converged(h.settle().await)
    }

    /// DST-007: GarbageFrames - 10% malformed frames.
    async fn run_garbage_frames(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-007: GarbageFrames");
        h.garbage_rate = 0.1;
        h.start();
        h.run_for(self.max_duration_secs).await;
        converged(h.settle().await)?;

        let m = &h.metrics;
        ensure(m.garbage_sent > 0, || "no garbage injected".to_string())?;
        ensure(m.frames_rejected == m.garbage_sent, || {
            format!("{} rejected, {} garbage sent", m.frames_rejected, m.garbage_sent)
        })?;
        ensure(m.sessions_opened == 1, || format!("{} sessions opened", m.sessions_opened))
    }

    /// DST-008: StaleEntities - agents removed while the client is away.
    async fn run_stale_entities(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-008: StaleEntities");
        h.start();
        h.run_for(10.0).await;

        let before = h.status().session;
        h.partition();
        h.run_for(5.0).await;
        let removed: Vec<String> = (0..3).filter_map(|_| h.oracle.remove_oldest_agent()).collect();
        h.oracle.spawn_random_agent();
        h.oracle.spawn_random_agent();
        h.run_for(5.0).await;

        h.heal();
        let reopened = h
            .run_until(60.0, |s| s.phase == Phase::Open && s.session != before)
            .await;
        ensure(reopened, || "no reconnect after heal".to_string())?;
        h.run_for(5.0).await;
        converged(h.settle().await)?;

        let snapshot = h.handle.store().snapshot();
        for id in &removed {
            ensure(snapshot.agent(id).is_none(), || format!("stale agent {} survived", id))?;
        }
        Ok(())
    }

    /// DST-009: FrameStutter - synthetic frame timings through the quality loop.
    ///
    /// **Assertion**: every window entirely inside a phase yields that
    /// phase's tier (60fps high, 25fps low, ~35fps medium).
    async fn run_frame_stutter(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-009: FrameStutter");
        h.start();

        let phase_secs = (self.max_duration_secs / 4.0).max(5.0);
        let phases = [
            (16u64, QualityTier::High),
            (40, QualityTier::Low),
            (28, QualityTier::Medium),
            (16, QualityTier::High),
        ];

        let mut quality = QualityController::new(QualityConfig::default(), h.ctx.now());
        let mut next_frame = h.ctx.now();
        for (frame_ms, expected) in phases {
            let phase_start = h.ctx.now();
            let frame = Duration::from_millis(frame_ms);
            for _ in 0..h.ticks_in(phase_secs) {
                h.tick().await;
                let now = h.ctx.now();
                while next_frame + frame <= now {
                    next_frame += frame;
                    let Some(tier) = quality.sample(frame_ms as f64, next_frame) else {
                        continue;
                    };
                    h.metrics.quality_windows += 1;
                    h.metrics.final_tier = Some(tier);

                    let inside_phase = next_frame >= phase_start + Duration::from_millis(2_100);
                    ensure(!inside_phase || tier == expected, || {
                        format!("{}ms frames gave {} at {:?}, expected {}", frame_ms, tier, next_frame, expected)
                    })?;
                }
            }
        }

        ensure(quality.current_tier() == Some(QualityTier::High), || {
            format!("ended at {:?}", quality.current_tier())
        })?;
        converged(h.settle().await)
    }

    /// DST-010: ChaosStorm - everything at once.
    async fn run_chaos_storm(&self, h: &mut Harness) -> Result<(), SimError> {
        info!("DST-010: ChaosStorm");
        h.controller().set_refusal_rate(0.3);
        h.garbage_rate = 0.05;
        h.start();

        let churn_every = h.ticks_in(10.0).max(1);
        for i in 1..=h.ticks_in(self.max_duration_secs) {
            h.tick().await;
            if h.chaos_rng.gen::<f64>() < 0.005 {
                h.drop_connection();
            }
            if i % churn_every == 0 {
                h.oracle.remove_oldest_agent();
                h.oracle.spawn_random_agent();
            }
        }

        // Calm the network and make the server resync once more
        h.controller().set_refusal_rate(0.0);
        h.garbage_rate = 0.0;
        let resynced = h.force_resync(60.0).await;
        ensure(resynced, || format!("no final resync: {:?}", h.status()))?;
        converged(h.settle().await)?;

        let m = &h.metrics;
        ensure(m.frames_rejected <= m.garbage_sent, || {
            format!("{} rejected, only {} garbage sent", m.frames_rejected, m.garbage_sent)
        })?;
        ensure(!h.status().terminal_failure, || "retry budget exhausted".to_string())
    }
}
