//! trustmirror client - keeps a live mirror of a remote trust simulation
//!
//! Configuration comes from the environment (`TRUSTMIRROR_ENDPOINT`,
//! `TRUSTMIRROR_HEARTBEAT_SECS`, `TRUSTMIRROR_BACKOFF_BASE_MS`,
//! `TRUSTMIRROR_BACKOFF_CAP_MS`, `TRUSTMIRROR_MAX_RECONNECT_ATTEMPTS`,
//! `TRUSTMIRROR_RESYNC`); log verbosity from `RUST_LOG`.
//!
//! The client logs connectivity changes, forwarded anomaly alerts and a
//! periodic summary of the mirrored state. Ctrl-C stops it cleanly.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trustmirror_core::{ClientConfig, Phase, StateStore, Supervisor, SupervisorHandle};
use trustmirror_env::{TokioContext, WsTransport};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

fn log_summary(handle: &SupervisorHandle) {
    let snapshot = handle.store().snapshot();
    let stats = handle.stats();
    let status = snapshot
        .simulation
        .as_ref()
        .map(|sim| format!("{:?}", sim.status))
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        "rev {} | simulation {} | {} agents (mean trust {:.1}) | {} trust samples | frames {} ok / {} rejected | {} reconnects",
        snapshot.revision,
        status,
        snapshot.agents.len(),
        snapshot.mean_agent_trust().unwrap_or(0.0),
        snapshot.trust_scores.len(),
        stats.frames_applied(),
        stats.frames_rejected(),
        stats.reconnects(),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ClientConfig::from_env().context("invalid configuration")?;
    WsTransport::check_endpoint(&config.endpoint).context("unsupported endpoint")?;

    info!("trustmirror client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "endpoint {} | heartbeat {:?} | backoff {:?}..{:?} x{} | resync {:?}",
        config.endpoint,
        config.heartbeat_interval,
        config.backoff.base,
        config.backoff.cap,
        config.backoff.max_attempts,
        config.resync,
    );

    let handle = Supervisor::spawn(
        TokioContext::shared(),
        Arc::new(WsTransport::new()),
        StateStore::new(),
        config,
    );
    let mut transitions = handle.subscribe_transitions();
    let mut alerts = handle.subscribe_alerts();
    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    handle.start();

    let mut terminal = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                break;
            }
            transition = transitions.recv() => {
                let current = match transition {
                    Ok(current) => current,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("{} connectivity changes missed", missed);
                        handle.status()
                    }
                    Err(RecvError::Closed) => break,
                };
                match current.phase {
                    Phase::Open => info!(
                        "connected (session {})",
                        current.session.map(|s| s.to_string()).unwrap_or_default()
                    ),
                    Phase::Backoff => warn!("disconnected, retry {} pending", current.reconnect_attempt + 1),
                    phase => info!("connectivity: {}", phase),
                }
                if current.terminal_failure {
                    error!("connection lost for good after {} retries", current.reconnect_attempt);
                    terminal = true;
                    break;
                }
            }
            alert = alerts.recv() => match alert {
                Ok(anomaly) => warn!(
                    "ALERT {} [{:?}] {}: {}",
                    anomaly.id, anomaly.severity, anomaly.kind, anomaly.description
                ),
                Err(RecvError::Lagged(missed)) => warn!("{} alerts missed", missed),
                Err(RecvError::Closed) => break,
            },
            _ = summary.tick() => log_summary(&handle),
        }
    }

    handle.stop().await;
    log_summary(&handle);
    handle.shutdown().await;

    if terminal {
        bail!("gave up reconnecting");
    }
    Ok(())
}
