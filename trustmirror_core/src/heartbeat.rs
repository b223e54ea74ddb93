//! Liveness probes on an open connection.
//!
//! The monitor owns the `heartbeat` message type on the outbound side. It
//! does not expect a reply: liveness is judged from transport close/error
//! events by the supervisor. The monitor lives on the supervisor's task, so
//! `stop()` takes effect before the supervisor handles its next event.

use crate::protocol::encode_heartbeat;
use std::time::Duration;
use trustmirror_env::Connection;
use tracing::debug;

/// Default probe interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic liveness prober.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,

    /// Monotonic time the next probe is due; `None` while stopped
    next_due: Option<Duration>,

    probes_sent: u64,
    probes_failed: u64,
}

impl HeartbeatMonitor {
    /// Creates a stopped monitor.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
            probes_sent: 0,
            probes_failed: 0,
        }
    }

    /// Arms the monitor; the first probe is due one interval after `now`.
    pub fn start(&mut self, now: Duration) {
        self.next_due = Some(now + self.interval);
    }

    /// Disarms the monitor. No probe is emitted until the next `start`.
    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left until the next probe, or `None` while stopped.
    pub fn time_until_due(&self, now: Duration) -> Option<Duration> {
        self.next_due.map(|due| due.saturating_sub(now))
    }

    /// Sends one probe if the connection is open, then re-arms.
    ///
    /// Failures are logged and swallowed. Returns true if a probe was sent.
    pub async fn emit<C: Connection>(&mut self, conn: &mut C, now: Duration, timestamp_ms: f64) -> bool {
        if !self.is_running() {
            return false;
        }
        self.next_due = Some(now + self.interval);

        if !conn.is_open() {
            debug!("heartbeat skipped: transport not open");
            self.probes_failed += 1;
            return false;
        }
        match conn.send(encode_heartbeat(timestamp_ms)).await {
            Ok(()) => {
                self.probes_sent += 1;
                debug!("heartbeat sent ({} total)", self.probes_sent);
                true
            }
            Err(e) => {
                self.probes_failed += 1;
                debug!("heartbeat send failed: {}", e);
                false
            }
        }
    }

    /// Probes sent since the monitor was created.
    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }

    /// Probes that were due but could not be sent.
    pub fn probes_failed(&self) -> u64 {
        self.probes_failed
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustmirror_env::{MemoryTransport, Transport};

    #[test]
    fn test_start_stop_schedule() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        assert!(!monitor.is_running());
        assert_eq!(monitor.time_until_due(Duration::ZERO), None);

        monitor.start(Duration::from_secs(10));
        assert_eq!(monitor.time_until_due(Duration::from_secs(25)), Some(Duration::from_secs(15)));
        assert_eq!(monitor.time_until_due(Duration::from_secs(99)), Some(Duration::ZERO));

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_emit_sends_probe_and_rearms() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("mem://x").await.unwrap();
        let mut peer = transport.take_peer().unwrap();

        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        monitor.start(Duration::ZERO);
        assert!(monitor.emit(&mut conn, Duration::from_secs(30), 1234.0).await);

        assert_eq!(peer.drain(), vec![r#"{"type":"heartbeat","timestamp":1234}"#.to_string()]);
        assert_eq!(monitor.time_until_due(Duration::from_secs(30)), Some(Duration::from_secs(30)));
        assert_eq!(monitor.probes_sent(), 1);
    }

    #[tokio::test]
    async fn test_emit_swallows_closed_transport() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("mem://x").await.unwrap();
        transport.take_peer().unwrap().disconnect();

        let mut monitor = HeartbeatMonitor::default();
        monitor.start(Duration::ZERO);
        assert!(!monitor.emit(&mut conn, Duration::from_secs(30), 0.0).await);
        assert_eq!(monitor.probes_failed(), 1);
        assert!(monitor.is_running());
    }

    #[tokio::test]
    async fn test_stopped_monitor_never_emits() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("mem://x").await.unwrap();
        let mut peer = transport.take_peer().unwrap();

        let mut monitor = HeartbeatMonitor::default();
        assert!(!monitor.emit(&mut conn, Duration::from_secs(60), 0.0).await);
        assert!(peer.drain().is_empty());
    }
}
