//! Connection lifecycle state machine.
//!
//! Pure: `ConnectionState::handle` maps a trigger to a new phase plus the
//! side effects the driver must perform. It never performs I/O and never
//! reads a clock, which keeps every row of the transition table testable
//! without a transport.
//!
//! ```text
//!            start()                opened
//!   Idle ───────────► Connecting ───────────► Open
//!    ▲                 │      ▲                 │
//!    │   rejected, or  │      │ retry elapsed   │ closed/error
//!    │   budget spent  │      │                 │
//!    ├─────────────────┘   Backoff ◄────────────┤ (!manual)
//!    │                        ▲                 │
//!    │                        └── failed ───────┘ (from Connecting)
//!    │
//!    └──── Closing ◄──── stop() from any phase
//! ```

use crate::backoff::BackoffPolicy;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle phase of the single connection owned by a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Idle,
    Connecting,
    Open,
    Closing,
    Backoff,
}

impl Phase {
    /// Returns the phase name for logs and JSON output.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Open => "open",
            Phase::Closing => "closing",
            Phase::Backoff => "backoff",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Host called `start()`
    Start,
    /// Transport reported an open connection
    Opened,
    /// Transport failed to open; a later attempt may succeed
    ConnectFailed,
    /// Transport refused the endpoint itself; retrying cannot help
    ConnectRejected,
    /// An open connection closed or errored
    Closed,
    /// The backoff timer expired
    RetryElapsed,
    /// Host called `stop()`
    Stop,
    /// The driver finished closing the transport
    CloseComplete,
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenTransport,
    StartHeartbeat,
    StopHeartbeat,
    ScheduleRetry(Duration),
    CancelRetry,
    CloseTransport,
    /// Retry budget exhausted or endpoint rejected; report a terminal disconnection
    SurfaceFatal { attempts: u32 },
}

/// Supervisor-private connection state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    phase: Phase,

    /// Retries performed since the last successful open
    reconnect_attempt: u32,

    /// Monotonic time of the last successful open
    last_opened_at: Option<Duration>,

    manual_disconnect_requested: bool,

    /// Set when the retry budget ran out or the endpoint was rejected;
    /// cleared by `start()`
    terminal_failure: bool,
}

impl ConnectionState {
    /// Creates an idle state.
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            reconnect_attempt: 0,
            last_opened_at: None,
            manual_disconnect_requested: false,
            terminal_failure: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn last_opened_at(&self) -> Option<Duration> {
        self.last_opened_at
    }

    pub fn manual_disconnect_requested(&self) -> bool {
        self.manual_disconnect_requested
    }

    pub fn terminal_failure(&self) -> bool {
        self.terminal_failure
    }

    /// Applies `trigger` and returns the actions the driver must run.
    ///
    /// # Arguments
    /// * `policy` - Backoff curve and retry budget
    /// * `jitter_unit` - Uniform sample in `[0, 1)` for the retry delay
    /// * `now` - Monotonic time, recorded on successful opens
    ///
    /// Triggers that have no row for the current phase are ignored and
    /// return no actions.
    pub fn handle(
        &mut self,
        trigger: Trigger,
        policy: &BackoffPolicy,
        jitter_unit: f64,
        now: Duration,
    ) -> Vec<Action> {
        use Phase::*;
        use Trigger::*;

        match (self.phase, trigger) {
            (Idle, Start) => {
                self.manual_disconnect_requested = false;
                self.terminal_failure = false;
                self.reconnect_attempt = 0;
                self.phase = Connecting;
                vec![Action::OpenTransport]
            }
            (Connecting, Opened) => {
                self.reconnect_attempt = 0;
                self.last_opened_at = Some(now);
                self.phase = Open;
                vec![Action::StartHeartbeat]
            }
            (Connecting, ConnectFailed) => self.retry_or_give_up(policy, jitter_unit, Vec::new()),
            (Connecting, ConnectRejected) => {
                self.phase = Idle;
                self.terminal_failure = true;
                vec![Action::SurfaceFatal {
                    attempts: self.reconnect_attempt,
                }]
            }
            (Open, Closed) => {
                let actions = vec![Action::StopHeartbeat];
                if self.manual_disconnect_requested {
                    self.phase = Idle;
                    actions
                } else {
                    self.retry_or_give_up(policy, jitter_unit, actions)
                }
            }
            (Backoff, RetryElapsed) => {
                if self.manual_disconnect_requested {
                    self.phase = Idle;
                    return Vec::new();
                }
                self.reconnect_attempt += 1;
                self.phase = Connecting;
                vec![Action::OpenTransport]
            }
            (Idle, Stop) => {
                // Already idle; stop is idempotent
                self.manual_disconnect_requested = true;
                Vec::new()
            }
            (_, Stop) => {
                self.manual_disconnect_requested = true;
                self.phase = Closing;
                vec![Action::CancelRetry, Action::StopHeartbeat, Action::CloseTransport]
            }
            (Closing, CloseComplete) | (Closing, Closed) => {
                self.phase = Idle;
                Vec::new()
            }
            (phase, trigger) => {
                if matches!(trigger, Start) {
                    debug!("start() ignored while {}", phase);
                } else {
                    warn!("ignoring {:?} while {}", trigger, phase);
                }
                Vec::new()
            }
        }
    }

    fn retry_or_give_up(
        &mut self,
        policy: &BackoffPolicy,
        jitter_unit: f64,
        mut actions: Vec<Action>,
    ) -> Vec<Action> {
        if policy.allows_retry(self.reconnect_attempt) {
            self.phase = Phase::Backoff;
            actions.push(Action::ScheduleRetry(policy.delay(self.reconnect_attempt, jitter_unit)));
        } else {
            self.phase = Phase::Idle;
            self.terminal_failure = true;
            actions.push(Action::SurfaceFatal {
                attempts: self.reconnect_attempt,
            });
        }
        actions
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
