//! Simulated network transport with fault injection.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use trustmirror_env::{EnvError, MemoryConnection, MemoryPeer, MemoryTransport, Transport};

struct FaultState {
    /// While set, every connection attempt is refused
    partitioned: bool,

    /// Refusals still owed to scripted startup failures
    refuse_next: u32,

    /// Probability that any other attempt is refused (0.0 - 1.0)
    refusal_rate: f64,

    rng: ChaCha8Rng,

    connect_attempts: u64,
    refused: u64,
}

/// Network controller for fault injection.
///
/// Cloning shares the same fault state.
#[derive(Clone)]
pub struct SimNetworkController {
    state: Arc<Mutex<FaultState>>,
}

impl SimNetworkController {
    /// Creates a healthy network whose random refusals derive from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(FaultState {
                partitioned: false,
                refuse_next: 0,
                refusal_rate: 0.0,
                rng: ChaCha8Rng::seed_from_u64(seed),
                connect_attempts: 0,
                refused: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuses every connection attempt until [`heal`](Self::heal).
    pub fn partition(&self) {
        self.state().partitioned = true;
    }

    /// Ends a partition.
    pub fn heal(&self) {
        self.state().partitioned = false;
    }

    pub fn is_partitioned(&self) -> bool {
        self.state().partitioned
    }

    /// Refuses the next `n` attempts.
    pub fn refuse_next(&self, n: u32) {
        self.state().refuse_next += n;
    }

    /// Sets the random refusal probability.
    pub fn set_refusal_rate(&self, rate: f64) {
        self.state().refusal_rate = rate.clamp(0.0, 1.0);
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state().connect_attempts
    }

    pub fn refused(&self) -> u64 {
        self.state().refused
    }

    /// Records one attempt and decides whether it is refused.
    fn admit(&self) -> bool {
        let mut state = self.state();
        state.connect_attempts += 1;

        let refuse = if state.partitioned {
            true
        } else if state.refuse_next > 0 {
            state.refuse_next -= 1;
            true
        } else {
            let rate = state.refusal_rate;
            rate > 0.0 && state.rng.gen::<f64>() < rate
        };

        if refuse {
            state.refused += 1;
        }
        !refuse
    }
}

/// Client-side transport of the simulated network.
///
/// Admission goes through the [`SimNetworkController`]; accepted
/// connections are in-memory channel pairs whose server sides are collected
/// with [`SimTransport::accept`].
#[derive(Clone)]
pub struct SimTransport {
    memory: MemoryTransport,
    controller: SimNetworkController,
}

impl SimTransport {
    pub fn new(controller: SimNetworkController) -> Self {
        Self {
            memory: MemoryTransport::new(),
            controller,
        }
    }

    pub fn controller(&self) -> &SimNetworkController {
        &self.controller
    }

    /// Takes the server side of the oldest accepted connection.
    pub fn accept(&self) -> Option<MemoryPeer> {
        self.memory.take_peer()
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Conn = MemoryConnection;

    async fn connect(&self, endpoint: &str) -> Result<MemoryConnection, EnvError> {
        if !self.controller.admit() {
            debug!("sim network refused {}", endpoint);
            return Err(EnvError::connect(format!("{endpoint}: connection refused")));
        }
        self.memory.connect(endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partition_refuses_until_healed() {
        let controller = SimNetworkController::new(1);
        let transport = SimTransport::new(controller.clone());

        controller.partition();
        assert!(transport.connect("mem://sim").await.is_err());
        assert!(transport.connect("mem://sim").await.is_err());
        assert!(transport.accept().is_none());

        controller.heal();
        assert!(transport.connect("mem://sim").await.is_ok());
        assert!(transport.accept().is_some());

        assert_eq!(controller.connect_attempts(), 3);
        assert_eq!(controller.refused(), 2);
    }

    #[tokio::test]
    async fn test_scripted_refusals() {
        let controller = SimNetworkController::new(1);
        let transport = SimTransport::new(controller.clone());
        controller.refuse_next(2);

        assert!(transport.connect("mem://sim").await.is_err());
        assert!(transport.connect("mem://sim").await.is_err());
        assert!(transport.connect("mem://sim").await.is_ok());
    }

    #[tokio::test]
    async fn test_refusal_rate_is_seeded() {
        async fn pattern(seed: u64) -> Vec<bool> {
            let controller = SimNetworkController::new(seed);
            controller.set_refusal_rate(0.5);
            let transport = SimTransport::new(controller);
            let mut outcomes = Vec::new();
            for _ in 0..32 {
                outcomes.push(transport.connect("mem://sim").await.is_ok());
            }
            outcomes
        }

        let a = pattern(9).await;
        assert_eq!(a, pattern(9).await);
        assert!(a.iter().any(|ok| *ok));
        assert!(a.iter().any(|ok| !*ok));
    }
}
