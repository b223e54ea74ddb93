//! Simulation context implementing MirrorContext for deterministic testing.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use trustmirror_env::{MirrorContext, SessionId};

/// Simulation context backed by the paused Tokio clock and a seeded RNG.
///
/// This implements `MirrorContext` using:
/// - Tokio's virtual clock: inside a runtime started with `start_paused`,
///   time only moves when every task is blocked on a timer
/// - A seeded ChaCha8 RNG, so backoff jitter replays exactly per seed
/// - A fixed epoch, so outbound timestamps are reproducible too
///
/// Must be created inside the simulation runtime.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Virtual time zero
    start: Instant,

    /// Deterministic RNG (jitter)
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    fn rng(&self) -> MutexGuard<'_, ChaCha8Rng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            start: self.start,
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl MirrorContext for SimContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::trace!("spawning sim task {}", name);
        tokio::spawn(future);
    }

    fn random_unit(&self) -> f64 {
        self.rng().gen::<f64>()
    }

    fn derive_session_id(&self, seed_extension: u64) -> SessionId {
        SessionId::from_seed(self.seed.wrapping_mul(0x517cc1b727220a95) ^ seed_extension)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_time_follows_paused_clock() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.sleep(Duration::from_secs(1)).await;
        assert_eq!(ctx.now(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_deterministic_entropy() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);
        let ctx3 = SimContext::new(43);

        let a: Vec<f64> = (0..8).map(|_| ctx1.random_unit()).collect();
        let b: Vec<f64> = (0..8).map(|_| ctx2.random_unit()).collect();
        let c: Vec<f64> = (0..8).map(|_| ctx3.random_unit()).collect();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|u| (0.0..1.0).contains(u)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_fixed_epoch() {
        let ctx = SimContext::new(7);
        ctx.sleep(Duration::from_millis(250)).await;
        assert_eq!(ctx.unix_millis(), 1_704_067_200_250.0);
        assert_eq!(ctx.seed(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_deterministic_session_ids() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);
        let ctx3 = SimContext::new(43);

        assert_eq!(ctx1.derive_session_id(0), ctx2.derive_session_id(0));
        assert_ne!(ctx1.derive_session_id(0), ctx1.derive_session_id(1));
        assert_ne!(ctx1.derive_session_id(0), ctx3.derive_session_id(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_clone_shares_rng() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();
        let fresh = SimContext::new(42);

        ctx1.random_unit();
        // The clone continues the same stream
        assert_eq!(ctx2.random_unit(), {
            fresh.random_unit();
            fresh.random_unit()
        });
    }
}
