//! Core environment context trait for trustmirror components.

use crate::types::SessionId;
use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the supervisor, heartbeat
/// and backoff logic can run both in production (tokio wall clock, OS
/// entropy) and in deterministic simulation (paused clock, seeded RNG).
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `thread_rng`
/// - **Simulation**: `SimContext` - paused `tokio::time`, `ChaCha8Rng(seed)`
#[async_trait]
pub trait MirrorContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for heartbeat scheduling and frame-window measurements.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time for outbound message timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns a uniformly distributed value in `[0, 1)`.
    ///
    /// This is the only entropy source of the engine (backoff jitter).
    fn random_unit(&self) -> f64;

    /// Derives the identifier for a newly opened session.
    ///
    /// Simulation combines the master seed with `seed_extension` so session
    /// ids replay per seed; production ignores it and draws a UUID v4.
    fn derive_session_id(&self, seed_extension: u64) -> SessionId;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch, as carried on the wire.
    fn unix_millis(&self) -> f64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}
