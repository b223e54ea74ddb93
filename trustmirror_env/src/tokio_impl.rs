//! Production implementation of MirrorContext using Tokio.

use crate::{MirrorContext, SessionId};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::debug;

/// Production context backed by Tokio and thread-local entropy.
///
/// Monotonic time is read from `tokio::time::Instant`, so a runtime started
/// with a paused clock drives this context deterministically as well.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MirrorContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        tokio::spawn(async move {
            future.await;
            debug!("task {} finished", name);
        });
    }

    fn random_unit(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn derive_session_id(&self, _seed_extension: u64) -> SessionId {
        SessionId::new()
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[test]
    fn test_tokio_context_random_unit_range() {
        let ctx = TokioContext::new();
        for _ in 0..1000 {
            let u = ctx.random_unit();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn test_tokio_context_session_ids_are_random() {
        let ctx = TokioContext::new();
        assert_ne!(ctx.derive_session_id(1), ctx.derive_session_id(1));
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }

    #[test]
    fn test_unix_millis_is_after_2020() {
        let ctx = TokioContext::new();
        assert!(ctx.unix_millis() > 1_577_836_800_000.0);
    }
}
