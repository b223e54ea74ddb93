//! Adaptive Quality Controller - maps measured frame performance onto a
//! discrete rendering tier.
//!
//! The rendering layer calls [`QualityController::sample`] once per frame.
//! Frames are aggregated into ~1 second windows; each closed window yields
//! one [`PerformanceSample`] in a bounded history and one tier decision.
//!
//! ```text
//!   frame ─► sample() ─► window open? ── yes ─► None
//!                             │
//!                             no (≥ 1s elapsed)
//!                             ▼
//!            fps = frames·1000 / elapsed_ms ─► history (cap 60)
//!                             │
//!                      TierSignal::{Instantaneous, Smoothed}
//!                             ▼
//!                  Some(Low | Medium | High)
//! ```

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Windows retained in the history (one minute at 1 window/s).
pub const HISTORY_CAPACITY: usize = 60;

/// Aggregation window length.
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Below this the tier is `Low`.
pub const LOW_FPS_THRESHOLD: f64 = 30.0;

/// At or above this the tier is `High`.
pub const HIGH_FPS_THRESHOLD: f64 = 50.0;

/// Discrete rendering-detail level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl QualityTier {
    pub fn from_fps(fps: f64) -> Self {
        if fps < LOW_FPS_THRESHOLD {
            QualityTier::Low
        } else if fps < HIGH_FPS_THRESHOLD {
            QualityTier::Medium
        } else {
            QualityTier::High
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One closed window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub fps: f64,

    /// Mean frame time over the window
    pub frame_time_ms: f64,

    /// 0.0 when the host cannot report memory usage
    pub memory_usage_ratio: f64,
}

/// Host memory telemetry.
pub trait MemoryProbe: Send + Sync {
    /// Used/limit ratio, or `None` when unavailable.
    fn usage_ratio(&self) -> Option<f64>;
}

/// Probe for hosts without memory telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemoryProbe;

impl MemoryProbe for NoMemoryProbe {
    fn usage_ratio(&self) -> Option<f64> {
        None
    }
}

/// Which signal drives the tier decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierSignal {
    /// FPS of the window that just closed
    Instantaneous,
    /// Mean FPS of the last `windows` history entries
    Smoothed { windows: usize },
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub window: Duration,
    pub history_capacity: usize,
    pub signal: TierSignal,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            window: SAMPLE_WINDOW,
            history_capacity: HISTORY_CAPACITY,
            signal: TierSignal::Instantaneous,
        }
    }
}

impl QualityConfig {
    pub fn with_signal(mut self, signal: TierSignal) -> Self {
        self.signal = signal;
        self
    }
}

/// Frame-time aggregator and tier selector.
pub struct QualityController<P: MemoryProbe = NoMemoryProbe> {
    config: QualityConfig,
    probe: P,

    window_start: Duration,
    frames: u32,
    frame_time_total_ms: f64,

    history: VecDeque<PerformanceSample>,
    tier: Option<QualityTier>,
}

impl QualityController<NoMemoryProbe> {
    /// Creates a controller whose first window opens at `now`.
    pub fn new(config: QualityConfig, now: Duration) -> Self {
        Self::with_probe(config, NoMemoryProbe, now)
    }
}

impl<P: MemoryProbe> QualityController<P> {
    pub fn with_probe(config: QualityConfig, probe: P, now: Duration) -> Self {
        let capacity = config.history_capacity.max(1);
        Self {
            config,
            probe,
            window_start: now,
            frames: 0,
            frame_time_total_ms: 0.0,
            history: VecDeque::with_capacity(capacity),
            tier: None,
        }
    }

    /// Records one rendered frame.
    ///
    /// Returns the tier when this frame closes a window, `None` otherwise.
    pub fn sample(&mut self, frame_time_ms: f64, now: Duration) -> Option<QualityTier> {
        self.frames += 1;
        if frame_time_ms.is_finite() && frame_time_ms > 0.0 {
            self.frame_time_total_ms += frame_time_ms;
        }

        let elapsed = now.saturating_sub(self.window_start);
        if elapsed < self.config.window {
            return None;
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let sample = PerformanceSample {
            fps: f64::from(self.frames) * 1000.0 / elapsed_ms,
            frame_time_ms: self.frame_time_total_ms / f64::from(self.frames),
            memory_usage_ratio: self.memory_usage_ratio(),
        };
        self.push(sample);

        self.window_start = now;
        self.frames = 0;
        self.frame_time_total_ms = 0.0;

        let tier = QualityTier::from_fps(self.signal_fps(sample.fps));
        if self.tier != Some(tier) {
            debug!("quality tier -> {} ({:.1} fps)", tier, sample.fps);
        }
        self.tier = Some(tier);
        Some(tier)
    }

    fn memory_usage_ratio(&self) -> f64 {
        self.probe
            .usage_ratio()
            .filter(|ratio| ratio.is_finite())
            .map(|ratio| ratio.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    fn push(&mut self, sample: PerformanceSample) {
        if self.history.len() >= self.config.history_capacity.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }

    fn signal_fps(&self, instantaneous: f64) -> f64 {
        match self.config.signal {
            TierSignal::Instantaneous => instantaneous,
            TierSignal::Smoothed { windows } => {
                let n = windows.max(1).min(self.history.len());
                if n == 0 {
                    return instantaneous;
                }
                self.history.iter().rev().take(n).map(|s| s.fps).sum::<f64>() / n as f64
            }
        }
    }

    /// Last emitted tier, `None` before the first window closes.
    pub fn current_tier(&self) -> Option<QualityTier> {
        self.tier
    }

    /// Closed windows, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.history.iter()
    }

    pub fn latest(&self) -> Option<&PerformanceSample> {
        self.history.back()
    }
}

/// Rendering parameters per tier, consumed by the rendering layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySettings {
    pub shadow_map_size: u32,
    pub particle_count: u32,
    /// Geometry level of detail in (0, 1]
    pub geometry_detail: f64,
    pub antialias: bool,
}

impl QualitySettings {
    pub const fn for_tier(tier: QualityTier) -> Self {
        match tier {
            QualityTier::Low => Self {
                shadow_map_size: 512,
                particle_count: 1_000,
                geometry_detail: 0.5,
                antialias: false,
            },
            QualityTier::Medium => Self {
                shadow_map_size: 1024,
                particle_count: 5_000,
                geometry_detail: 0.75,
                antialias: true,
            },
            QualityTier::High => Self {
                shadow_map_size: 2048,
                particle_count: 10_000,
                geometry_detail: 1.0,
                antialias: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Feeds frames at a fixed interval and collects the emitted tiers.
    fn run<P: MemoryProbe>(
        controller: &mut QualityController<P>,
        start_ms: u64,
        frame_ms: u64,
        windows: usize,
    ) -> (Vec<QualityTier>, u64) {
        let mut tiers = Vec::new();
        let mut now = start_ms;
        while tiers.len() < windows {
            now += frame_ms;
            if let Some(tier) = controller.sample(frame_ms as f64, Duration::from_millis(now)) {
                tiers.push(tier);
            }
        }
        (tiers, now)
    }

    #[test]
    fn test_tier_thresholds() {
        assert_eq!(QualityTier::from_fps(0.0), QualityTier::Low);
        assert_eq!(QualityTier::from_fps(29.99), QualityTier::Low);
        assert_eq!(QualityTier::from_fps(30.0), QualityTier::Medium);
        assert_eq!(QualityTier::from_fps(49.99), QualityTier::Medium);
        assert_eq!(QualityTier::from_fps(50.0), QualityTier::High);
        assert_eq!(QualityTier::from_fps(144.0), QualityTier::High);
    }

    #[test]
    fn test_25_fps_windows_are_low() {
        let mut controller = QualityController::new(QualityConfig::default(), Duration::ZERO);
        let (tiers, _) = run(&mut controller, 0, 40, 3);

        assert_eq!(tiers, vec![QualityTier::Low; 3]);
        for sample in controller.history() {
            assert_relative_eq!(sample.fps, 25.0, epsilon = 1e-9);
            assert_relative_eq!(sample.frame_time_ms, 40.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_55_fps_windows_are_high() {
        let mut controller = QualityController::new(QualityConfig::default(), Duration::ZERO);
        // 56 frames per 1008ms window
        let (tiers, _) = run(&mut controller, 0, 18, 2);

        assert_eq!(tiers, vec![QualityTier::High; 2]);
        assert_relative_eq!(controller.latest().unwrap().fps, 55.5, epsilon = 0.1);
    }

    #[test]
    fn test_single_35_fps_window_is_medium() {
        let mut controller = QualityController::new(QualityConfig::default(), Duration::ZERO);
        // 36 frames per 1008ms window
        let (tiers, _) = run(&mut controller, 0, 28, 1);

        assert_eq!(tiers, vec![QualityTier::Medium]);
        assert_eq!(controller.current_tier(), Some(QualityTier::Medium));
    }

    #[test]
    fn test_no_tier_before_window_closes() {
        let mut controller = QualityController::new(QualityConfig::default(), Duration::ZERO);
        for ms in (16..1000).step_by(16) {
            assert_eq!(controller.sample(16.0, Duration::from_millis(ms)), None);
        }
        assert_eq!(controller.current_tier(), None);
        assert!(controller.latest().is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut controller = QualityController::new(QualityConfig::default(), Duration::ZERO);
        let mut now = Duration::ZERO;
        for _ in 0..(HISTORY_CAPACITY + 15) {
            now += SAMPLE_WINDOW;
            assert!(controller.sample(16.0, now).is_some());
        }
        assert_eq!(controller.history().count(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_memory_unavailable_is_recorded_as_zero() {
        let mut controller = QualityController::new(QualityConfig::default(), Duration::ZERO);
        controller.sample(16.0, SAMPLE_WINDOW);
        assert_eq!(controller.latest().unwrap().memory_usage_ratio, 0.0);
    }

    struct FixedProbe(f64);

    impl MemoryProbe for FixedProbe {
        fn usage_ratio(&self) -> Option<f64> {
            Some(self.0)
        }
    }

    #[test]
    fn test_memory_probe_is_clamped() {
        let mut controller =
            QualityController::with_probe(QualityConfig::default(), FixedProbe(0.42), Duration::ZERO);
        controller.sample(16.0, SAMPLE_WINDOW);
        assert_relative_eq!(controller.latest().unwrap().memory_usage_ratio, 0.42);

        let mut controller =
            QualityController::with_probe(QualityConfig::default(), FixedProbe(3.0), Duration::ZERO);
        controller.sample(16.0, SAMPLE_WINDOW);
        assert_eq!(controller.latest().unwrap().memory_usage_ratio, 1.0);
    }

    #[test]
    fn test_smoothed_signal_resists_single_spike() {
        let config = QualityConfig::default().with_signal(TierSignal::Smoothed { windows: 5 });
        let mut controller = QualityController::new(config, Duration::ZERO);

        // Four healthy 60fps windows, then one stuttering 20fps window
        let (tiers, now) = run(&mut controller, 0, 1000 / 60 + 1, 4);
        assert!(tiers.iter().all(|t| *t == QualityTier::High));
        let (tiers, _) = run(&mut controller, now, 50, 1);

        // Mean of ~58.8 x4 and 20 stays at or above 50
        assert_eq!(tiers, vec![QualityTier::High]);

        let mut instant = QualityController::new(QualityConfig::default(), Duration::ZERO);
        let (_, now) = run(&mut instant, 0, 1000 / 60 + 1, 4);
        let (tiers, _) = run(&mut instant, now, 50, 1);
        assert_eq!(tiers, vec![QualityTier::Low]);
    }

    #[test]
    fn test_settings_lookup() {
        let low = QualitySettings::for_tier(QualityTier::Low);
        let high = QualitySettings::for_tier(QualityTier::High);
        assert_eq!(low.shadow_map_size, 512);
        assert!(!low.antialias);
        assert_eq!(QualitySettings::for_tier(QualityTier::Medium).particle_count, 5_000);
        assert_eq!(high.geometry_detail, 1.0);
        assert!(high.particle_count > low.particle_count);
    }
}
