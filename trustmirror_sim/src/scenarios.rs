//! Chaos engineering scenarios for DST.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: Healthy network, mirror must track ground truth
    CleanSync,

    /// DST-002: First connection attempts refused
    FlakyStartup,

    /// DST-003: Server drops the connection mid-stream, repeatedly
    MidStreamDrop,

    /// DST-004: 20s partition, then heal
    Partition,

    /// DST-005: Permanent partition exhausts the retry budget
    RetryExhaustion,

    /// DST-006: stop() while waiting out a backoff
    StopDuringBackoff,

    /// DST-007: Malformed frames interleaved with the update stream
    GarbageFrames,

    /// DST-008: Agents removed while the client is disconnected
    StaleEntities,

    /// DST-009: Rendering stutter drives the quality controller
    FrameStutter,

    // ═══════════════════════════════════════════════════
    // EXTREME CHAOS SCENARIOS
    // ═══════════════════════════════════════════════════

    /// DST-010: Refusals, drops, garbage and churn at once
    ChaosStorm,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        let mut all = Self::standard();
        all.extend(Self::extreme());
        all
    }

    /// Returns standard scenarios (not extreme).
    pub fn standard() -> Vec<ScenarioId> {
        vec![
            ScenarioId::CleanSync,
            ScenarioId::FlakyStartup,
            ScenarioId::MidStreamDrop,
            ScenarioId::Partition,
            ScenarioId::RetryExhaustion,
            ScenarioId::StopDuringBackoff,
            ScenarioId::GarbageFrames,
            ScenarioId::StaleEntities,
            ScenarioId::FrameStutter,
        ]
    }

    /// Returns extreme scenarios only.
    pub fn extreme() -> Vec<ScenarioId> {
        vec![ScenarioId::ChaosStorm]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::CleanSync => "clean_sync",
            ScenarioId::FlakyStartup => "flaky_startup",
            ScenarioId::MidStreamDrop => "mid_stream_drop",
            ScenarioId::Partition => "partition",
            ScenarioId::RetryExhaustion => "retry_exhaustion",
            ScenarioId::StopDuringBackoff => "stop_during_backoff",
            ScenarioId::GarbageFrames => "garbage_frames",
            ScenarioId::StaleEntities => "stale_entities",
            ScenarioId::FrameStutter => "frame_stutter",
            ScenarioId::ChaosStorm => "chaos_storm",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::CleanSync => "No faults; mirror converges, heartbeats every 30s",
            ScenarioId::FlakyStartup => "4 refused connects, then open after 1+2+4+8s of backoff",
            ScenarioId::MidStreamDrop => "Server drops every 15s; reconnect and bulk resync each time",
            ScenarioId::Partition => "Partition for 20s, no heartbeats while down, converge after heal",
            ScenarioId::RetryExhaustion => "Retry budget runs out; terminal until start() is called",
            ScenarioId::StopDuringBackoff => "stop() during backoff cancels the pending retry",
            ScenarioId::GarbageFrames => "10% malformed frames; each dropped, connection stays open",
            ScenarioId::StaleEntities => "Removals during a partition vanish after reconnect",
            ScenarioId::FrameStutter => "60 -> 25 -> 35 -> 60 fps; tiers high, low, medium, high",
            ScenarioId::ChaosStorm => "🔥 30% refusals + random drops + garbage + agent churn",
        }
    }

    /// Returns true if this is an extreme scenario.
    pub fn is_extreme(&self) -> bool {
        matches!(self, ScenarioId::ChaosStorm)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clean_sync" | "cleansync" | "dst-001" => Ok(ScenarioId::CleanSync),
            "flaky_startup" | "flakystartup" | "dst-002" => Ok(ScenarioId::FlakyStartup),
            "mid_stream_drop" | "midstreamdrop" | "dst-003" => Ok(ScenarioId::MidStreamDrop),
            "partition" | "dst-004" => Ok(ScenarioId::Partition),
            "retry_exhaustion" | "retryexhaustion" | "dst-005" => Ok(ScenarioId::RetryExhaustion),
            "stop_during_backoff" | "stopduringbackoff" | "dst-006" => Ok(ScenarioId::StopDuringBackoff),
            "garbage_frames" | "garbageframes" | "dst-007" => Ok(ScenarioId::GarbageFrames),
            "stale_entities" | "staleentities" | "dst-008" => Ok(ScenarioId::StaleEntities),
            "frame_stutter" | "framestutter" | "dst-009" => Ok(ScenarioId::FrameStutter),
            "chaos_storm" | "chaosstorm" | "dst-010" => Ok(ScenarioId::ChaosStorm),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("DST-004".parse::<ScenarioId>(), Ok(ScenarioId::Partition));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_extreme_partition() {
        assert!(ScenarioId::extreme().iter().all(|s| s.is_extreme()));
        assert!(ScenarioId::standard().iter().all(|s| !s.is_extreme()));
        assert_eq!(ScenarioId::all().len(), 10);
    }
}
