//! TrustMirror Core - resilient synchronization engine for a remote trust simulation
//!
//! This library keeps a live, eventually-consistent local mirror of a remote
//! simulation over an unreliable long-lived connection:
//! 1. **Decoding**: typed, shape-disambiguated update events from JSON frames
//! 2. **State**: a copy-on-write store published atomically to readers
//! 3. **Lifecycle**: an explicit connect / heartbeat / backoff state machine
//!    driven by a single supervisor task
//!
//! It also turns measured frame timings into a rendering quality tier.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod heartbeat;
pub mod model;
pub mod protocol;
pub mod quality;
pub mod store;
pub mod supervisor;

// Re-export key types for convenience
pub use backoff::BackoffPolicy;
pub use config::{ClientConfig, ConfigError, ResyncPolicy};
pub use connection::{Action, ConnectionState, Phase, Trigger};
pub use heartbeat::HeartbeatMonitor;
pub use model::{Agent, AgentDelta, AgentStatus, Anomaly, Severity, SimulationSnapshot, SimulationStatus, TrustDelta, TrustScoreSample};
pub use protocol::{decode, DecodeError, EntityUpdate, UpdateEvent};
pub use quality::{
    MemoryProbe, NoMemoryProbe, PerformanceSample, QualityConfig, QualityController, QualitySettings,
    QualityTier, TierSignal,
};
pub use store::{StateStore, StoreSnapshot};
pub use supervisor::{ConnectivityStatus, Supervisor, SupervisorHandle, SyncStats};
