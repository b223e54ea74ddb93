//! trustmirror Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a controlled environment in which the production
//! synchronization engine runs against a simulated server, deterministically.
//!
//! # Core Principle: Virtual Time
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Tokio's paused clock advances only when every task is blocked
//! - **Network**: in-memory connections with scripted refusals, partitions
//!   and server-side drops
//! - **Randomness**: backoff jitter, physics and chaos all derive from one
//!   64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            current_thread runtime (paused clock)            │
//! │                                                             │
//! │  ┌──────────────┐   SimTransport    ┌──────────────────┐    │
//! │  │  Supervisor  │◄─────────────────►│     Harness      │    │
//! │  │  (prod code) │  MemoryConnection │  (server side)   │    │
//! │  └──────┬───────┘                   └────────┬─────────┘    │
//! │         │ StateStore                         │              │
//! │         ▼                                    ▼              │
//! │   mirror snapshot ◄──── divergence ────  Oracle (truth)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trustmirror_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 12).run(ScenarioId::Partition);
//! assert!(result.passed);
//! ```

mod context;
mod network;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use network::{SimNetworkController, SimTransport};
pub use oracle::{GroundTruthAgent, Oracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};
