//! Mirrored simulation state: agents, trust samples and simulation status.
//!
//! Field names follow the wire contract (camelCase on the wire, snake_case
//! in Rust). Positions are `[x, y, z]` arrays on the wire.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A point in simulation space.
pub type Position = Vector3<f64>;

/// Lowest valid trust score.
pub const TRUST_MIN: f64 = 0.0;

/// Highest valid trust score.
pub const TRUST_MAX: f64 = 100.0;

// =============================================================================
// SIMULATION STATUS
// =============================================================================

/// Coarse state of the remote simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    Running,
    Paused,
    Stopped,
    AnomalyDetected,
}

/// Severity attached to an anomaly by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// An anomaly reported by the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,

    /// Server-defined anomaly category (wire field `type`)
    #[serde(rename = "type")]
    pub kind: String,

    pub severity: Severity,
    pub position: Position,
    pub description: String,
}

/// Authoritative simulation status, replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSnapshot {
    pub status: SimulationStatus,

    /// Envelope timestamp of the update that produced this snapshot (ms)
    pub timestamp: f64,

    pub active_agent_count: u64,
    pub total_connections: u64,
    pub average_trust_score: f64,

    /// Anomalies in server order
    pub anomalies: Vec<Anomaly>,
}

// =============================================================================
// AGENTS
// =============================================================================

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Suspended,
}

/// A simulated agent, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub position: Position,

    /// Trust score in `[0, 100]`
    pub trust_score: f64,

    pub status: AgentStatus,

    /// Ids of agents this agent is connected to
    #[serde(default)]
    pub connections: BTreeSet<String>,

    /// Time of the last applied update (ms); filled from the envelope when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<f64>,

    /// Opaque server metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Partial agent update: every field except `id` is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDelta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AgentDelta {
    /// Creates an empty delta for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position: None,
            trust_score: None,
            status: None,
            connections: None,
            last_update: None,
            metadata: None,
        }
    }

    /// Sets the trust score carried by this delta.
    pub fn with_trust_score(mut self, score: f64) -> Self {
        self.trust_score = Some(score);
        self
    }

    /// Sets the status carried by this delta.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the position carried by this delta.
    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

impl Agent {
    /// Creates an agent that has only been seen through a delta.
    ///
    /// Absent fields default to the origin, score 0, `active`, no connections.
    pub fn from_delta(delta: &AgentDelta) -> Self {
        let mut agent = Self {
            id: delta.id.clone(),
            position: Position::zeros(),
            trust_score: TRUST_MIN,
            status: AgentStatus::Active,
            connections: BTreeSet::new(),
            last_update: None,
            metadata: None,
        };
        agent.merge(delta);
        agent
    }

    /// Overwrites every field present in `delta`.
    pub fn merge(&mut self, delta: &AgentDelta) {
        if let Some(position) = delta.position {
            self.position = position;
        }
        if let Some(score) = delta.trust_score {
            self.trust_score = score;
        }
        if let Some(status) = delta.status {
            self.status = status;
        }
        if let Some(connections) = &delta.connections {
            self.connections = connections.clone();
        }
        if delta.last_update.is_some() {
            self.last_update = delta.last_update;
        }
        if delta.metadata.is_some() {
            self.metadata = delta.metadata.clone();
        }
    }
}

// =============================================================================
// TRUST SCORE SAMPLES
// =============================================================================

/// A trust measurement at a point in space, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScoreSample {
    pub id: String,
    pub position: Position,

    /// Trust value in `[0, 100]`
    pub value: f64,

    /// Sample time (ms); filled from the envelope when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,

    /// Which subsystem produced the sample
    pub source: String,
}

/// Partial trust sample update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustDelta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TrustDelta {
    /// Creates an empty delta for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position: None,
            value: None,
            timestamp: None,
            source: None,
        }
    }

    /// Sets the value carried by this delta.
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

impl TrustScoreSample {
    /// Creates a sample that has only been seen through a delta.
    pub fn from_delta(delta: &TrustDelta) -> Self {
        let mut sample = Self {
            id: delta.id.clone(),
            position: Position::zeros(),
            value: TRUST_MIN,
            timestamp: None,
            source: String::new(),
        };
        sample.merge(delta);
        sample
    }

    /// Overwrites every field present in `delta`.
    pub fn merge(&mut self, delta: &TrustDelta) {
        if let Some(position) = delta.position {
            self.position = position;
        }
        if let Some(value) = delta.value {
            self.value = value;
        }
        if delta.timestamp.is_some() {
            self.timestamp = delta.timestamp;
        }
        if let Some(source) = &delta.source {
            self.source = source.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_position_is_array_on_wire() {
        let agent = Agent::from_delta(&AgentDelta::new("a1").with_position(Position::new(1.0, 2.0, 3.0)));
        let json = serde_json::to_value(&agent).unwrap();
        assert_eq!(json["position"], serde_json::json!([1.0, 2.0, 3.0]));
        assert_eq!(json["trustScore"], serde_json::json!(0.0));
        assert_eq!(json["status"], serde_json::json!("active"));
    }

    #[test]
    fn test_merge_keeps_absent_fields() {
        let mut agent = Agent::from_delta(
            &AgentDelta::new("a1")
                .with_trust_score(80.0)
                .with_status(AgentStatus::Suspended),
        );
        agent.merge(&AgentDelta::new("a1").with_trust_score(42.0));

        assert_eq!(agent.trust_score, 42.0);
        assert_eq!(agent.status, AgentStatus::Suspended);
    }

    #[test]
    fn test_trust_sample_from_delta_defaults() {
        let sample = TrustScoreSample::from_delta(&TrustDelta::new("t1").with_value(12.5));
        assert_eq!(sample.value, 12.5);
        assert_eq!(sample.position, Position::zeros());
        assert!(sample.source.is_empty());
    }

    #[test]
    fn test_status_wire_names() {
        let status: SimulationStatus = serde_json::from_str("\"anomaly_detected\"").unwrap();
        assert_eq!(status, SimulationStatus::AnomalyDetected);
        let severity: Severity = serde_json::from_str("\"critical\"").unwrap();
        assert!(severity > Severity::High);
    }
}
