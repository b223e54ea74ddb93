//! Wire contract: envelope decoding, payload classification and encoding.
//!
//! Every frame is `{ "type": <string>, "data": <payload>, "timestamp": <number> }`.
//! `agent_update` and `trust_update` carry either a full collection (array)
//! or a single-entity delta (object); the shape is resolved here, once, into
//! [`EntityUpdate`] so nothing downstream re-inspects JSON.

use crate::model::{
    Agent, AgentDelta, Anomaly, SimulationSnapshot, SimulationStatus, TrustDelta,
    TrustScoreSample, TRUST_MAX, TRUST_MIN,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message type tags.
pub mod kinds {
    pub const SIMULATION_UPDATE: &str = "simulation_update";
    pub const AGENT_UPDATE: &str = "agent_update";
    pub const TRUST_UPDATE: &str = "trust_update";
    pub const ANOMALY_ALERT: &str = "anomaly_alert";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Errors produced while decoding an inbound frame.
///
/// Always non-fatal for the connection: the frame is logged and dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid field `{0}`")]
    InvalidField(&'static str),

    #[error("Unexpected shape for `{kind}`: expected {expected}, found {found}")]
    UnexpectedShape {
        kind: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("`{field}` of `{id}` out of range: {value}")]
    OutOfRange {
        field: &'static str,
        id: String,
        value: f64,
    },
}

/// Either a full collection or a single-entity delta.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityUpdate<T, D> {
    /// Replace the whole collection
    Bulk(Vec<T>),
    /// Merge one entity by id
    Delta(D),
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Simulation(SimulationSnapshot),
    Agents(EntityUpdate<Agent, AgentDelta>),
    TrustScores(EntityUpdate<TrustScoreSample, TrustDelta>),
    AnomalyAlert(Anomaly),
    Heartbeat,
    /// A well-formed envelope with a type this client does not know
    Unrecognized(String),
}

impl UpdateEvent {
    /// Returns the wire type tag of this event.
    pub fn kind(&self) -> &str {
        match self {
            UpdateEvent::Simulation(_) => kinds::SIMULATION_UPDATE,
            UpdateEvent::Agents(_) => kinds::AGENT_UPDATE,
            UpdateEvent::TrustScores(_) => kinds::TRUST_UPDATE,
            UpdateEvent::AnomalyAlert(_) => kinds::ANOMALY_ALERT,
            UpdateEvent::Heartbeat => kinds::HEARTBEAT,
            UpdateEvent::Unrecognized(kind) => kind.as_str(),
        }
    }
}

/// `simulation_update.data` as it appears on the wire.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulationPayload {
    status: SimulationStatus,
    active_agents: u64,
    total_connections: u64,
    average_trust_score: f64,
    #[serde(default)]
    anomalies: Vec<Anomaly>,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    timestamp: f64,
}

// =============================================================================
// DECODING
// =============================================================================

/// Decodes one inbound text frame.
pub fn decode(raw: &str) -> Result<UpdateEvent, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    let mut envelope = match value {
        Value::Object(envelope) => envelope,
        other => {
            return Err(DecodeError::UnexpectedShape {
                kind: "envelope".to_string(),
                expected: "object",
                found: shape_of(&other),
            })
        }
    };

    let kind = match envelope.remove("type") {
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(DecodeError::InvalidField("type")),
        None => return Err(DecodeError::MissingField("type")),
    };
    let timestamp = envelope_timestamp(&envelope)?;

    if kind == kinds::HEARTBEAT {
        return Ok(UpdateEvent::Heartbeat);
    }

    let data = match envelope.remove("data") {
        Some(Value::Null) | None => {
            if is_known(&kind) {
                return Err(DecodeError::MissingField("data"));
            }
            Value::Null
        }
        Some(data) => data,
    };

    match kind.as_str() {
        kinds::SIMULATION_UPDATE => {
            let payload: SimulationPayload = from_payload(&kind, data)?;
            check_score("averageTrustScore", "simulation", payload.average_trust_score)?;
            Ok(UpdateEvent::Simulation(SimulationSnapshot {
                status: payload.status,
                timestamp,
                active_agent_count: payload.active_agents,
                total_connections: payload.total_connections,
                average_trust_score: payload.average_trust_score,
                anomalies: payload.anomalies,
            }))
        }
        kinds::AGENT_UPDATE => {
            let mut update: EntityUpdate<Agent, AgentDelta> = classify(&kind, data)?;
            match &mut update {
                EntityUpdate::Bulk(agents) => {
                    for agent in agents.iter_mut() {
                        check_score("trustScore", &agent.id, agent.trust_score)?;
                        agent.last_update.get_or_insert(timestamp);
                    }
                }
                EntityUpdate::Delta(delta) => {
                    if let Some(score) = delta.trust_score {
                        check_score("trustScore", &delta.id, score)?;
                    }
                    delta.last_update.get_or_insert(timestamp);
                }
            }
            Ok(UpdateEvent::Agents(update))
        }
        kinds::TRUST_UPDATE => {
            let mut update: EntityUpdate<TrustScoreSample, TrustDelta> = classify(&kind, data)?;
            match &mut update {
                EntityUpdate::Bulk(samples) => {
                    for sample in samples.iter_mut() {
                        check_score("value", &sample.id, sample.value)?;
                        sample.timestamp.get_or_insert(timestamp);
                    }
                }
                EntityUpdate::Delta(delta) => {
                    if let Some(value) = delta.value {
                        check_score("value", &delta.id, value)?;
                    }
                    delta.timestamp.get_or_insert(timestamp);
                }
            }
            Ok(UpdateEvent::TrustScores(update))
        }
        kinds::ANOMALY_ALERT => Ok(UpdateEvent::AnomalyAlert(from_payload(&kind, data)?)),
        _ => Ok(UpdateEvent::Unrecognized(kind)),
    }
}

fn is_known(kind: &str) -> bool {
    matches!(
        kind,
        kinds::SIMULATION_UPDATE | kinds::AGENT_UPDATE | kinds::TRUST_UPDATE | kinds::ANOMALY_ALERT
    )
}

fn envelope_timestamp(envelope: &Map<String, Value>) -> Result<f64, DecodeError> {
    match envelope.get("timestamp") {
        None | Some(Value::Null) => Ok(0.0),
        Some(value) => value.as_f64().ok_or(DecodeError::InvalidField("timestamp")),
    }
}

fn from_payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Resolves the array-vs-object shape of an entity payload.
fn classify<T, D>(kind: &str, data: Value) -> Result<EntityUpdate<T, D>, DecodeError>
where
    T: DeserializeOwned,
    D: DeserializeOwned,
{
    match data {
        Value::Array(_) => from_payload(kind, data).map(EntityUpdate::Bulk),
        Value::Object(_) => from_payload(kind, data).map(EntityUpdate::Delta),
        other => Err(DecodeError::UnexpectedShape {
            kind: kind.to_string(),
            expected: "array or object",
            found: shape_of(&other),
        }),
    }
}

fn check_score(field: &'static str, id: &str, value: f64) -> Result<(), DecodeError> {
    if value.is_finite() && (TRUST_MIN..=TRUST_MAX).contains(&value) {
        Ok(())
    } else {
        Err(DecodeError::OutOfRange {
            field,
            id: id.to_string(),
            value,
        })
    }
}

fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Encodes an event into the same wire shape `decode` accepts.
pub fn encode(event: &UpdateEvent, timestamp: f64) -> serde_json::Result<String> {
    let data = match event {
        UpdateEvent::Simulation(snapshot) => Some(serde_json::to_value(SimulationPayload {
            status: snapshot.status,
            active_agents: snapshot.active_agent_count,
            total_connections: snapshot.total_connections,
            average_trust_score: snapshot.average_trust_score,
            anomalies: snapshot.anomalies.clone(),
        })?),
        UpdateEvent::Agents(update) => Some(entity_value(update)?),
        UpdateEvent::TrustScores(update) => Some(entity_value(update)?),
        UpdateEvent::AnomalyAlert(anomaly) => Some(serde_json::to_value(anomaly)?),
        UpdateEvent::Heartbeat => None,
        UpdateEvent::Unrecognized(_) => Some(Value::Null),
    };
    serde_json::to_string(&OutboundEnvelope {
        kind: event.kind(),
        data,
        timestamp,
    })
}

/// Encodes the outbound liveness probe.
pub fn encode_heartbeat(timestamp: f64) -> String {
    format!(
        "{{\"type\":\"{}\",\"timestamp\":{}}}",
        kinds::HEARTBEAT,
        timestamp.max(0.0).round() as u64
    )
}

fn entity_value<T: Serialize, D: Serialize>(update: &EntityUpdate<T, D>) -> serde_json::Result<Value> {
    match update {
        EntityUpdate::Bulk(items) => serde_json::to_value(items),
        EntityUpdate::Delta(delta) => serde_json::to_value(delta),
    }
}
