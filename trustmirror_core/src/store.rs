//! The State Store: a pure reducer plus an atomically published snapshot.
//!
//! `StoreSnapshot::apply` never mutates; it returns the next snapshot and
//! shares every untouched collection with the previous one. `StateStore`
//! publishes each new snapshot with one reference swap, so a reader (for
//! example a render loop on another task) always holds a complete view.

use crate::model::{Agent, AgentDelta, SimulationSnapshot, TrustDelta, TrustScoreSample};
use crate::protocol::{EntityUpdate, UpdateEvent};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// An immutable, internally consistent view of the mirrored state.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Latest simulation status (`None` until the first `simulation_update`)
    pub simulation: Option<Arc<SimulationSnapshot>>,

    /// Agents keyed by id, in server order
    pub agents: Arc<IndexMap<String, Agent>>,

    /// Trust samples keyed by id, in server order
    pub trust_scores: Arc<IndexMap<String, TrustScoreSample>>,

    /// Incremented on every published change
    pub revision: u64,
}

impl StoreSnapshot {
    /// Returns the snapshot that results from applying `event`.
    ///
    /// Returns `None` when the event carries no state (heartbeats, anomaly
    /// alerts, unrecognized kinds).
    pub fn apply(&self, event: &UpdateEvent) -> Option<StoreSnapshot> {
        let mut next = match event {
            UpdateEvent::Simulation(snapshot) => StoreSnapshot {
                simulation: Some(Arc::new(snapshot.clone())),
                ..self.clone()
            },
            UpdateEvent::Agents(update) => StoreSnapshot {
                agents: Arc::new(reduce(&self.agents, update)),
                ..self.clone()
            },
            UpdateEvent::TrustScores(update) => StoreSnapshot {
                trust_scores: Arc::new(reduce(&self.trust_scores, update)),
                ..self.clone()
            },
            UpdateEvent::AnomalyAlert(_) | UpdateEvent::Heartbeat => return None,
            UpdateEvent::Unrecognized(kind) => {
                debug!("ignoring unrecognized update kind `{}`", kind);
                return None;
            }
        };
        next.revision = self.revision + 1;
        Some(next)
    }

    /// Returns the snapshot with both entity collections emptied.
    pub fn without_collections(&self) -> StoreSnapshot {
        StoreSnapshot {
            simulation: self.simulation.clone(),
            agents: Arc::default(),
            trust_scores: Arc::default(),
            revision: self.revision + 1,
        }
    }

    /// Looks up an agent by id.
    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Looks up a trust sample by id.
    pub fn trust_score(&self, id: &str) -> Option<&TrustScoreSample> {
        self.trust_scores.get(id)
    }

    /// Mean trust score over the mirrored agents.
    pub fn mean_agent_trust(&self) -> Option<f64> {
        if self.agents.is_empty() {
            return None;
        }
        let total: f64 = self.agents.values().map(|a| a.trust_score).sum();
        Some(total / self.agents.len() as f64)
    }
}

/// An id-keyed entity that can be merged from a partial update.
trait Entity: Clone {
    type Delta;

    fn id(&self) -> &str;
    fn delta_id(delta: &Self::Delta) -> &str;
    fn from_delta(delta: &Self::Delta) -> Self;
    fn merge(&mut self, delta: &Self::Delta);
}

impl Entity for Agent {
    type Delta = AgentDelta;

    fn id(&self) -> &str {
        &self.id
    }

    fn delta_id(delta: &AgentDelta) -> &str {
        &delta.id
    }

    fn from_delta(delta: &AgentDelta) -> Self {
        Agent::from_delta(delta)
    }

    fn merge(&mut self, delta: &AgentDelta) {
        Agent::merge(self, delta)
    }
}

impl Entity for TrustScoreSample {
    type Delta = TrustDelta;

    fn id(&self) -> &str {
        &self.id
    }

    fn delta_id(delta: &TrustDelta) -> &str {
        &delta.id
    }

    fn from_delta(delta: &TrustDelta) -> Self {
        TrustScoreSample::from_delta(delta)
    }

    fn merge(&mut self, delta: &TrustDelta) {
        TrustScoreSample::merge(self, delta)
    }
}

/// Bulk replaces the collection; a delta merges (or inserts) one id.
fn reduce<E: Entity>(
    current: &IndexMap<String, E>,
    update: &EntityUpdate<E, E::Delta>,
) -> IndexMap<String, E> {
    match update {
        // Duplicate ids inside one bulk payload collapse to the last one
        EntityUpdate::Bulk(items) => items
            .iter()
            .map(|item| (item.id().to_string(), item.clone()))
            .collect(),
        EntityUpdate::Delta(delta) => {
            let mut next = current.clone();
            match next.get_mut(E::delta_id(delta)) {
                Some(existing) => existing.merge(delta),
                None => {
                    next.insert(E::delta_id(delta).to_string(), E::from_delta(delta));
                }
            }
            next
        }
    }
}

// =============================================================================
// SHARED STORE HANDLE
// =============================================================================

/// Shared handle to the published snapshot.
///
/// Cloning the handle shares the store. There is a single writer (the
/// supervisor owning the connection); any number of readers.
#[derive(Clone)]
pub struct StateStore {
    tx: Arc<watch::Sender<Arc<StoreSnapshot>>>,
}

impl StateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(StoreSnapshot::default()));
        Self { tx: Arc::new(tx) }
    }

    /// Applies an event and publishes the result. Returns true if state changed.
    pub fn apply(&self, event: &UpdateEvent) -> bool {
        self.tx.send_if_modified(|current| match current.apply(event) {
            Some(next) => {
                *current = Arc::new(next);
                true
            }
            None => false,
        })
    }

    /// Drops all agents and trust samples, keeping the simulation status.
    pub fn clear_collections(&self) {
        self.tx.send_modify(|current| {
            *current = Arc::new(current.without_collections());
        });
    }

    /// Returns the current snapshot.
    ///
    /// The returned `Arc` stays valid and unchanged while later updates are
    /// published.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// Subscribes to snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.tx.subscribe()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
