//! Ground truth oracle for simulation.
//!
//! The Oracle plays the remote simulation server:
//! - True state of every agent and trust sample
//! - Kinematics and a trust random walk
//! - The update stream a real server would push (deltas, periodic status,
//!   occasional anomaly alerts) plus the bulk resync sent on every connect

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::{BTreeMap, BTreeSet};
use trustmirror_core::model::{
    Agent, AgentDelta, AgentStatus, Anomaly, Severity, SimulationSnapshot, SimulationStatus,
    TrustDelta, TrustScoreSample, TRUST_MAX, TRUST_MIN,
};
use trustmirror_core::protocol::{EntityUpdate, UpdateEvent};
use trustmirror_core::StoreSnapshot;

/// Positions and scores are compared with this tolerance after a JSON trip.
const CONVERGENCE_EPSILON: f64 = 1e-6;

/// Anomalies retained in the simulation status.
const ANOMALY_HISTORY: usize = 10;

/// A ground truth agent.
#[derive(Debug, Clone)]
pub struct GroundTruthAgent {
    /// Mirrored state
    pub agent: Agent,

    /// Velocity [vx, vy, vz] in m/s
    pub velocity: Vector3<f64>,
}

/// The Oracle - maintains ground truth and generates the server's update stream.
pub struct Oracle {
    /// RNG for dynamics (noise, random events)
    physics_rng: ChaCha8Rng,

    agents: BTreeMap<String, GroundTruthAgent>,
    samples: BTreeMap<String, TrustScoreSample>,
    anomalies: Vec<Anomaly>,

    next_agent: u64,
    next_anomaly: u64,

    /// Current simulation time (seconds)
    current_time: f64,

    /// Time of the last periodic status update (seconds)
    last_status_at: f64,

    /// Trust random-walk standard deviation per sqrt(second)
    trust_noise_std: f64,

    /// Probability per step of raising an anomaly alert
    anomaly_rate: f64,
}

impl Oracle {
    /// Creates an empty Oracle with the given physics seed.
    ///
    /// The physics seed should be derived separately from the network seed
    /// so that fault injection doesn't change agent trajectories.
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            agents: BTreeMap::new(),
            samples: BTreeMap::new(),
            anomalies: Vec::new(),
            next_agent: 0,
            next_anomaly: 0,
            current_time: 0.0,
            last_status_at: 0.0,
            trust_noise_std: 2.0,
            anomaly_rate: 0.01,
        }
    }

    /// Creates an Oracle populated with `num_agents` randomly placed agents.
    pub fn with_population(physics_seed: u64, num_agents: usize) -> Self {
        let mut oracle = Self::new(physics_seed);
        for _ in 0..num_agents {
            oracle.spawn_random_agent();
        }
        oracle
    }

    pub fn set_anomaly_rate(&mut self, rate: f64) {
        self.anomaly_rate = rate.clamp(0.0, 1.0);
    }

    /// Spawns a new agent and its trust sample. Returns the agent id.
    pub fn spawn_agent(&mut self, position: Vector3<f64>, velocity: Vector3<f64>, trust_score: f64) -> String {
        let id = format!("agent-{:04}", self.next_agent);
        self.next_agent += 1;

        // Link to up to two existing agents
        let mut connections = BTreeSet::new();
        let existing: Vec<String> = self.agents.keys().cloned().collect();
        for _ in 0..existing.len().min(2) {
            let peer = &existing[self.physics_rng.gen_range(0..existing.len())];
            connections.insert(peer.clone());
        }

        let trust_score = trust_score.clamp(TRUST_MIN, TRUST_MAX);
        let agent = Agent {
            id: id.clone(),
            position,
            trust_score,
            status: AgentStatus::Active,
            connections,
            last_update: Some(self.time_ms()),
            metadata: None,
        };
        self.samples.insert(
            sample_id(&id),
            TrustScoreSample {
                id: sample_id(&id),
                position,
                value: trust_score,
                timestamp: Some(self.time_ms()),
                source: "oracle".to_string(),
            },
        );
        self.agents.insert(id.clone(), GroundTruthAgent { agent, velocity });
        id
    }

    /// Spawns an agent with random position, velocity and trust.
    pub fn spawn_random_agent(&mut self) -> String {
        let position = Vector3::new(
            self.physics_rng.gen_range(-500.0..500.0),
            self.physics_rng.gen_range(-500.0..500.0),
            self.physics_rng.gen_range(0.0..100.0),
        );
        let velocity = Vector3::new(
            self.physics_rng.gen_range(-5.0..5.0),
            self.physics_rng.gen_range(-5.0..5.0),
            0.0,
        );
        let trust = self.physics_rng.gen_range(40.0..95.0);
        self.spawn_agent(position, velocity, trust)
    }

    /// Removes an agent and its trust sample.
    ///
    /// There is no delete message on the wire: removals only reach clients
    /// through the next bulk resync.
    pub fn remove_agent(&mut self, id: &str) -> bool {
        let removed = self.agents.remove(id).is_some();
        if removed {
            self.samples.remove(&sample_id(id));
            for other in self.agents.values_mut() {
                other.agent.connections.remove(id);
            }
        }
        removed
    }

    /// Removes the oldest agent, if any. Returns its id.
    pub fn remove_oldest_agent(&mut self) -> Option<String> {
        let id = self.agents.keys().next().cloned()?;
        self.remove_agent(&id);
        Some(id)
    }

    /// Advances the world by `dt` seconds and returns the updates to push.
    pub fn step(&mut self, dt: f64) -> Vec<UpdateEvent> {
        self.current_time += dt;
        let now_ms = self.time_ms();
        let mut events = Vec::with_capacity(self.agents.len() + 3);

        let walk = Normal::new(0.0, self.trust_noise_std * dt.max(0.0).sqrt()).ok();

        for entry in self.agents.values_mut() {
            let agent = &mut entry.agent;
            agent.position += entry.velocity * dt;
            let drift = walk.as_ref().map(|w| w.sample(&mut self.physics_rng)).unwrap_or(0.0);
            agent.trust_score = (agent.trust_score + drift).clamp(TRUST_MIN, TRUST_MAX);
            agent.last_update = Some(now_ms);

            let mut delta = AgentDelta::new(agent.id.clone())
                .with_position(agent.position)
                .with_trust_score(agent.trust_score);

            if self.physics_rng.gen::<f64>() < 0.002 {
                agent.status = next_status(agent.status);
                delta = delta.with_status(agent.status);
            }
            events.push(UpdateEvent::Agents(EntityUpdate::Delta(delta)));
        }

        // One trust sample refresh per step
        if !self.agents.is_empty() {
            let index = self.physics_rng.gen_range(0..self.agents.len());
            if let Some(entry) = self.agents.values().nth(index) {
                let id = sample_id(&entry.agent.id);
                if let Some(sample) = self.samples.get_mut(&id) {
                    sample.position = entry.agent.position;
                    sample.value = entry.agent.trust_score;
                    sample.timestamp = Some(now_ms);

                    let mut delta = TrustDelta::new(id).with_value(sample.value);
                    delta.position = Some(sample.position);
                    delta.timestamp = Some(now_ms);
                    events.push(UpdateEvent::TrustScores(EntityUpdate::Delta(delta)));
                }
            }
        }

        if self.physics_rng.gen::<f64>() < self.anomaly_rate {
            let anomaly = self.raise_anomaly();
            events.push(UpdateEvent::AnomalyAlert(anomaly));
        }

        // Tolerate accumulated float error in dt sums
        if self.current_time - self.last_status_at >= 1.0 - 1e-9 {
            self.last_status_at = self.current_time;
            events.push(UpdateEvent::Simulation(self.snapshot()));
        }

        events
    }

    fn raise_anomaly(&mut self) -> Anomaly {
        let severity = match self.physics_rng.gen_range(0..4) {
            0 => Severity::Low,
            1 => Severity::Medium,
            2 => Severity::High,
            _ => Severity::Critical,
        };
        let position = self
            .agents
            .values()
            .next()
            .map(|entry| entry.agent.position)
            .unwrap_or_else(Vector3::zeros);

        let anomaly = Anomaly {
            id: format!("anomaly-{:04}", self.next_anomaly),
            kind: "trust_drop".to_string(),
            severity,
            position,
            description: format!("trust drop detected at t={:.1}s", self.current_time),
        };
        self.next_anomaly += 1;

        if self.anomalies.len() >= ANOMALY_HISTORY {
            self.anomalies.remove(0);
        }
        self.anomalies.push(anomaly.clone());
        anomaly
    }

    /// Authoritative simulation status.
    pub fn snapshot(&self) -> SimulationSnapshot {
        let active = self
            .agents
            .values()
            .filter(|entry| entry.agent.status == AgentStatus::Active)
            .count();
        let total_connections = self
            .agents
            .values()
            .map(|entry| entry.agent.connections.len())
            .sum::<usize>();
        let average_trust_score = if self.agents.is_empty() {
            0.0
        } else {
            self.agents.values().map(|entry| entry.agent.trust_score).sum::<f64>() / self.agents.len() as f64
        };

        SimulationSnapshot {
            status: if self.anomalies.is_empty() {
                SimulationStatus::Running
            } else {
                SimulationStatus::AnomalyDetected
            },
            timestamp: self.time_ms(),
            active_agent_count: active as u64,
            total_connections: total_connections as u64,
            average_trust_score,
            anomalies: self.anomalies.clone(),
        }
    }

    /// The full-state messages a server sends right after a connection opens.
    pub fn resync_events(&self) -> Vec<UpdateEvent> {
        vec![
            UpdateEvent::Simulation(self.snapshot()),
            UpdateEvent::Agents(EntityUpdate::Bulk(self.agents().cloned().collect())),
            UpdateEvent::TrustScores(EntityUpdate::Bulk(self.samples.values().cloned().collect())),
        ]
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values().map(|entry| &entry.agent)
    }

    pub fn agent(&self, id: &str) -> Option<&GroundTruthAgent> {
        self.agents.get(id)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Returns the current simulation time (seconds).
    pub fn time(&self) -> f64 {
        self.current_time
    }

    /// Returns the current simulation time in wire units (ms).
    pub fn time_ms(&self) -> f64 {
        self.current_time * 1000.0
    }

    /// Compares a mirrored store against ground truth.
    ///
    /// Returns the first divergence found, or `None` if the mirror matches.
    pub fn divergence(&self, mirror: &StoreSnapshot) -> Option<String> {
        if mirror.agents.len() != self.agents.len() {
            let stale: Vec<&String> = mirror.agents.keys().filter(|id| !self.agents.contains_key(*id)).collect();
            return Some(format!(
                "agent count {} != {} (stale: {:?})",
                mirror.agents.len(),
                self.agents.len(),
                stale
            ));
        }

        for (id, truth) in &self.agents {
            let Some(mirrored) = mirror.agent(id) else {
                return Some(format!("agent {} missing from mirror", id));
            };
            let truth = &truth.agent;
            if (mirrored.trust_score - truth.trust_score).abs() > CONVERGENCE_EPSILON {
                return Some(format!(
                    "agent {} trust {:.6} != {:.6}",
                    id, mirrored.trust_score, truth.trust_score
                ));
            }
            if (mirrored.position - truth.position).norm() > CONVERGENCE_EPSILON {
                return Some(format!("agent {} position diverged", id));
            }
            if mirrored.status != truth.status {
                return Some(format!("agent {} status {:?} != {:?}", id, mirrored.status, truth.status));
            }
            if mirrored.connections != truth.connections {
                return Some(format!("agent {} connections diverged", id));
            }
        }

        if mirror.trust_scores.len() != self.samples.len() {
            return Some(format!(
                "trust sample count {} != {}",
                mirror.trust_scores.len(),
                self.samples.len()
            ));
        }
        for (id, truth) in &self.samples {
            match mirror.trust_score(id) {
                Some(sample) if (sample.value - truth.value).abs() <= CONVERGENCE_EPSILON => {}
                Some(sample) => {
                    return Some(format!("trust sample {} value {:.6} != {:.6}", id, sample.value, truth.value))
                }
                None => return Some(format!("trust sample {} missing from mirror", id)),
            }
        }

        None
    }
}

fn sample_id(agent_id: &str) -> String {
    format!("ts-{}", agent_id)
}

fn next_status(status: AgentStatus) -> AgentStatus {
    match status {
        AgentStatus::Active => AgentStatus::Inactive,
        AgentStatus::Inactive => AgentStatus::Suspended,
        AgentStatus::Suspended => AgentStatus::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use trustmirror_core::StateStore;

    #[test]
    fn test_oracle_spawn_agent() {
        let mut oracle = Oracle::new(42);

        let id = oracle.spawn_agent(Vector3::new(100.0, 200.0, 50.0), Vector3::new(10.0, 0.0, 0.0), 80.0);

        let entry = oracle.agent(&id).unwrap();
        assert_eq!(entry.agent.position.x, 100.0);
        assert_eq!(entry.agent.trust_score, 80.0);
        assert_eq!(oracle.agent_count(), 1);
    }

    #[test]
    fn test_oracle_kinematics_step() {
        let mut oracle = Oracle::new(42);
        let id = oracle.spawn_agent(Vector3::zeros(), Vector3::new(20.0, 0.0, 0.0), 50.0);

        oracle.step(1.0);

        let entry = oracle.agent(&id).unwrap();
        assert!((entry.agent.position.x - 20.0).abs() < 0.001);
    }

    #[test]
    fn test_oracle_is_deterministic() {
        let mut a = Oracle::with_population(42, 8);
        let mut b = Oracle::with_population(42, 8);

        for _ in 0..50 {
            assert_eq!(a.step(0.1), b.step(0.1));
        }
    }

    #[test]
    fn test_status_update_once_per_second() {
        let mut oracle = Oracle::with_population(1, 3);
        oracle.set_anomaly_rate(0.0);

        let status_updates = (0..30)
            .flat_map(|_| oracle.step(0.1))
            .filter(|event| matches!(event, UpdateEvent::Simulation(_)))
            .count();
        assert_eq!(status_updates, 3);
    }

    #[test]
    fn test_resync_then_deltas_converge() {
        let mut oracle = Oracle::with_population(7, 10);
        let store = StateStore::new();

        for event in oracle.resync_events() {
            store.apply(&event);
        }
        for _ in 0..100 {
            for event in oracle.step(0.1) {
                store.apply(&event);
            }
        }

        assert_eq!(oracle.divergence(&store.snapshot()), None);
    }

    #[test]
    fn test_removal_requires_resync() {
        let mut oracle = Oracle::with_population(7, 5);
        let store = StateStore::new();
        for event in oracle.resync_events() {
            store.apply(&event);
        }

        let removed = oracle.remove_oldest_agent().unwrap();
        let reason = oracle.divergence(&store.snapshot()).unwrap();
        assert!(reason.contains(&removed), "{}", reason);

        for event in oracle.resync_events() {
            store.apply(&event);
        }
        assert_eq!(oracle.divergence(&store.snapshot()), None);
    }

    proptest! {
        #[test]
        fn trust_walk_stays_in_range(seed in any::<u64>(), steps in 1usize..200) {
            let mut oracle = Oracle::with_population(seed, 4);
            for _ in 0..steps {
                oracle.step(0.5);
            }
            for agent in oracle.agents() {
                prop_assert!((TRUST_MIN..=TRUST_MAX).contains(&agent.trust_score));
            }
        }
    }
}
