//! Pheromone field: an append-only log of decaying signals
//!
//! Decay is computed when the field is read, so no timer runs per signal.
//! A signal of intensity `i` deposited `t` ago reads as
//! `i * 0.5^(t / half_life)` and is live while that stays at or above
//! `min_intensity`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::PheromoneConfig;
use crate::types::AgentId;

const MIN_HALF_LIFE: Duration = Duration::from_millis(1);

/// A concept-tagged signal left by an agent
#[derive(Debug, Clone, Serialize)]
pub struct Pheromone {
    pub concept: String,
    /// Deposited intensity, or the decayed intensity when returned by `sense`
    pub intensity: f64,
    pub depositor: AgentId,
    /// Wall-clock deposit time, for display only
    pub timestamp: DateTime<Utc>,
    /// Monotonic deposit time, drives decay
    #[serde(skip)]
    pub deposited_at: Instant,
}

pub struct PheromoneField {
    half_life: Duration,
    min_intensity: f64,
    trail: RwLock<Vec<Pheromone>>,
}

impl PheromoneField {
    pub fn new(half_life: Duration, min_intensity: f64) -> Self {
        Self {
            half_life: half_life.max(MIN_HALF_LIFE),
            min_intensity: min_intensity.max(0.0),
            trail: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &PheromoneConfig) -> Self {
        let half_life = Duration::try_from_secs_f64(config.half_life_secs)
            .unwrap_or(Duration::from_secs(300));
        Self::new(half_life, config.min_intensity)
    }

    pub fn half_life(&self) -> Duration {
        self.half_life
    }

    pub fn min_intensity(&self) -> f64 {
        self.min_intensity
    }

    /// Leave a signal. Non-positive or non-finite intensities are ignored.
    pub fn deposit(
        &self,
        concept: impl Into<String>,
        intensity: f64,
        depositor: impl Into<AgentId>,
    ) -> bool {
        if !intensity.is_finite() || intensity <= 0.0 {
            return false;
        }

        let pheromone = Pheromone {
            concept: concept.into(),
            intensity,
            depositor: depositor.into(),
            timestamp: Utc::now(),
            deposited_at: Instant::now(),
        };
        tracing::trace!(
            concept = %pheromone.concept,
            depositor = %pheromone.depositor,
            intensity,
            "Pheromone deposited"
        );
        self.trail.write().push(pheromone);
        true
    }

    fn decayed(&self, pheromone: &Pheromone, now: Instant) -> f64 {
        let age = now.saturating_duration_since(pheromone.deposited_at);
        let half_lives = age.as_secs_f64() / self.half_life.as_secs_f64();
        pheromone.intensity * 0.5_f64.powf(half_lives)
    }

    /// Live signals with their decayed intensity, strongest first
    ///
    /// The concept is accepted for call-site symmetry but does not scope the
    /// result: the strongest signal in the whole field comes first whatever
    /// is asked for.
    pub fn sense(&self, _concept: Option<&str>) -> Vec<Pheromone> {
        let now = Instant::now();
        let mut live: Vec<Pheromone> = self
            .trail
            .read()
            .iter()
            .filter_map(|pheromone| {
                let intensity = self.decayed(pheromone, now);
                (intensity >= self.min_intensity).then(|| Pheromone {
                    intensity,
                    ..pheromone.clone()
                })
            })
            .collect();

        live.sort_by(|a, b| {
            b.intensity
                .total_cmp(&a.intensity)
                .then_with(|| a.depositor.cmp(&b.depositor))
                .then_with(|| a.concept.cmp(&b.concept))
        });
        live
    }

    /// Drop fully decayed signals from the log, returning how many went
    pub fn evaporate(&self) -> usize {
        let now = Instant::now();
        let mut trail = self.trail.write();
        let before = trail.len();
        trail.retain(|pheromone| self.decayed(pheromone, now) >= self.min_intensity);
        before - trail.len()
    }

    /// Agents with at least one live signal, sorted
    pub fn depositors(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self
            .sense(None)
            .into_iter()
            .map(|pheromone| pheromone.depositor)
            .collect();
        agents.sort();
        agents.dedup();
        agents
    }

    /// Entries in the log, including ones not yet evaporated
    pub fn len(&self) -> usize {
        self.trail.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trail.read().is_empty()
    }
}
