//! Active inference over concept value
//!
//! An [`ActiveInferenceAgent`] keeps a belief distribution over which
//! concepts are worth keeping. Every observation of a concept scales its
//! mass up by how surprising the observation was, so rarely seen concepts
//! gain quickly in relative terms and familiar ones saturate.

pub mod guided;

use std::collections::HashMap;

use serde::Serialize;

use crate::types::ConceptId;

pub use guided::{Action, AppliedActions, GuidedAction, GuidedCrystal, apply_actions};

/// Lowest prior any concept is assumed to have, so surprise stays finite
pub const PRIOR_FLOOR: f64 = 1e-3;

pub const DEFAULT_LEARNING_RATE: f64 = 0.5;

/// Access cost assumed for concepts with no recorded cost
pub const DEFAULT_COST: f64 = 1.0;

/// Probability distribution over concepts
#[derive(Debug, Clone, Default, Serialize)]
pub struct Belief {
    distribution: HashMap<ConceptId, f64>,
}

impl Belief {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn distribution(&self) -> &HashMap<ConceptId, f64> {
        &self.distribution
    }

    /// Probability of a concept; 0.0 if it was never observed
    pub fn probability(&self, concept: &ConceptId) -> f64 {
        self.distribution.get(concept).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.distribution.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distribution.is_empty()
    }

    fn renormalize(&mut self) {
        let total: f64 = self.distribution.values().sum();
        if total > 0.0 {
            for mass in self.distribution.values_mut() {
                *mass /= total;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CostStats {
    mean: f64,
    samples: u64,
}

/// Learns which concepts matter from observed accesses and their cost
#[derive(Debug, Clone)]
pub struct ActiveInferenceAgent {
    belief: Belief,
    learning_rate: f64,
    costs: HashMap<ConceptId, CostStats>,
    observations: u64,
}

impl Default for ActiveInferenceAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveInferenceAgent {
    pub fn new() -> Self {
        Self {
            belief: Belief::new(),
            learning_rate: DEFAULT_LEARNING_RATE,
            costs: HashMap::new(),
            observations: 0,
        }
    }

    /// Non-positive or non-finite rates fall back to the default
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = if learning_rate.is_finite() && learning_rate > 0.0 {
            learning_rate
        } else {
            DEFAULT_LEARNING_RATE
        };
        self
    }

    pub fn belief(&self) -> &Belief {
        &self.belief
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    /// Update the belief after seeing `concept`, returning the surprise
    ///
    /// The concept's mass is scaled by `1 + learning_rate * -ln(prior)`
    /// before the distribution is renormalized.
    pub fn observe(&mut self, concept: impl Into<ConceptId>) -> f64 {
        let concept = concept.into();
        let prior = self.belief.probability(&concept).max(PRIOR_FLOOR);
        let surprise = -prior.ln();

        let mass = self.belief.distribution.entry(concept).or_insert(PRIOR_FLOOR);
        *mass *= 1.0 + self.learning_rate * surprise;
        self.belief.renormalize();

        self.observations += 1;
        surprise
    }

    /// Fold one observed access cost into the concept's running mean.
    /// Returns false for non-positive or non-finite costs.
    pub fn record_cost(&mut self, concept: impl Into<ConceptId>, cost: f64) -> bool {
        if !cost.is_finite() || cost <= 0.0 {
            return false;
        }

        let stats = self.costs.entry(concept.into()).or_insert(CostStats {
            mean: 0.0,
            samples: 0,
        });
        stats.samples += 1;
        stats.mean += (cost - stats.mean) / stats.samples as f64;
        true
    }

    /// Mean observed cost, or [`DEFAULT_COST`]
    pub fn cost(&self, concept: &ConceptId) -> f64 {
        self.costs
            .get(concept)
            .map(|stats| stats.mean)
            .unwrap_or(DEFAULT_COST)
    }
}
