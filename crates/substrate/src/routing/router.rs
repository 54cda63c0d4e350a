use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RouterConfig;
use crate::routing::PheromoneField;
use crate::types::AgentId;

/// Unit of work to route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub concept: String,
    pub content: String,
}

impl Task {
    pub fn new(concept: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            concept: concept.into(),
            content: content.into(),
        }
    }
}

/// Where a task was sent and why
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub agent_id: AgentId,
    /// Decayed intensity of the signal that won; `None` for the fallback agent
    pub score: Option<f64>,
    /// The agent was picked at random rather than by strength
    pub explored: bool,
}

/// Epsilon-greedy router over a pheromone field
///
/// Exploits the strongest live signal with probability `1 - exploration_rate`
/// and otherwise picks uniformly among agents with live signals. Falls back
/// to the default agent when the field is empty.
pub struct CategoricalRouter {
    field: Arc<PheromoneField>,
    exploration_rate: f64,
    default_agent: AgentId,
    rng: Mutex<SmallRng>,
}

impl CategoricalRouter {
    pub fn new(
        field: Arc<PheromoneField>,
        exploration_rate: f64,
        default_agent: impl Into<AgentId>,
    ) -> Self {
        let exploration_rate = if exploration_rate.is_nan() {
            0.0
        } else {
            exploration_rate.clamp(0.0, 1.0)
        };
        Self {
            field,
            exploration_rate,
            default_agent: default_agent.into(),
            rng: Mutex::new(SmallRng::from_os_rng()),
        }
    }

    pub fn from_config(field: Arc<PheromoneField>, config: &RouterConfig) -> Self {
        Self::new(field, config.exploration_rate, config.default_agent.as_str())
    }

    /// Use a fixed seed so exploration is reproducible
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn exploration_rate(&self) -> f64 {
        self.exploration_rate
    }

    pub fn default_agent(&self) -> &AgentId {
        &self.default_agent
    }

    pub fn route(&self, task: &Task) -> RoutingDecision {
        let signals = self.field.sense(Some(&task.concept));
        let Some(strongest) = signals.first() else {
            debug!(concept = %task.concept, agent = %self.default_agent, "No live signals, using default agent");
            return RoutingDecision {
                agent_id: self.default_agent.clone(),
                score: None,
                explored: false,
            };
        };

        let explore = self.exploration_rate > 0.0
            && self.rng.lock().random::<f64>() < self.exploration_rate;

        let decision = if explore {
            let mut depositors: Vec<&AgentId> = signals.iter().map(|p| &p.depositor).collect();
            depositors.sort();
            depositors.dedup();
            let pick = self.rng.lock().random_range(0..depositors.len());
            let agent_id = depositors[pick].clone();
            // Signals are strongest first, so the first match is this agent's best
            let score = signals
                .iter()
                .find(|p| p.depositor == agent_id)
                .map(|p| p.intensity);
            RoutingDecision {
                agent_id,
                score,
                explored: true,
            }
        } else {
            RoutingDecision {
                agent_id: strongest.depositor.clone(),
                score: Some(strongest.intensity),
                explored: false,
            }
        };

        debug!(
            concept = %task.concept,
            agent = %decision.agent_id,
            explored = decision.explored,
            "Routed task"
        );
        decision
    }
}
