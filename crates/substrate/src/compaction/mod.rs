//! Pressure-triggered compaction
//!
//! Reduces the pattern count of allocations whose usage crosses the policy's
//! pressure threshold, at most `max_compactions_per_hour` times per target.

pub mod compactor;
pub mod daemon;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CompactionConfig;
use crate::error::{Result, SubstrateError};
use crate::types::AgentId;

pub use compactor::Compactor;
pub use daemon::{
    AutoCompactionDaemon, CompactionFailure, ScanReport, apply_pressure_based_strategy,
};

/// How near-duplicate patterns are folded together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Keep the representative's embedding unchanged
    #[default]
    Absorb,
    /// Replace the representative's embedding with the mass-weighted centroid
    Centroid,
}

impl FromStr for MergeStrategy {
    type Err = SubstrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "absorb" => Ok(Self::Absorb),
            "centroid" => Ok(Self::Centroid),
            other => Err(SubstrateError::Config(format!(
                "Unknown merge strategy: {other}"
            ))),
        }
    }
}

/// When and how hard to compact
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPolicy {
    /// Usage ratio at or above which compaction runs (default: 0.8)
    pub pressure_threshold: f32,
    /// Compactions allowed per target in any rolling hour (default: 4)
    pub max_compactions_per_hour: u32,
    /// Cosine similarity at or above which patterns merge (default: 0.95)
    pub merge_similarity: f32,
    /// Usage ratio to bring a compacted allocation down to (default: 0.6)
    pub target_ratio: f32,
    /// Merge strategy (default: Absorb)
    pub strategy: MergeStrategy,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            pressure_threshold: 0.8,
            max_compactions_per_hour: 4,
            merge_similarity: 0.95,
            target_ratio: 0.6,
            strategy: MergeStrategy::Absorb,
        }
    }
}

impl CompactionPolicy {
    pub fn new(pressure_threshold: f32, max_compactions_per_hour: u32) -> Self {
        Self {
            pressure_threshold,
            max_compactions_per_hour,
            ..Default::default()
        }
    }

    pub fn with_merge_similarity(mut self, merge_similarity: f32) -> Self {
        self.merge_similarity = merge_similarity.clamp(-1.0, 1.0);
        self
    }

    pub fn with_target_ratio(mut self, target_ratio: f32) -> Self {
        self.target_ratio = target_ratio.max(0.0);
        self
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn from_config(config: &CompactionConfig) -> Result<Self> {
        Ok(Self::new(config.pressure_threshold, config.max_compactions_per_hour)
            .with_merge_similarity(config.merge_similarity)
            .with_target_ratio(config.target_ratio)
            .with_strategy(config.strategy.parse()?))
    }
}

/// Record of one compaction run against one allocation
#[derive(Debug, Clone, Serialize)]
pub struct CompactionEvent {
    /// Agent whose allocation was compacted
    pub target_id: AgentId,
    pub patterns_before: usize,
    pub patterns_after: usize,
    /// Patterns folded into a near-duplicate
    pub merged: usize,
    /// Patterns dropped to relieve pressure
    pub elided: usize,
    /// Every survivor is still retrievable by its old embedding, in the same order
    pub patterns_preserved: bool,
    pub timestamp: DateTime<Utc>,
}

impl CompactionEvent {
    /// Number of patterns removed
    pub fn affected(&self) -> usize {
        self.patterns_before.saturating_sub(self.patterns_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = CompactionPolicy::default();
        assert_eq!(policy.pressure_threshold, 0.8);
        assert_eq!(policy.max_compactions_per_hour, 4);
        assert_eq!(policy.merge_similarity, 0.95);
        assert_eq!(policy.target_ratio, 0.6);
        assert_eq!(policy.strategy, MergeStrategy::Absorb);
    }

    #[test]
    fn test_policy_from_config() {
        let config = CompactionConfig {
            strategy: "Centroid".to_string(),
            pressure_threshold: 0.5,
            ..Default::default()
        };
        let policy = CompactionPolicy::from_config(&config).unwrap();
        assert_eq!(policy.strategy, MergeStrategy::Centroid);
        assert_eq!(policy.pressure_threshold, 0.5);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!("shred".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_event_affected() {
        let event = CompactionEvent {
            target_id: AgentId::from("a"),
            patterns_before: 90,
            patterns_after: 60,
            merged: 10,
            elided: 20,
            patterns_preserved: true,
            timestamp: Utc::now(),
        };
        assert_eq!(event.affected(), 30);
    }
}
