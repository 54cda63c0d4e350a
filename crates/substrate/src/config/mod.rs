use serde::Deserialize;

use crate::error::{Result, SubstrateError};

/// Main configuration structure for the substrate
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Allocation defaults
    #[serde(default)]
    pub substrate: SubstrateConfig,
    /// Compaction policy and daemon schedule
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Promotion thresholds
    #[serde(default)]
    pub promotion: PromotionConfig,
    /// Associative memory tuning
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Pheromone decay
    #[serde(default)]
    pub pheromone: PheromoneConfig,
    /// Task routing
    #[serde(default)]
    pub router: RouterConfig,
}

impl Config {
    /// Parse a TOML document, applying defaults for anything omitted
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| SubstrateError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the substrate misbehave
    pub fn validate(&self) -> Result<()> {
        if self.substrate.dimension == 0 {
            return Err(SubstrateError::Config(
                "substrate.dimension must be greater than 0".to_string(),
            ));
        }
        if self.substrate.default_max_patterns == 0 {
            return Err(SubstrateError::Config(
                "substrate.default_max_patterns must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.router.exploration_rate) {
            return Err(SubstrateError::Config(format!(
                "router.exploration_rate must be within 0.0-1.0, got {}",
                self.router.exploration_rate
            )));
        }
        for (name, value) in [
            ("compaction.pressure_threshold", f64::from(self.compaction.pressure_threshold)),
            ("compaction.merge_similarity", f64::from(self.compaction.merge_similarity)),
            ("compaction.target_ratio", f64::from(self.compaction.target_ratio)),
            ("promotion.min_age_hours", self.promotion.min_age_hours),
            ("memory.baseline_relevance", f64::from(self.memory.baseline_relevance)),
            ("memory.reinforcement", f64::from(self.memory.reinforcement)),
            ("memory.dormant_threshold", f64::from(self.memory.dormant_threshold)),
            ("memory.demote_threshold", f64::from(self.memory.demote_threshold)),
            ("pheromone.half_life_secs", self.pheromone.half_life_secs),
            ("pheromone.min_intensity", self.pheromone.min_intensity),
        ] {
            if !value.is_finite() {
                return Err(SubstrateError::Config(format!(
                    "{name} must be a finite number, got {value}"
                )));
            }
        }
        if self.compaction.pressure_threshold <= 0.0 {
            return Err(SubstrateError::Config(
                "compaction.pressure_threshold must be positive".to_string(),
            ));
        }
        if self.promotion.min_age_hours < 0.0 {
            return Err(SubstrateError::Config(
                "promotion.min_age_hours must not be negative".to_string(),
            ));
        }
        if self.pheromone.half_life_secs <= 0.0 {
            return Err(SubstrateError::Config(
                "pheromone.half_life_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Allocation defaults
#[derive(Debug, Clone, Deserialize)]
pub struct SubstrateConfig {
    /// Embedding dimension of every crystal
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Quota given to allocations created without an explicit one
    #[serde(default = "default_max_patterns")]
    pub default_max_patterns: usize,
    /// Idle time after which a shared allocation is reaped (none = never)
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            default_max_patterns: default_max_patterns(),
            default_ttl_secs: None,
        }
    }
}

fn default_dimension() -> usize {
    384
}

fn default_max_patterns() -> usize {
    1000
}

/// Compaction policy and daemon schedule
#[derive(Debug, Clone, Deserialize)]
pub struct CompactionConfig {
    /// Usage ratio at or above which an allocation is compacted
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f32,
    /// Maximum compactions per target in any rolling hour
    #[serde(default = "default_max_compactions_per_hour")]
    pub max_compactions_per_hour: u32,
    /// Cosine similarity at or above which two patterns are merged
    #[serde(default = "default_merge_similarity")]
    pub merge_similarity: f32,
    /// Usage ratio compaction tries to bring an allocation down to
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f32,
    /// Merge strategy: "absorb" or "centroid"
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Seconds between daemon scans
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            pressure_threshold: default_pressure_threshold(),
            max_compactions_per_hour: default_max_compactions_per_hour(),
            merge_similarity: default_merge_similarity(),
            target_ratio: default_target_ratio(),
            strategy: default_strategy(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

fn default_pressure_threshold() -> f32 {
    0.8
}

fn default_max_compactions_per_hour() -> u32 {
    4
}

fn default_merge_similarity() -> f32 {
    0.95
}

fn default_target_ratio() -> f32 {
    0.6
}

fn default_strategy() -> String {
    "absorb".to_string()
}

fn default_scan_interval_secs() -> u64 {
    60
}

/// Promotion thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct PromotionConfig {
    /// Accesses required before an allocation may be promoted
    #[serde(default = "default_access_frequency_threshold")]
    pub access_frequency_threshold: u64,
    /// Minimum allocation age in hours
    #[serde(default = "default_min_age_hours")]
    pub min_age_hours: f64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            access_frequency_threshold: default_access_frequency_threshold(),
            min_age_hours: default_min_age_hours(),
        }
    }
}

fn default_access_frequency_threshold() -> u64 {
    100
}

fn default_min_age_hours() -> f64 {
    24.0
}

/// Associative memory tuning
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Relevance given to freshly remembered memories
    #[serde(default = "default_baseline_relevance")]
    pub baseline_relevance: f32,
    /// Relevance added each time a memory is recalled
    #[serde(default = "default_reinforcement")]
    pub reinforcement: f32,
    /// Active memories below this relevance go dormant during consolidation
    #[serde(default = "default_dormant_threshold")]
    pub dormant_threshold: f32,
    /// Dormant memories below this relevance start composting
    #[serde(default = "default_demote_threshold")]
    pub demote_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            baseline_relevance: default_baseline_relevance(),
            reinforcement: default_reinforcement(),
            dormant_threshold: default_dormant_threshold(),
            demote_threshold: default_demote_threshold(),
        }
    }
}

fn default_baseline_relevance() -> f32 {
    0.5
}

fn default_reinforcement() -> f32 {
    0.05
}

fn default_dormant_threshold() -> f32 {
    0.3
}

fn default_demote_threshold() -> f32 {
    0.1
}

/// Pheromone decay
#[derive(Debug, Clone, Deserialize)]
pub struct PheromoneConfig {
    /// Seconds for a signal to lose half its intensity
    #[serde(default = "default_half_life_secs")]
    pub half_life_secs: f64,
    /// Intensity below which a signal is considered gone
    #[serde(default = "default_min_intensity")]
    pub min_intensity: f64,
}

impl Default for PheromoneConfig {
    fn default() -> Self {
        Self {
            half_life_secs: default_half_life_secs(),
            min_intensity: default_min_intensity(),
        }
    }
}

fn default_half_life_secs() -> f64 {
    300.0
}

fn default_min_intensity() -> f64 {
    0.01
}

/// Task routing
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Probability of picking a random known depositor (0.0-1.0)
    #[serde(default = "default_exploration_rate")]
    pub exploration_rate: f64,
    /// Agent used when the field holds no live signal
    #[serde(default = "default_agent")]
    pub default_agent: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            exploration_rate: default_exploration_rate(),
            default_agent: default_agent(),
        }
    }
}

fn default_exploration_rate() -> f64 {
    0.1
}

fn default_agent() -> String {
    "default".to_string()
}
