use std::time::Duration;

use crate::config::PromotionConfig;
use crate::substrate::Allocation;

/// Thresholds an allocation must meet before it can be promoted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotionPolicy {
    /// Minimum number of recorded accesses
    pub access_frequency_threshold: u64,
    /// Minimum time since the allocation was created
    pub min_age: Duration,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            access_frequency_threshold: 100,
            min_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PromotionPolicy {
    pub fn new(access_frequency_threshold: u64, min_age: Duration) -> Self {
        Self {
            access_frequency_threshold,
            min_age,
        }
    }

    pub fn from_config(config: &PromotionConfig) -> Self {
        let hours = if config.min_age_hours.is_finite() {
            config.min_age_hours.max(0.0)
        } else {
            0.0
        };
        // Ages too large for a Duration never pass
        let min_age = Duration::try_from_secs_f64(hours * 3600.0).unwrap_or(Duration::MAX);
        Self::new(config.access_frequency_threshold, min_age)
    }

    /// Check an allocation against the policy, returning why it is not eligible
    pub fn check(&self, allocation: &Allocation) -> Result<(), String> {
        let accesses = allocation.access_count();
        if accesses < self.access_frequency_threshold {
            return Err(format!(
                "{accesses} accesses, {} required",
                self.access_frequency_threshold
            ));
        }

        let age = allocation.age();
        if age < self.min_age {
            return Err(format!(
                "allocation is {}s old, {}s required",
                age.as_secs(),
                self.min_age.as_secs()
            ));
        }

        Ok(())
    }
}
