//! Crystal compaction
//!
//! Compaction runs in two passes over an allocation's crystal:
//! 1. Merge: near-duplicate patterns (cosine >= `merge_similarity`) are folded
//!    into the most relevant member of their group.
//! 2. Elide: if the crystal is still above the target usage, the least
//!    relevant patterns are dropped until it is not.
//!
//! Afterwards the result is checked: every survivor must still be retrievable
//! by its pre-compaction embedding, with survivors ranked in the same order.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::compaction::{CompactionEvent, CompactionPolicy, MergeStrategy};
use crate::crystal::{Crystal, cosine_similarity};
use crate::error::Result;
use crate::substrate::{Allocation, AllocationHandle};
use crate::types::{AgentId, ConceptId};

/// Length of the rolling rate-limit window
pub const RATE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Tolerance for floating point noise when comparing self-similarity
const SIMILARITY_EPSILON: f32 = 1e-5;

/// Compacts allocations under pressure, rate-limited per target
pub struct Compactor {
    policy: CompactionPolicy,
    /// Monotonic timestamps of recent compactions, per target
    history: DashMap<AgentId, VecDeque<Instant>>,
}

impl Compactor {
    pub fn new(policy: CompactionPolicy) -> Self {
        Self {
            policy,
            history: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// Whether the allocation's usage has reached the pressure threshold
    pub fn is_under_pressure(&self, allocation: &Allocation) -> bool {
        allocation.usage_ratio() >= self.policy.pressure_threshold
    }

    /// Compactions recorded for `target` within the last hour
    pub fn compactions_in_window(&self, target: &AgentId) -> usize {
        let now = Instant::now();
        self.history
            .get(target)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|at| now.duration_since(**at) < RATE_WINDOW)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Reserve a compaction slot for `target` if the hourly budget allows
    fn try_acquire_slot(&self, target: &AgentId) -> bool {
        let now = Instant::now();
        let mut entries = self.history.entry(target.clone()).or_default();

        while entries
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= RATE_WINDOW)
        {
            entries.pop_front();
        }

        if entries.len() >= self.policy.max_compactions_per_hour as usize {
            return false;
        }
        entries.push_back(now);
        true
    }

    /// Forget rate-limit history for a target that no longer exists
    pub fn forget_target(&self, target: &AgentId) {
        self.history.remove(target);
    }

    /// Compact one allocation if it is under pressure and within its hourly budget
    ///
    /// Holds the allocation's write lock for the duration of the call.
    ///
    /// # Returns
    /// * `Ok(Some(event))` if a compaction ran
    /// * `Ok(None)` below the pressure threshold or when rate-limited
    /// * `Err` if the allocation was retired or the crystal is inconsistent
    pub async fn compact_allocation(
        &self,
        handle: &AllocationHandle,
    ) -> Result<Option<CompactionEvent>> {
        let mut allocation = handle.write().await;
        allocation.ensure_live()?;

        if !self.is_under_pressure(&allocation) {
            return Ok(None);
        }

        let target_id = allocation.agent_id().clone();
        if !self.try_acquire_slot(&target_id) {
            tracing::debug!(agent = %target_id, "Compaction skipped: hourly limit reached");
            return Ok(None);
        }

        let max_patterns = allocation.quota().max_patterns;
        let event = self.compact_crystal(&target_id, allocation.crystal_mut(), max_patterns)?;
        Ok(Some(event))
    }

    /// Run both compaction passes over a crystal, ignoring pressure and rate limits
    pub fn compact_crystal(
        &self,
        target_id: &AgentId,
        crystal: &mut Crystal,
        max_patterns: usize,
    ) -> Result<CompactionEvent> {
        let before = crystal.clone();
        let patterns_before = crystal.len();

        let merged = self.merge_near_duplicates(crystal);
        let elided = self.elide_to_target(crystal, max_patterns);
        let patterns_preserved = self.verify_preserved(&before, crystal)?;

        let event = CompactionEvent {
            target_id: target_id.clone(),
            patterns_before,
            patterns_after: crystal.len(),
            merged,
            elided,
            patterns_preserved,
            timestamp: Utc::now(),
        };

        tracing::info!(
            agent = %target_id,
            before = event.patterns_before,
            after = event.patterns_after,
            merged,
            elided,
            preserved = patterns_preserved,
            "Compacted allocation"
        );

        Ok(event)
    }

    /// Largest pattern count that relieves pressure for a quota
    ///
    /// Never at or above the pressure threshold, so a triggered compaction
    /// always makes progress.
    pub fn target_count(&self, max_patterns: usize) -> usize {
        let max = max_patterns as f32;
        let wanted = (max * self.policy.target_ratio).floor() as usize;
        let below_pressure = ((max * self.policy.pressure_threshold).ceil() as usize).saturating_sub(1);
        wanted.min(below_pressure)
    }

    fn merge_near_duplicates(&self, crystal: &mut Crystal) -> usize {
        let mut order: Vec<(ConceptId, f32)> = crystal
            .iter()
            .map(|(id, concept)| (id.clone(), concept.relevance))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut absorbed: HashSet<ConceptId> = HashSet::new();
        let mut merged = 0;

        for (i, (rep_id, _)) in order.iter().enumerate() {
            if absorbed.contains(rep_id) {
                continue;
            }
            let (rep_embedding, rep_mass, rep_relevance) = match crystal.get(rep_id) {
                Some(c) => (c.embedding.clone(), c.mass, c.relevance),
                None => continue,
            };

            let group: Vec<ConceptId> = order[i + 1..]
                .iter()
                .filter(|(id, _)| !absorbed.contains(id))
                .filter(|(id, _)| {
                    crystal.get(id).is_some_and(|c| {
                        cosine_similarity(&rep_embedding, &c.embedding)
                            >= self.policy.merge_similarity
                    })
                })
                .map(|(id, _)| id.clone())
                .collect();

            if group.is_empty() {
                continue;
            }

            let mut mass = rep_mass;
            let mut relevance = rep_relevance;
            let mut weighted: Vec<f32> = rep_embedding.iter().map(|x| x * rep_mass as f32).collect();

            for id in group {
                if let Some(concept) = crystal.remove(&id) {
                    mass += concept.mass;
                    relevance = relevance.max(concept.relevance);
                    for (w, x) in weighted.iter_mut().zip(&concept.embedding) {
                        *w += x * concept.mass as f32;
                    }
                    absorbed.insert(id);
                    merged += 1;
                }
            }

            if let Some(rep) = crystal.get_mut(rep_id) {
                rep.mass = mass;
                rep.relevance = relevance;
                if self.policy.strategy == MergeStrategy::Centroid {
                    rep.embedding = weighted.iter().map(|w| w / mass as f32).collect();
                }
            }
        }

        merged
    }

    fn elide_to_target(&self, crystal: &mut Crystal, max_patterns: usize) -> usize {
        let target = self.target_count(max_patterns);
        if crystal.len() <= target {
            return 0;
        }

        let excess = crystal.len() - target;
        let mut elided = 0;
        for id in crystal.least_relevant_first().into_iter().take(excess) {
            if crystal.remove(&id).is_some() {
                elided += 1;
            }
        }
        elided
    }

    fn verify_preserved(&self, before: &Crystal, after: &Crystal) -> Result<bool> {
        let survivors: HashSet<&ConceptId> = after.iter().map(|(id, _)| id).collect();

        for (id, _) in after.iter() {
            let Some(original) = before.get(id) else {
                return Ok(false);
            };
            let query = &original.embedding;

            let before_order: Vec<ConceptId> = before
                .retrieve(query, f32::NEG_INFINITY)?
                .into_iter()
                .filter(|(c, _)| survivors.contains(c))
                .map(|(c, _)| c)
                .collect();
            let after_results = after.retrieve(query, f32::NEG_INFINITY)?;

            let self_similarity = after_results
                .iter()
                .find(|(c, _)| c == id)
                .map(|(_, s)| *s)
                .unwrap_or(f32::NEG_INFINITY);
            if self_similarity + SIMILARITY_EPSILON < self.policy.merge_similarity.min(1.0) {
                return Ok(false);
            }

            let after_order: Vec<ConceptId> = after_results.into_iter().map(|(c, _)| c).collect();
            if before_order != after_order {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{LifecyclePolicy, Quota};
    use crate::testing::{seeded_vector, unit_vector};

    const DIM: usize = 16;

    fn filled_allocation(count: usize, max_patterns: usize) -> AllocationHandle {
        let mut allocation = Allocation::new(
            AgentId::from("agent"),
            DIM,
            Quota::new(max_patterns),
            LifecyclePolicy::default(),
            "compaction test",
        );
        for i in 0..count {
            allocation
                .store(
                    format!("p{i:03}"),
                    Vec::new(),
                    seeded_vector(i as u64 + 1, DIM),
                )
                .unwrap();
        }
        allocation.into_handle()
    }

    mod pressure {
        use super::*;

        #[tokio::test]
        async fn test_below_threshold_is_noop() {
            let handle = filled_allocation(40, 100);
            let compactor = Compactor::new(CompactionPolicy::new(0.5, 4));

            let event = compactor.compact_allocation(&handle).await.unwrap();
            assert!(event.is_none());
            assert_eq!(handle.read().await.pattern_count(), 40);
        }

        #[tokio::test]
        async fn test_above_threshold_reduces_count() {
            let handle = filled_allocation(90, 100);
            let compactor = Compactor::new(CompactionPolicy::new(0.5, 4));

            let event = compactor.compact_allocation(&handle).await.unwrap().unwrap();

            assert_eq!(event.patterns_before, 90);
            assert!(event.patterns_after < 90);
            assert!(event.affected() > 0);
            assert!(event.patterns_preserved);
            assert_eq!(handle.read().await.pattern_count(), event.patterns_after);
            assert!(handle.read().await.usage_ratio() < 0.5);
        }

        #[test]
        fn test_target_count_stays_below_threshold() {
            let compactor = Compactor::new(CompactionPolicy::new(0.5, 4).with_target_ratio(0.9));
            assert_eq!(compactor.target_count(100), 49);

            let compactor = Compactor::new(CompactionPolicy::new(0.8, 4).with_target_ratio(0.6));
            assert_eq!(compactor.target_count(100), 60);
        }
    }

    mod merging {
        use super::*;

        fn near_duplicate_crystal() -> Crystal {
            let mut crystal = Crystal::new(DIM);
            crystal
                .store_with_relevance("keep", b"keep".to_vec(), unit_vector(DIM, 0), 0.9)
                .unwrap();
            let mut nudged = unit_vector(DIM, 0);
            nudged[1] = 0.05;
            crystal
                .store_with_relevance("dup", b"dup".to_vec(), nudged, 0.4)
                .unwrap();
            crystal
                .store_with_relevance("other", b"other".to_vec(), unit_vector(DIM, 5), 0.4)
                .unwrap();
            crystal
        }

        #[test]
        fn test_absorb_folds_duplicates_into_most_relevant() {
            let compactor = Compactor::new(CompactionPolicy::default().with_target_ratio(1.0));
            let mut crystal = near_duplicate_crystal();

            let event = compactor
                .compact_crystal(&AgentId::from("a"), &mut crystal, 100)
                .unwrap();

            assert_eq!(event.merged, 1);
            assert_eq!(event.elided, 0);
            assert_eq!(crystal.len(), 2);
            let keep = crystal.get(&ConceptId::from("keep")).unwrap();
            assert_eq!(keep.mass, 2);
            assert_eq!(keep.embedding, unit_vector(DIM, 0));
            assert!(!crystal.contains(&ConceptId::from("dup")));
            assert!(event.patterns_preserved);
        }

        #[test]
        fn test_centroid_moves_representative() {
            let compactor = Compactor::new(
                CompactionPolicy::default()
                    .with_target_ratio(1.0)
                    .with_strategy(MergeStrategy::Centroid),
            );
            let mut crystal = near_duplicate_crystal();

            compactor
                .compact_crystal(&AgentId::from("a"), &mut crystal, 100)
                .unwrap();

            let keep = crystal.get(&ConceptId::from("keep")).unwrap();
            assert_eq!(keep.mass, 2);
            assert!((keep.embedding[1] - 0.025).abs() < 1e-6);
        }

        #[test]
        fn test_dissimilar_patterns_are_not_merged() {
            let compactor = Compactor::new(CompactionPolicy::default().with_target_ratio(1.0));
            let mut crystal = Crystal::new(DIM);
            for axis in 0..4 {
                crystal
                    .store(format!("axis{axis}"), Vec::new(), unit_vector(DIM, axis))
                    .unwrap();
            }

            let event = compactor
                .compact_crystal(&AgentId::from("a"), &mut crystal, 100)
                .unwrap();
            assert_eq!(event.merged, 0);
            assert_eq!(crystal.len(), 4);
        }
    }

    mod elision {
        use super::*;

        #[test]
        fn test_elides_least_relevant() {
            let compactor = Compactor::new(CompactionPolicy::new(0.5, 4).with_target_ratio(0.2));
            let mut crystal = Crystal::new(DIM);
            for i in 0..8 {
                crystal
                    .store_with_relevance(
                        format!("c{i}"),
                        Vec::new(),
                        unit_vector(DIM, i),
                        i as f32 / 10.0,
                    )
                    .unwrap();
            }

            let event = compactor
                .compact_crystal(&AgentId::from("a"), &mut crystal, 10)
                .unwrap();

            assert_eq!(event.elided, 6);
            assert_eq!(crystal.len(), 2);
            assert!(crystal.contains(&ConceptId::from("c7")));
            assert!(crystal.contains(&ConceptId::from("c6")));
            assert!(event.patterns_preserved);
        }
    }

    mod rate_limit {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_hourly_limit_enforced() {
            let compactor = Compactor::new(CompactionPolicy::new(0.5, 2).with_target_ratio(0.0));
            let target = AgentId::from("agent");

            let mut performed = 0;
            for _ in 0..5 {
                let handle = filled_allocation(90, 100);
                if compactor.compact_allocation(&handle).await.unwrap().is_some() {
                    performed += 1;
                }
            }

            assert_eq!(performed, 2);
            assert_eq!(compactor.compactions_in_window(&target), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_window_rolls_forward() {
            let compactor = Compactor::new(CompactionPolicy::new(0.5, 1));

            let handle = filled_allocation(90, 100);
            assert!(compactor.compact_allocation(&handle).await.unwrap().is_some());

            let handle = filled_allocation(90, 100);
            assert!(compactor.compact_allocation(&handle).await.unwrap().is_none());

            tokio::time::advance(Duration::from_secs(59 * 60)).await;
            assert!(compactor.compact_allocation(&handle).await.unwrap().is_none());

            tokio::time::advance(Duration::from_secs(61)).await;
            assert!(compactor.compact_allocation(&handle).await.unwrap().is_some());
        }

        #[tokio::test]
        async fn test_zero_budget_never_compacts() {
            let compactor = Compactor::new(CompactionPolicy::new(0.5, 0));
            let handle = filled_allocation(90, 100);
            assert!(compactor.compact_allocation(&handle).await.unwrap().is_none());
            assert_eq!(handle.read().await.pattern_count(), 90);
        }
    }

    #[tokio::test]
    async fn test_retired_allocation_is_an_error() {
        let handle = filled_allocation(90, 100);
        handle.write().await.take_crystal();

        let compactor = Compactor::new(CompactionPolicy::new(0.5, 4));
        assert!(compactor.compact_allocation(&handle).await.is_err());
    }
}
