//! Shared substrate: the registry of allocations and dedicated crystals
//!
//! Every agent is in exactly one of three states: unallocated, holding a
//! shared [`Allocation`], or holding a [`DedicatedCrystal`]. Both maps sit
//! behind one lock so that `allocate`, `promote`, `demote` and `release` see
//! a consistent picture.
//!
//! Lock order is always registry first, then allocation.

mod allocation;
mod promotion;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::compaction::{CompactionPolicy, Compactor};
use crate::config::Config;
use crate::error::{Result, SubstrateError};
use crate::types::{AgentId, ConceptId};

pub use allocation::{
    Allocation, AllocationHandle, AllocationInfo, DedicatedCrystal, DedicatedHandle,
    LifecyclePolicy, Quota,
};
pub use promotion::PromotionPolicy;

#[derive(Default)]
struct Registry {
    allocations: HashMap<AgentId, AllocationHandle>,
    dedicated: HashMap<AgentId, DedicatedHandle>,
}

/// Point-in-time counters for the whole substrate
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubstrateStats {
    pub shared_allocations: usize,
    pub dedicated_crystals: usize,
    /// Patterns held by shared allocations
    pub shared_patterns: usize,
    /// Patterns held by dedicated crystals
    pub dedicated_patterns: usize,
    /// Shared allocations at or above the pressure threshold
    pub pressured_allocations: usize,
}

/// Owns every agent's allocation or dedicated crystal
pub struct SharedSubstrate {
    registry: RwLock<Registry>,
    dimension: usize,
    default_quota: Quota,
    default_ttl: Option<Duration>,
    promotion_policy: PromotionPolicy,
    compactor: Arc<Compactor>,
}

impl SharedSubstrate {
    pub fn new(
        dimension: usize,
        default_quota: Quota,
        promotion_policy: PromotionPolicy,
        compaction_policy: CompactionPolicy,
    ) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            dimension,
            default_quota,
            default_ttl: None,
            promotion_policy,
            compactor: Arc::new(Compactor::new(compaction_policy)),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let substrate = Self::new(
            config.substrate.dimension,
            Quota::new(config.substrate.default_max_patterns),
            PromotionPolicy::from_config(&config.promotion),
            CompactionPolicy::from_config(&config.compaction)?,
        );
        Ok(substrate.with_default_ttl(config.substrate.default_ttl_secs.map(Duration::from_secs)))
    }

    /// Idle time after which new allocations may be reaped
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn default_quota(&self) -> Quota {
        self.default_quota
    }

    pub fn promotion_policy(&self) -> &PromotionPolicy {
        &self.promotion_policy
    }

    pub fn compactor(&self) -> Arc<Compactor> {
        self.compactor.clone()
    }

    fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            ttl: self.default_ttl,
        }
    }

    /// Create an empty allocation for `agent_id`
    ///
    /// Fails if the agent already holds an allocation or a dedicated crystal.
    pub async fn allocate(
        &self,
        agent_id: AgentId,
        quota: Option<Quota>,
        human_label: impl Into<String>,
    ) -> Result<AllocationHandle> {
        let mut registry = self.registry.write().await;

        if registry.allocations.contains_key(&agent_id) {
            return Err(SubstrateError::AlreadyAllocated(agent_id));
        }
        if registry.dedicated.contains_key(&agent_id) {
            return Err(SubstrateError::AlreadyDedicated(agent_id));
        }

        let quota = quota.unwrap_or(self.default_quota);
        let handle = Allocation::new(
            agent_id.clone(),
            self.dimension,
            quota,
            self.lifecycle_policy(),
            human_label,
        )
        .into_handle();

        registry.allocations.insert(agent_id.clone(), handle.clone());
        info!(agent = %agent_id, max_patterns = quota.max_patterns, "Allocated");

        Ok(handle)
    }

    pub async fn allocation(&self, agent_id: &AgentId) -> Result<AllocationHandle> {
        self.registry
            .read()
            .await
            .allocations
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SubstrateError::AllocationNotFound(agent_id.clone()))
    }

    pub async fn dedicated(&self, agent_id: &AgentId) -> Result<DedicatedHandle> {
        self.registry
            .read()
            .await
            .dedicated
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SubstrateError::DedicatedNotFound(agent_id.clone()))
    }

    /// Handles of every shared allocation, ordered by agent id
    pub async fn allocation_handles(&self) -> Vec<(AgentId, AllocationHandle)> {
        let registry = self.registry.read().await;
        let mut handles: Vec<(AgentId, AllocationHandle)> = registry
            .allocations
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    /// Snapshot of every shared allocation, ordered by agent id
    pub async fn allocations(&self) -> Vec<AllocationInfo> {
        let mut infos = Vec::new();
        for (_, handle) in self.allocation_handles().await {
            let allocation = handle.read().await;
            if !allocation.is_retired() {
                infos.push(allocation.info());
            }
        }
        infos
    }

    /// Agents holding a shared allocation, sorted
    pub async fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.registry.read().await.allocations.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Agents holding a dedicated crystal, sorted
    pub async fn dedicated_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.registry.read().await.dedicated.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Compact an allocation if it is under pressure
    ///
    /// Returns the number of patterns removed; 0 below the threshold or
    /// when the hourly limit has been reached.
    pub async fn compact(&self, handle: &AllocationHandle) -> Result<usize> {
        Ok(self
            .compactor
            .compact_allocation(handle)
            .await?
            .map(|event| event.affected())
            .unwrap_or(0))
    }

    /// Store a pattern into an agent's allocation, compacting as needed
    ///
    /// A full allocation is compacted before the store; one left at or above
    /// the pressure threshold is compacted after it.
    pub async fn store_pattern(
        &self,
        agent_id: &AgentId,
        concept_id: impl Into<ConceptId>,
        content: Vec<u8>,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let handle = self.allocation(agent_id).await?;
        let concept_id = concept_id.into();

        let needs_room = {
            let allocation = handle.read().await;
            !allocation.crystal().contains(&concept_id)
                && allocation.pattern_count() >= allocation.quota().max_patterns
        };
        if needs_room {
            debug!(agent = %agent_id, "Allocation full, compacting before store");
            self.compact(&handle).await?;
        }

        handle.write().await.store(concept_id, content, embedding)?;

        let pressured = {
            let allocation = handle.read().await;
            self.compactor.is_under_pressure(&allocation)
        };
        if pressured {
            self.compact(&handle).await?;
        }

        Ok(())
    }

    /// Move an agent's crystal out of the shared pool into a dedicated crystal
    ///
    /// The old allocation handle is retired; further writes through it fail.
    pub async fn promote(&self, agent_id: &AgentId) -> Result<DedicatedHandle> {
        let mut registry = self.registry.write().await;

        let handle = registry
            .allocations
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SubstrateError::AllocationNotFound(agent_id.clone()))?;

        let mut allocation = handle.write().await;
        if let Err(reason) = self.promotion_policy.check(&allocation) {
            debug!(agent = %agent_id, %reason, "Promotion refused");
            return Err(SubstrateError::PromotionNotEligible {
                agent_id: agent_id.clone(),
                reason,
            });
        }

        let dedicated = DedicatedCrystal::from_allocation(&mut allocation);
        let patterns = dedicated.pattern_count();
        let dedicated = dedicated.into_handle();
        drop(allocation);

        registry.allocations.remove(agent_id);
        registry.dedicated.insert(agent_id.clone(), dedicated.clone());
        self.compactor.forget_target(agent_id);

        info!(agent = %agent_id, patterns, "Promoted to dedicated crystal");
        Ok(dedicated)
    }

    /// Return a dedicated crystal to the shared pool
    ///
    /// `compress_ratio` (clamped to 0.0-1.0) of the patterns are dropped,
    /// least relevant first. The new quota is the default quota or the
    /// remaining pattern count, whichever is larger.
    pub async fn demote(&self, agent_id: &AgentId, compress_ratio: f32) -> Result<AllocationHandle> {
        let mut registry = self.registry.write().await;

        let handle = registry
            .dedicated
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SubstrateError::DedicatedNotFound(agent_id.clone()))?;

        let mut dedicated = handle.write().await;
        let human_label = dedicated.human_label().to_string();
        let mut crystal = dedicated.take_crystal();
        drop(dedicated);

        let ratio = if compress_ratio.is_nan() {
            0.0
        } else {
            compress_ratio.clamp(0.0, 1.0)
        };
        let before = crystal.len();
        let drop_count = (before as f32 * ratio).floor() as usize;
        for id in crystal.least_relevant_first().into_iter().take(drop_count) {
            crystal.remove(&id);
        }

        let quota = Quota::new(self.default_quota.max_patterns.max(crystal.len()));
        let allocation = Allocation::from_crystal(
            agent_id.clone(),
            crystal,
            quota,
            self.lifecycle_policy(),
            human_label,
        );
        let patterns = allocation.pattern_count();
        let allocation = allocation.into_handle();

        registry.dedicated.remove(agent_id);
        registry.allocations.insert(agent_id.clone(), allocation.clone());

        info!(
            agent = %agent_id,
            before,
            after = patterns,
            max_patterns = quota.max_patterns,
            "Demoted to shared allocation"
        );
        Ok(allocation)
    }

    /// Drop an agent's shared allocation. Returns false if it has none.
    pub async fn release(&self, agent_id: &AgentId) -> bool {
        let mut registry = self.registry.write().await;
        let Some(handle) = registry.allocations.remove(agent_id) else {
            return false;
        };
        handle.write().await.take_crystal();
        self.compactor.forget_target(agent_id);
        info!(agent = %agent_id, "Released allocation");
        true
    }

    /// Release every shared allocation idle for longer than its TTL
    pub async fn reap_expired(&self) -> Vec<AgentId> {
        let mut registry = self.registry.write().await;

        let mut expired = Vec::new();
        for (agent_id, handle) in &registry.allocations {
            if handle.read().await.is_expired() {
                expired.push(agent_id.clone());
            }
        }
        expired.sort();

        for agent_id in &expired {
            if let Some(handle) = registry.allocations.remove(agent_id) {
                handle.write().await.take_crystal();
                self.compactor.forget_target(agent_id);
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Reaped expired allocations");
        }
        expired
    }

    pub async fn stats(&self) -> SubstrateStats {
        let registry = self.registry.read().await;
        let mut stats = SubstrateStats {
            shared_allocations: registry.allocations.len(),
            dedicated_crystals: registry.dedicated.len(),
            ..Default::default()
        };

        for handle in registry.allocations.values() {
            let allocation = handle.read().await;
            stats.shared_patterns += allocation.pattern_count();
            if self.compactor.is_under_pressure(&allocation) {
                stats.pressured_allocations += 1;
            }
        }
        for handle in registry.dedicated.values() {
            stats.dedicated_patterns += handle.read().await.pattern_count();
        }

        stats
    }
}
