//! Allocations and dedicated crystals
//!
//! An [`Allocation`] is an agent's quota-bounded share of the substrate.
//! A [`DedicatedCrystal`] is what an allocation becomes after promotion:
//! the same crystal, moved out of the quota system.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::crystal::{Crystal, DEFAULT_CONCEPT_RELEVANCE};
use crate::error::{Result, SubstrateError};
use crate::inference::{AppliedActions, GuidedAction, apply_actions};
use crate::types::{AgentId, ConceptId};

/// Shared, lockable reference to an allocation
pub type AllocationHandle = Arc<RwLock<Allocation>>;

/// Shared, lockable reference to a dedicated crystal
pub type DedicatedHandle = Arc<RwLock<DedicatedCrystal>>;

/// Pattern quota of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub max_patterns: usize,
}

impl Quota {
    /// A zero quota is bumped to one so usage ratios stay finite
    pub fn new(max_patterns: usize) -> Self {
        Self {
            max_patterns: max_patterns.max(1),
        }
    }
}

/// Retention policy of an allocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Idle time after which the allocation may be reaped
    pub ttl: Option<Duration>,
}

/// Monotonic access bookkeeping shared by allocations and dedicated crystals
#[derive(Debug)]
struct AccessStats {
    count: AtomicU64,
    origin: Instant,
    /// Milliseconds since `origin` of the latest access
    last_ms: AtomicU64,
}

impl AccessStats {
    fn new(initial_count: u64) -> Self {
        Self {
            count: AtomicU64::new(initial_count),
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn age(&self) -> Duration {
        self.origin.elapsed()
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// A quota-bounded, agent-owned share of the substrate backed by one crystal
#[derive(Debug)]
pub struct Allocation {
    agent_id: AgentId,
    crystal: Crystal,
    quota: Quota,
    lifecycle_policy: LifecyclePolicy,
    human_label: String,
    created_at: DateTime<Utc>,
    access: AccessStats,
    retired: bool,
}

impl Allocation {
    /// Create an allocation with an empty crystal
    pub fn new(
        agent_id: AgentId,
        dimension: usize,
        quota: Quota,
        lifecycle_policy: LifecyclePolicy,
        human_label: impl Into<String>,
    ) -> Self {
        Self::from_crystal(
            agent_id,
            Crystal::new(dimension),
            quota,
            lifecycle_policy,
            human_label,
        )
    }

    /// Build an allocation around an existing crystal. The quota is not
    /// checked here; an over-full allocation is left to compaction.
    pub fn from_crystal(
        agent_id: AgentId,
        crystal: Crystal,
        quota: Quota,
        lifecycle_policy: LifecyclePolicy,
        human_label: impl Into<String>,
    ) -> Self {
        Self {
            agent_id,
            crystal,
            quota,
            lifecycle_policy,
            human_label: human_label.into(),
            created_at: Utc::now(),
            access: AccessStats::new(0),
            retired: false,
        }
    }

    /// Wrap into a shareable handle
    pub fn into_handle(self) -> AllocationHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn crystal(&self) -> &Crystal {
        &self.crystal
    }

    pub(crate) fn crystal_mut(&mut self) -> &mut Crystal {
        &mut self.crystal
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        self.lifecycle_policy
    }

    pub fn human_label(&self) -> &str {
        &self.human_label
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pattern_count(&self) -> usize {
        self.crystal.len()
    }

    pub fn usage_ratio(&self) -> f32 {
        self.pattern_count() as f32 / self.quota.max_patterns as f32
    }

    pub fn access_count(&self) -> u64 {
        self.access.count()
    }

    /// Count one access. Safe under a shared lock.
    pub fn record_access(&self) {
        self.access.record();
    }

    /// Time since the allocation was created (monotonic)
    pub fn age(&self) -> Duration {
        self.access.age()
    }

    /// Time since the last recorded access, or since creation
    pub fn idle_for(&self) -> Duration {
        self.access.idle_for()
    }

    /// Whether the allocation has been idle longer than its TTL
    pub fn is_expired(&self) -> bool {
        self.lifecycle_policy
            .ttl
            .is_some_and(|ttl| self.idle_for() >= ttl)
    }

    /// A retired allocation has had its crystal moved elsewhere
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Store a pattern; new patterns get the default relevance, overwrites keep theirs
    pub fn store(
        &mut self,
        concept_id: impl Into<ConceptId>,
        content: Vec<u8>,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let concept_id = concept_id.into();
        let relevance = self
            .crystal
            .get(&concept_id)
            .map_or(DEFAULT_CONCEPT_RELEVANCE, |c| c.relevance);
        self.store_with_relevance(concept_id, content, embedding, relevance)
    }

    /// Store a pattern. New patterns are refused once the quota is full;
    /// overwrites of existing ids are always allowed.
    pub fn store_with_relevance(
        &mut self,
        concept_id: impl Into<ConceptId>,
        content: Vec<u8>,
        embedding: Vec<f32>,
        relevance: f32,
    ) -> Result<()> {
        self.ensure_live()?;

        let concept_id = concept_id.into();
        if !self.crystal.contains(&concept_id) && self.pattern_count() >= self.quota.max_patterns
        {
            return Err(SubstrateError::QuotaExceeded {
                agent_id: self.agent_id.clone(),
                max_patterns: self.quota.max_patterns,
            });
        }

        self.crystal
            .store_with_relevance(concept_id, content, embedding, relevance)?;
        self.record_access();
        Ok(())
    }

    /// Query the crystal, counting the access
    pub fn retrieve(&self, query: &[f32], threshold: f32) -> Result<Vec<(ConceptId, f32)>> {
        self.ensure_live()?;
        self.record_access();
        self.crystal.retrieve(query, threshold)
    }

    pub fn remove(&mut self, concept_id: &ConceptId) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.crystal.remove(concept_id).is_some())
    }

    /// Apply belief-guided actions to the crystal's relevance
    pub fn apply_actions(&mut self, actions: &[GuidedAction], step: f32) -> Result<AppliedActions> {
        self.ensure_live()?;
        Ok(apply_actions(&mut self.crystal, actions, step))
    }

    /// Move the crystal out, leaving this allocation retired
    pub(crate) fn take_crystal(&mut self) -> Crystal {
        self.retired = true;
        let dimension = self.crystal.dimension();
        std::mem::replace(&mut self.crystal, Crystal::new(dimension))
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.retired {
            return Err(SubstrateError::AllocationRetired(self.agent_id.clone()));
        }
        Ok(())
    }

    /// Serializable view for reporting
    pub fn info(&self) -> AllocationInfo {
        AllocationInfo {
            agent_id: self.agent_id.clone(),
            human_label: self.human_label.clone(),
            pattern_count: self.pattern_count(),
            max_patterns: self.quota.max_patterns,
            usage_ratio: self.usage_ratio(),
            access_count: self.access_count(),
            age_secs: self.age().as_secs(),
            created_at: self.created_at,
        }
    }
}

/// Point-in-time summary of an allocation
#[derive(Debug, Clone, Serialize)]
pub struct AllocationInfo {
    pub agent_id: AgentId,
    pub human_label: String,
    pub pattern_count: usize,
    pub max_patterns: usize,
    pub usage_ratio: f32,
    pub access_count: u64,
    pub age_secs: u64,
    pub created_at: DateTime<Utc>,
}

/// A promoted allocation's crystal, owned by one agent outside any quota
#[derive(Debug)]
pub struct DedicatedCrystal {
    agent_id: AgentId,
    crystal: Crystal,
    human_label: String,
    promoted_at: DateTime<Utc>,
    access: AccessStats,
    retired: bool,
}

impl DedicatedCrystal {
    /// Take the crystal out of `allocation`, retiring it
    pub(crate) fn from_allocation(allocation: &mut Allocation) -> Self {
        let access_count = allocation.access_count();
        Self {
            agent_id: allocation.agent_id.clone(),
            human_label: allocation.human_label.clone(),
            crystal: allocation.take_crystal(),
            promoted_at: Utc::now(),
            access: AccessStats::new(access_count),
            retired: false,
        }
    }

    pub fn into_handle(self) -> DedicatedHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn crystal(&self) -> &Crystal {
        &self.crystal
    }

    pub(crate) fn crystal_mut(&mut self) -> &mut Crystal {
        &mut self.crystal
    }

    pub fn human_label(&self) -> &str {
        &self.human_label
    }

    pub fn promoted_at(&self) -> DateTime<Utc> {
        self.promoted_at
    }

    pub fn pattern_count(&self) -> usize {
        self.crystal.len()
    }

    /// Access count, including accesses made before promotion
    pub fn access_count(&self) -> u64 {
        self.access.count()
    }

    pub fn record_access(&self) {
        self.access.record();
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Store a pattern; dedicated crystals have no quota
    pub fn store_with_relevance(
        &mut self,
        concept_id: impl Into<ConceptId>,
        content: Vec<u8>,
        embedding: Vec<f32>,
        relevance: f32,
    ) -> Result<()> {
        self.ensure_live()?;
        self.crystal
            .store_with_relevance(concept_id, content, embedding, relevance)?;
        self.record_access();
        Ok(())
    }

    pub fn retrieve(&self, query: &[f32], threshold: f32) -> Result<Vec<(ConceptId, f32)>> {
        self.ensure_live()?;
        self.record_access();
        self.crystal.retrieve(query, threshold)
    }

    pub fn remove(&mut self, concept_id: &ConceptId) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.crystal.remove(concept_id).is_some())
    }

    pub fn apply_actions(&mut self, actions: &[GuidedAction], step: f32) -> Result<AppliedActions> {
        self.ensure_live()?;
        Ok(apply_actions(&mut self.crystal, actions, step))
    }

    pub(crate) fn take_crystal(&mut self) -> Crystal {
        self.retired = true;
        let dimension = self.crystal.dimension();
        std::mem::replace(&mut self.crystal, Crystal::new(dimension))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.retired {
            return Err(SubstrateError::AllocationRetired(self.agent_id.clone()));
        }
        Ok(())
    }
}
