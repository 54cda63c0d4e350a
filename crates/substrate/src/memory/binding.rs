//! Which crystal an associative memory writes its patterns into

use tokio::sync::{RwLockReadGuard, RwLockWriteGuard};

use crate::crystal::Crystal;
use crate::error::{Result, SubstrateError};
use crate::substrate::{
    Allocation, AllocationHandle, DedicatedCrystal, DedicatedHandle, SharedSubstrate,
};
use crate::types::{AgentId, ConceptId};

/// The crystal backing an [`AssociativeMemory`](crate::memory::AssociativeMemory)
#[derive(Debug, Clone)]
pub enum CrystalBinding {
    /// A quota-bounded allocation in the shared pool
    Shared(AllocationHandle),
    /// A promoted, quota-free crystal
    Dedicated(DedicatedHandle),
}

impl CrystalBinding {
    /// Bind to whatever the agent currently holds in the substrate
    pub async fn for_agent(substrate: &SharedSubstrate, agent_id: &AgentId) -> Result<Self> {
        match substrate.allocation(agent_id).await {
            Ok(handle) => Ok(Self::Shared(handle)),
            Err(SubstrateError::AllocationNotFound(_)) => {
                Ok(Self::Dedicated(substrate.dedicated(agent_id).await?))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn read(&self) -> BoundRead<'_> {
        match self {
            Self::Shared(handle) => BoundRead::Shared(handle.read().await),
            Self::Dedicated(handle) => BoundRead::Dedicated(handle.read().await),
        }
    }

    pub(crate) async fn write(&self) -> BoundWrite<'_> {
        match self {
            Self::Shared(handle) => BoundWrite::Shared(handle.write().await),
            Self::Dedicated(handle) => BoundWrite::Dedicated(handle.write().await),
        }
    }
}

impl From<AllocationHandle> for CrystalBinding {
    fn from(handle: AllocationHandle) -> Self {
        Self::Shared(handle)
    }
}

impl From<DedicatedHandle> for CrystalBinding {
    fn from(handle: DedicatedHandle) -> Self {
        Self::Dedicated(handle)
    }
}

pub(crate) enum BoundRead<'a> {
    Shared(RwLockReadGuard<'a, Allocation>),
    Dedicated(RwLockReadGuard<'a, DedicatedCrystal>),
}

impl BoundRead<'_> {
    pub(crate) fn crystal(&self) -> &Crystal {
        match self {
            Self::Shared(allocation) => allocation.crystal(),
            Self::Dedicated(dedicated) => dedicated.crystal(),
        }
    }

    pub(crate) fn record_access(&self) {
        match self {
            Self::Shared(allocation) => allocation.record_access(),
            Self::Dedicated(dedicated) => dedicated.record_access(),
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        let (retired, agent_id) = match self {
            Self::Shared(allocation) => (allocation.is_retired(), allocation.agent_id()),
            Self::Dedicated(dedicated) => (dedicated.is_retired(), dedicated.agent_id()),
        };
        if retired {
            return Err(SubstrateError::AllocationRetired(agent_id.clone()));
        }
        Ok(())
    }
}

pub(crate) enum BoundWrite<'a> {
    Shared(RwLockWriteGuard<'a, Allocation>),
    Dedicated(RwLockWriteGuard<'a, DedicatedCrystal>),
}

impl BoundWrite<'_> {
    /// Store a pattern, subject to the allocation's quota when shared
    pub(crate) fn store(
        &mut self,
        concept_id: ConceptId,
        embedding: Vec<f32>,
        relevance: f32,
    ) -> Result<()> {
        match self {
            Self::Shared(allocation) => {
                allocation.store_with_relevance(concept_id, Vec::new(), embedding, relevance)
            }
            Self::Dedicated(dedicated) => {
                dedicated.store_with_relevance(concept_id, Vec::new(), embedding, relevance)
            }
        }
    }

    pub(crate) fn remove(&mut self, concept_id: &ConceptId) -> Result<bool> {
        match self {
            Self::Shared(allocation) => allocation.remove(concept_id),
            Self::Dedicated(dedicated) => dedicated.remove(concept_id),
        }
    }

    /// Returns false if the concept is no longer in the crystal
    pub(crate) fn set_relevance(&mut self, concept_id: &ConceptId, relevance: f32) -> bool {
        let crystal = match self {
            Self::Shared(allocation) => allocation.crystal_mut(),
            Self::Dedicated(dedicated) => dedicated.crystal_mut(),
        };
        crystal.set_relevance(concept_id, relevance)
    }
}
