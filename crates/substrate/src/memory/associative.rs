//! Associative memory over a crystal and a blob store
//!
//! Content goes to the blob store, the embedding goes into the bound crystal
//! under the datum id, and the index tracks lifecycle, relevance and access
//! statistics per memory. Recall reinforces what it returns using atomics, so
//! concurrent recalls only ever need a shared lock on the index.
//!
//! The crystal copy of each pattern's relevance follows the index: composting
//! memories sit at zero, everything else at its index relevance. Compaction
//! and lossy demotion rank by that copy.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compaction::Compactor;
use crate::config::MemoryConfig;
use crate::crystal::cosine_similarity;
use crate::embedding::Embedder;
use crate::error::{Result, SubstrateError};
use crate::memory::binding::CrystalBinding;
use crate::memory::types::{
    ConsolidationReport, Lifecycle, Memory, MemoryStatus, Query, RecallResult,
};
use crate::storage::{BlobStore, Datum};
use crate::substrate::SharedSubstrate;
use crate::types::{AgentId, ConceptId, DatumId};

/// Resolution never degrades below this, keeping it strictly positive
pub const MIN_RESOLUTION: f32 = 0.01;

/// Long scans check for cancellation and yield every this many memories
pub const SCAN_YIELD_EVERY: usize = 256;

/// Live index entry. Reinforcement counters are atomics so recall can update
/// them under a read lock.
#[derive(Debug)]
struct MemoryCell {
    embedding: Vec<f32>,
    resolution: f32,
    lifecycle: Lifecycle,
    cherished: bool,
    created_at: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
    /// f32 bits
    relevance: AtomicU32,
    access_count: AtomicU64,
    /// Unix milliseconds
    last_accessed_ms: AtomicI64,
}

impl MemoryCell {
    fn new(embedding: Vec<f32>, relevance: f32, metadata: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            embedding,
            resolution: 1.0,
            lifecycle: Lifecycle::Active,
            cherished: false,
            created_at: now,
            metadata,
            relevance: AtomicU32::new(relevance.clamp(0.0, 1.0).to_bits()),
            access_count: AtomicU64::new(0),
            last_accessed_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn relevance(&self) -> f32 {
        f32::from_bits(self.relevance.load(Ordering::Relaxed))
    }

    /// Relevance mirrored into the crystal
    fn crystal_relevance(&self) -> f32 {
        if self.lifecycle == Lifecycle::Composting {
            0.0
        } else {
            self.relevance()
        }
    }

    fn set_relevance(&self, relevance: f32) {
        self.relevance
            .store(relevance.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn scale_relevance(&self, factor: f32) {
        let _ = self
            .relevance
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f32::from_bits(bits) * factor).clamp(0.0, 1.0).to_bits())
            });
    }

    /// Count an access and nudge relevance upward
    fn reinforce(&self, amount: f32) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .relevance
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f32::from_bits(bits) + amount).clamp(0.0, 1.0).to_bits())
            });
        self.last_accessed_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self, datum_id: DatumId) -> Memory {
        let last_accessed = DateTime::from_timestamp_millis(self.last_accessed_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at);
        Memory {
            datum_id,
            embedding: self.embedding.clone(),
            resolution: self.resolution,
            lifecycle: self.lifecycle,
            relevance: self.relevance(),
            created_at: self.created_at,
            last_accessed,
            access_count: self.access_count.load(Ordering::Relaxed),
            cherished: self.cherished,
            metadata: self.metadata.clone(),
        }
    }
}

/// Check cancellation and yield to other tasks every `SCAN_YIELD_EVERY` items
async fn checkpoint(scanned: usize, cancel: &CancellationToken) -> Result<()> {
    if scanned > 0 && scanned % SCAN_YIELD_EVERY == 0 {
        if cancel.is_cancelled() {
            return Err(SubstrateError::Cancelled);
        }
        tokio::task::yield_now().await;
    }
    Ok(())
}

/// Decrements the running-consolidation counter when dropped
struct ConsolidationGuard<'a>(&'a AtomicUsize);

impl Drop for ConsolidationGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Remember/recall/forget over a bound crystal
pub struct AssociativeMemory {
    binding: parking_lot::RwLock<CrystalBinding>,
    blob_store: Arc<dyn BlobStore>,
    embedder: Option<Arc<dyn Embedder>>,
    compactor: Option<Arc<Compactor>>,
    config: MemoryConfig,
    index: RwLock<HashMap<DatumId, MemoryCell>>,
    consolidations: AtomicUsize,
}

impl AssociativeMemory {
    pub fn new(
        binding: impl Into<CrystalBinding>,
        blob_store: Arc<dyn BlobStore>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            binding: parking_lot::RwLock::new(binding.into()),
            blob_store,
            embedder: None,
            compactor: None,
            config,
            index: RwLock::new(HashMap::new()),
            consolidations: AtomicUsize::new(0),
        }
    }

    /// Bind to the agent's current crystal and compact through the
    /// substrate's compactor
    pub async fn for_agent(
        substrate: &SharedSubstrate,
        agent_id: &AgentId,
        blob_store: Arc<dyn BlobStore>,
        config: MemoryConfig,
    ) -> Result<Self> {
        let binding = CrystalBinding::for_agent(substrate, agent_id).await?;
        Ok(Self::new(binding, blob_store, config).with_compactor(substrate.compactor()))
    }

    /// Embed text content and text queries with `embedder`
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Compact a shared allocation that is full or under pressure when
    /// remembering into it. Without a compactor a full allocation refuses
    /// new memories.
    pub fn with_compactor(mut self, compactor: Arc<Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The crystal currently backing this memory
    pub fn binding(&self) -> CrystalBinding {
        self.binding.read().clone()
    }

    /// Point at a different crystal, typically after the owning agent was
    /// promoted or demoted. Patterns are not copied; the new crystal is
    /// expected to already hold them.
    pub fn rebind(&self, binding: impl Into<CrystalBinding>) {
        *self.binding.write() = binding.into();
        info!("Memory rebound to a new crystal");
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.embedder {
            Some(embedder) => embedder.embed(text).await,
            None => Err(SubstrateError::Embedding(
                "No embedding supplied and no embedder configured".to_string(),
            )),
        }
    }

    /// Store content and index it as a new active memory
    ///
    /// The content is embedded (as lossy UTF-8) when no embedding is given.
    /// If the pattern cannot be stored in the crystal the blob is deleted
    /// again and the error returned.
    ///
    /// With a compactor, a full shared allocation is compacted before the
    /// store and one left under pressure is compacted after it. Memories
    /// whose patterns were compacted away (possibly including a new
    /// near-duplicate absorbed into an older pattern) are then evicted.
    pub async fn remember(
        &self,
        content: Vec<u8>,
        metadata: Option<BTreeMap<String, String>>,
        embedding: Option<Vec<f32>>,
    ) -> Result<DatumId> {
        let embedding = match embedding {
            Some(embedding) => embedding,
            None => self.embed(&String::from_utf8_lossy(&content)).await?,
        };
        let metadata = metadata.unwrap_or_default();
        let relevance = self.config.baseline_relevance;

        let datum_id = self
            .blob_store
            .put(Datum::new(content).with_metadata(metadata.clone()))
            .await?;

        let binding = self.binding();
        let concept_id = ConceptId::from(datum_id);
        let mut compacted = false;

        let stored = match self.make_room(&binding, &concept_id).await {
            Ok(made_room) => {
                compacted |= made_room;
                binding.write().await.store(concept_id, embedding.clone(), relevance)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            if let Err(cleanup) = self.blob_store.delete(&datum_id).await {
                warn!(datum = %datum_id, error = %cleanup, "Failed to delete orphaned datum");
            }
            return Err(e);
        }

        self.index
            .write()
            .await
            .insert(datum_id, MemoryCell::new(embedding, relevance, metadata));
        debug!(datum = %datum_id, "Remembered");

        match self.relieve_pressure(&binding).await {
            Ok(relieved) => compacted |= relieved,
            Err(e) => warn!(datum = %datum_id, error = %e, "Compaction after remembering failed"),
        }
        if compacted {
            self.reconcile().await;
        }
        Ok(datum_id)
    }

    /// Compact a full shared allocation before storing a new concept into it
    async fn make_room(&self, binding: &CrystalBinding, concept_id: &ConceptId) -> Result<bool> {
        let (Some(compactor), CrystalBinding::Shared(handle)) = (&self.compactor, binding) else {
            return Ok(false);
        };
        let full = {
            let allocation = handle.read().await;
            !allocation.crystal().contains(concept_id)
                && allocation.pattern_count() >= allocation.quota().max_patterns
        };
        if !full {
            return Ok(false);
        }

        debug!("Allocation full, compacting before remembering");
        Ok(compactor.compact_allocation(handle).await?.is_some())
    }

    /// Compact a shared allocation left at or above the pressure threshold
    async fn relieve_pressure(&self, binding: &CrystalBinding) -> Result<bool> {
        let (Some(compactor), CrystalBinding::Shared(handle)) = (&self.compactor, binding) else {
            return Ok(false);
        };
        let pressured = compactor.is_under_pressure(&*handle.read().await);
        if !pressured {
            return Ok(false);
        }
        Ok(compactor.compact_allocation(handle).await?.is_some())
    }

    /// Recall the memories most similar to `query`
    pub async fn recall(
        &self,
        query: impl Into<Query>,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<RecallResult>> {
        self.recall_with_cancel(query, limit, threshold, &CancellationToken::new())
            .await
    }

    /// Recall, stopping with [`SubstrateError::Cancelled`] if `cancel` fires
    /// during the scan
    ///
    /// Composting memories and memories whose pattern was compacted out of
    /// the crystal are skipped. Results are ordered by similarity descending
    /// (ties by datum id); each returned memory is reinforced.
    pub async fn recall_with_cancel(
        &self,
        query: impl Into<Query>,
        limit: usize,
        threshold: f32,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecallResult>> {
        if cancel.is_cancelled() {
            return Err(SubstrateError::Cancelled);
        }

        let query = match query.into() {
            Query::Embedding(embedding) => embedding,
            Query::Text(text) => self.embed(&text).await?,
        };

        let binding = self.binding();
        let mut ranked: Vec<(DatumId, f32)> = Vec::new();
        {
            let bound = binding.read().await;
            bound.ensure_live()?;

            let crystal = bound.crystal();
            if query.len() != crystal.dimension() {
                tracing::error!(
                    expected = crystal.dimension(),
                    actual = query.len(),
                    "Query dimension mismatch"
                );
                return Err(SubstrateError::DimensionMismatch {
                    expected: crystal.dimension(),
                    actual: query.len(),
                });
            }

            let index = self.index.read().await;
            for (scanned, (datum_id, cell)) in index.iter().enumerate() {
                checkpoint(scanned, cancel).await?;

                if cell.lifecycle == Lifecycle::Composting {
                    continue;
                }
                let Some(concept) = crystal.get(&ConceptId::from(*datum_id)) else {
                    continue;
                };

                let similarity = cosine_similarity(&query, &concept.embedding);
                if similarity >= threshold {
                    ranked.push((*datum_id, similarity));
                }
            }

            bound.record_access();
        }

        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);

        let data = futures::future::try_join_all(ranked.iter().map(|(id, _)| self.blob_store.get(id))).await?;

        let index = self.index.read().await;
        let mut results = Vec::with_capacity(ranked.len());
        for ((datum_id, similarity), datum) in ranked.into_iter().zip(data) {
            let Some(datum) = datum else {
                warn!(datum = %datum_id, "Recalled memory has no content in the blob store");
                continue;
            };
            // Purged while the content was being fetched
            let Some(cell) = index.get(&datum_id) else {
                continue;
            };

            cell.reinforce(self.config.reinforcement);
            results.push(RecallResult {
                memory: cell.snapshot(datum_id),
                similarity,
                datum_content: datum.content,
            });
        }
        drop(index);

        let reinforced: Vec<DatumId> = results.iter().map(|r| r.memory.datum_id).collect();
        self.sync_crystal_relevance(&reinforced).await;

        debug!(results = results.len(), "Recalled");
        Ok(results)
    }

    /// Move a memory to composting
    ///
    /// Returns false if the memory is missing, already composting or cherished.
    pub async fn forget(&self, datum_id: &DatumId) -> bool {
        {
            let mut index = self.index.write().await;
            let Some(cell) = index.get_mut(datum_id) else {
                return false;
            };
            if cell.cherished || cell.lifecycle == Lifecycle::Composting {
                return false;
            }
            cell.lifecycle = Lifecycle::Composting;
        }

        // Composting patterns are the first to go when the crystal is compacted
        self.sync_crystal_relevance(&[*datum_id]).await;
        debug!(datum = %datum_id, "Forgot");
        true
    }

    /// Pin a memory at full relevance so it can never be forgotten
    ///
    /// A composting memory is revived to active. Returns false if missing.
    pub async fn cherish(&self, datum_id: &DatumId) -> bool {
        {
            let mut index = self.index.write().await;
            let Some(cell) = index.get_mut(datum_id) else {
                return false;
            };
            cell.cherished = true;
            cell.set_relevance(1.0);
            if cell.lifecycle == Lifecycle::Composting {
                cell.lifecycle = Lifecycle::Active;
            }
        }

        self.sync_crystal_relevance(&[*datum_id]).await;
        debug!(datum = %datum_id, "Cherished");
        true
    }

    /// Copy index relevance into the crystal for `datum_ids`
    async fn sync_crystal_relevance(&self, datum_ids: &[DatumId]) {
        if datum_ids.is_empty() {
            return;
        }
        let binding = self.binding();
        let mut bound = binding.write().await;
        let index = self.index.read().await;
        for datum_id in datum_ids {
            if let Some(cell) = index.get(datum_id) {
                bound.set_relevance(&ConceptId::from(*datum_id), cell.crystal_relevance());
            }
        }
    }

    pub async fn consolidate(&self) -> Result<ConsolidationReport> {
        self.consolidate_with_cancel(&CancellationToken::new()).await
    }

    /// Let unused memories fade, then evict memories compacted out of the
    /// crystal
    ///
    /// Active memories below the dormant threshold become dormant; dormant
    /// memories below the demote threshold start composting. Cherished
    /// memories are never touched. Transitions made before a cancellation
    /// are kept and reach the crystal before [`SubstrateError::Cancelled`]
    /// is returned.
    pub async fn consolidate_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ConsolidationReport> {
        if cancel.is_cancelled() {
            return Err(SubstrateError::Cancelled);
        }

        self.consolidations.fetch_add(1, Ordering::SeqCst);
        let _guard = ConsolidationGuard(&self.consolidations);
        let started = Instant::now();

        let mut report = ConsolidationReport::default();
        let mut composted = Vec::new();
        let faded = {
            let mut index = self.index.write().await;
            self.fade(&mut index, cancel, &mut report, &mut composted).await
        };

        self.sync_crystal_relevance(&composted).await;
        if let Err(e) = faded {
            debug!(demoted = report.demoted_count, "Consolidation cancelled");
            return Err(e);
        }

        report.evicted_count = self.reconcile().await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            dormant = report.dormant_count,
            demoted = report.demoted_count,
            dreaming = report.dreaming_count,
            evicted = report.evicted_count,
            duration_ms = report.duration_ms,
            "Consolidated memories"
        );
        Ok(report)
    }

    async fn fade(
        &self,
        index: &mut HashMap<DatumId, MemoryCell>,
        cancel: &CancellationToken,
        report: &mut ConsolidationReport,
        composted: &mut Vec<DatumId>,
    ) -> Result<()> {
        for (scanned, cell) in index.values_mut().enumerate() {
            checkpoint(scanned, cancel).await?;
            if cell.lifecycle == Lifecycle::Active
                && !cell.cherished
                && cell.relevance() < self.config.dormant_threshold
            {
                cell.lifecycle = Lifecycle::Dormant;
                report.dormant_count += 1;
            }
        }

        for (scanned, (datum_id, cell)) in index.iter_mut().enumerate() {
            checkpoint(scanned, cancel).await?;
            if cell.lifecycle != Lifecycle::Dormant {
                continue;
            }
            report.dreaming_count += 1;
            if !cell.cherished && cell.relevance() < self.config.demote_threshold {
                cell.lifecycle = Lifecycle::Composting;
                report.demoted_count += 1;
                composted.push(*datum_id);
            }
        }
        Ok(())
    }

    /// Evict memories whose pattern is no longer in the crystal
    ///
    /// Compaction merges and elides patterns without telling the memory;
    /// their index entries and blobs are dropped here. Does nothing while
    /// the bound crystal is retired. Returns the number evicted.
    pub async fn reconcile(&self) -> usize {
        let evicted: Vec<DatumId> = {
            let binding = self.binding();
            let bound = binding.read().await;
            if bound.ensure_live().is_err() {
                debug!("Crystal retired, skipping reconciliation");
                return 0;
            }
            let crystal = bound.crystal();
            let mut index = self.index.write().await;
            let gone: Vec<DatumId> = index
                .keys()
                .filter(|id| !crystal.contains(&ConceptId::from(**id)))
                .copied()
                .collect();
            for id in &gone {
                index.remove(id);
            }
            gone
        };

        for datum_id in &evicted {
            if let Err(e) = self.blob_store.delete(datum_id).await {
                warn!(datum = %datum_id, error = %e, "Failed to delete evicted datum");
            }
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted memories compacted out of the crystal");
        }
        evicted.len()
    }

    /// Multiply the relevance of every memory by `factor` (clamped to 0.0-1.0)
    ///
    /// Cherished memories stay pinned at full relevance. Returns the number
    /// of memories scaled.
    pub async fn decay_all(&self, factor: f32) -> usize {
        let factor = clamp_factor(factor);
        let binding = self.binding();
        let mut bound = binding.write().await;
        let index = self.index.read().await;
        let mut scaled = 0;
        for (datum_id, cell) in index.iter().filter(|(_, cell)| !cell.cherished) {
            cell.scale_relevance(factor);
            bound.set_relevance(&ConceptId::from(*datum_id), cell.crystal_relevance());
            scaled += 1;
        }
        scaled
    }

    /// Multiply the resolution of composting memories by `factor` (clamped
    /// to 0.0-1.0), never going below [`MIN_RESOLUTION`]
    pub async fn degrade_composting(&self, factor: f32) -> usize {
        let factor = clamp_factor(factor);
        let mut index = self.index.write().await;
        let mut degraded = 0;
        for cell in index
            .values_mut()
            .filter(|cell| cell.lifecycle == Lifecycle::Composting)
        {
            cell.resolution = (cell.resolution * factor).max(MIN_RESOLUTION);
            degraded += 1;
        }
        degraded
    }

    /// Delete composting memories whose resolution fell below `min_resolution`
    /// from the index, the crystal and the blob store
    pub async fn purge_composted(&self, min_resolution: f32) -> Result<usize> {
        let purged: Vec<DatumId> = {
            let mut index = self.index.write().await;
            let ids: Vec<DatumId> = index
                .iter()
                .filter(|(_, cell)| {
                    cell.lifecycle == Lifecycle::Composting && cell.resolution < min_resolution
                })
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                index.remove(id);
            }
            ids
        };

        if purged.is_empty() {
            return Ok(0);
        }

        {
            let binding = self.binding();
            let mut bound = binding.write().await;
            for datum_id in &purged {
                if let Err(e) = bound.remove(&ConceptId::from(*datum_id)) {
                    debug!(error = %e, "Crystal unavailable while purging, skipping pattern removal");
                    break;
                }
            }
        }

        for datum_id in &purged {
            self.blob_store.delete(datum_id).await?;
        }

        info!(count = purged.len(), "Purged composted memories");
        Ok(purged.len())
    }

    pub async fn get(&self, datum_id: &DatumId) -> Option<Memory> {
        self.index
            .read()
            .await
            .get(datum_id)
            .map(|cell| cell.snapshot(*datum_id))
    }

    /// Memories in `lifecycle`, oldest first
    pub async fn by_lifecycle(&self, lifecycle: Lifecycle) -> Vec<Memory> {
        let index = self.index.read().await;
        let mut memories: Vec<Memory> = index
            .iter()
            .filter(|(_, cell)| cell.lifecycle == lifecycle)
            .map(|(id, cell)| cell.snapshot(*id))
            .collect();
        memories.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.datum_id.cmp(&b.datum_id))
        });
        memories
    }

    pub async fn status(&self) -> MemoryStatus {
        let index = self.index.read().await;
        let mut status = MemoryStatus {
            total: index.len(),
            is_consolidating: self.consolidations.load(Ordering::SeqCst) > 0,
            ..Default::default()
        };

        let mut relevance_sum = 0.0;
        let mut resolution_sum = 0.0;
        for cell in index.values() {
            match cell.lifecycle {
                Lifecycle::Active => status.active_count += 1,
                Lifecycle::Dormant => status.dormant_count += 1,
                Lifecycle::Composting => status.composting_count += 1,
            }
            if cell.cherished {
                status.cherished_count += 1;
            }
            relevance_sum += cell.relevance();
            resolution_sum += cell.resolution;
        }

        if status.total > 0 {
            status.average_relevance = relevance_sum / status.total as f32;
            status.average_resolution = resolution_sum / status.total as f32;
        }
        status
    }
}

/// Clamp a multiplicative factor to 0.0-1.0; NaN leaves values unchanged
fn clamp_factor(factor: f32) -> f32 {
    if factor.is_nan() {
        1.0
    } else {
        factor.clamp(0.0, 1.0)
    }
}
