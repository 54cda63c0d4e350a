//! Associative memory behaviour over a real allocation and blob store

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use substrate::compaction::CompactionPolicy;
use substrate::config::MemoryConfig;
use substrate::memory::{AssociativeMemory, Lifecycle, MIN_RESOLUTION};
use substrate::storage::{BlobStore, FsBlobStore, InMemoryBlobStore};
use substrate::substrate::{
    Allocation, AllocationHandle, LifecyclePolicy, PromotionPolicy, Quota, SharedSubstrate,
};
use substrate::testing::{MockEmbedder, seeded_vector, unit_vector};
use substrate::{AgentId, ConceptId, SubstrateError};

const DIM: usize = 32;

// =============================================================================
// Fixtures
// =============================================================================

fn allocation(max_patterns: usize) -> AllocationHandle {
    Allocation::new(
        AgentId::from("memory-agent"),
        DIM,
        Quota::new(max_patterns),
        LifecyclePolicy::default(),
        "memory tests",
    )
    .into_handle()
}

fn memory_with(blob_store: Arc<dyn BlobStore>, config: MemoryConfig) -> AssociativeMemory {
    AssociativeMemory::new(allocation(1000), blob_store, config)
        .with_embedder(Arc::new(MockEmbedder::with_dimension(DIM)))
}

fn memory() -> AssociativeMemory {
    memory_with(Arc::new(InMemoryBlobStore::new()), MemoryConfig::default())
}

fn substrate(max_patterns: usize, max_compactions_per_hour: u32) -> SharedSubstrate {
    SharedSubstrate::new(
        DIM,
        Quota::new(max_patterns),
        PromotionPolicy::new(1, Duration::ZERO),
        CompactionPolicy::new(0.8, max_compactions_per_hour),
    )
}

// =============================================================================
// Round trip
// =============================================================================

#[tokio::test]
async fn test_remember_then_recall_by_text() {
    let memory = memory();
    let id = memory
        .remember(b"python tips".to_vec(), None, None)
        .await
        .unwrap();
    memory
        .remember(b"rust borrow checker".to_vec(), None, None)
        .await
        .unwrap();

    let results = memory.recall("python tips", 5, 0.9).await.unwrap();

    assert_eq!(results[0].memory.datum_id, id);
    assert!((results[0].similarity - 1.0).abs() < 1e-5);
    assert_eq!(results[0].datum_content, b"python tips".to_vec());
}

#[tokio::test]
async fn test_remember_then_recall_by_embedding() {
    let memory = memory();
    let mut ids = Vec::new();
    for axis in 0..4 {
        let id = memory
            .remember(
                format!("axis {axis}").into_bytes(),
                None,
                Some(unit_vector(DIM, axis)),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    for (axis, id) in ids.iter().enumerate() {
        let results = memory.recall(unit_vector(DIM, axis), 1, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.datum_id, *id);
    }
}

#[tokio::test]
async fn test_recall_survives_filesystem_blob_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::open(dir.path()).await.unwrap();
    let memory = memory_with(Arc::new(store.clone()), MemoryConfig::default());

    let id = memory
        .remember(b"persisted content".to_vec(), None, None)
        .await
        .unwrap();

    let results = memory.recall("persisted content", 1, 0.9).await.unwrap();
    assert_eq!(results[0].memory.datum_id, id);
    assert_eq!(results[0].datum_content, b"persisted content".to_vec());
    assert_eq!(store.ids().await.unwrap(), vec![id]);
}

#[tokio::test]
async fn test_remember_without_embedder_or_embedding_fails() {
    let memory = AssociativeMemory::new(
        allocation(10),
        Arc::new(InMemoryBlobStore::new()),
        MemoryConfig::default(),
    );

    let err = memory.remember(b"text".to_vec(), None, None).await.unwrap_err();
    assert!(matches!(err, SubstrateError::Embedding(_)));
    assert!(memory.is_empty().await);
}

#[tokio::test]
async fn test_rate_limited_full_allocation_rejects_and_cleans_up_blob() {
    let substrate = substrate(1, 0);
    let agent = AgentId::from("memory-agent");
    substrate.allocate(agent.clone(), None, "memory tests").await.unwrap();
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let memory = AssociativeMemory::for_agent(&substrate, &agent, blob_store.clone(), MemoryConfig::default())
        .await
        .unwrap();

    memory
        .remember(b"one".to_vec(), None, Some(unit_vector(DIM, 0)))
        .await
        .unwrap();
    let err = memory
        .remember(b"two".to_vec(), None, Some(unit_vector(DIM, 1)))
        .await
        .unwrap_err();

    assert!(matches!(err, SubstrateError::QuotaExceeded { .. }));
    assert_eq!(blob_store.len(), 1);
    assert_eq!(memory.len().await, 1);
}

// =============================================================================
// Memory in the shared substrate
// =============================================================================

#[tokio::test]
async fn test_remembering_into_pressured_allocation_compacts() {
    let substrate = substrate(10, 100);
    let agent = AgentId::from("memory-agent");
    let handle = substrate.allocate(agent.clone(), None, "memory tests").await.unwrap();
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let memory = AssociativeMemory::for_agent(&substrate, &agent, blob_store.clone(), MemoryConfig::default())
        .await
        .unwrap();

    for i in 0..12 {
        memory
            .remember(format!("note {i}").into_bytes(), None, Some(seeded_vector(i + 1, DIM)))
            .await
            .unwrap();
    }

    // Compacted at 8 of 10 each time, back down to 6
    let patterns = handle.read().await.pattern_count();
    assert_eq!(patterns, 6);
    assert_eq!(substrate.compactor().compactions_in_window(&agent), 3);
    assert_eq!(memory.len().await, patterns);
    assert_eq!(blob_store.len(), patterns);

    let status = memory.status().await;
    assert_eq!(status.total, patterns);
    assert_eq!(status.active_count, patterns);
}

#[tokio::test]
async fn test_recalled_memory_survives_lossy_demotion() {
    let substrate = substrate(10, 100);
    let agent = AgentId::from("memory-agent");
    substrate.allocate(agent.clone(), None, "memory tests").await.unwrap();
    let memory = AssociativeMemory::for_agent(
        &substrate,
        &agent,
        Arc::new(InMemoryBlobStore::new()),
        MemoryConfig::default(),
    )
    .await
    .unwrap();

    let hot = memory
        .remember(b"hot".to_vec(), None, Some(unit_vector(DIM, 0)))
        .await
        .unwrap();
    let cold = memory
        .remember(b"cold".to_vec(), None, Some(unit_vector(DIM, 1)))
        .await
        .unwrap();
    // Enough reinforcement to pin it at full relevance
    for _ in 0..12 {
        memory.recall(unit_vector(DIM, 0), 1, 0.99).await.unwrap();
    }
    memory.decay_all(0.5).await;
    assert_eq!(memory.get(&hot).await.unwrap().relevance, 0.5);
    assert_eq!(memory.get(&cold).await.unwrap().relevance, 0.25);

    substrate.promote(&agent).await.unwrap();
    let shared = substrate.demote(&agent, 0.5).await.unwrap();

    let allocation = shared.read().await;
    assert!(allocation.crystal().contains(&ConceptId::from(hot)));
    assert!(!allocation.crystal().contains(&ConceptId::from(cold)));
}

// =============================================================================
// Cherish and forget
// =============================================================================

#[tokio::test]
async fn test_cherished_memory_cannot_be_forgotten() {
    let memory = memory();
    let id = memory.remember(b"keep me".to_vec(), None, None).await.unwrap();

    assert!(memory.cherish(&id).await);
    let before = memory.get(&id).await.unwrap().lifecycle;

    for _ in 0..10 {
        assert!(!memory.forget(&id).await);
        assert_eq!(memory.get(&id).await.unwrap().lifecycle, before);
    }
}

#[tokio::test]
async fn test_forgotten_memory_is_not_recalled() {
    let memory = memory();
    let id = memory.remember(b"fleeting".to_vec(), None, None).await.unwrap();

    assert!(memory.forget(&id).await);
    assert!(!memory.forget(&id).await);
    assert_eq!(memory.get(&id).await.unwrap().lifecycle, Lifecycle::Composting);
    assert!(memory.recall("fleeting", 5, 0.0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cherish_and_forget_unknown_memory() {
    let memory = memory();
    let stranger = substrate::DatumId::new();
    assert!(!memory.cherish(&stranger).await);
    assert!(!memory.forget(&stranger).await);
}

// =============================================================================
// Consolidation
// =============================================================================

#[tokio::test]
async fn test_consolidation_never_composts_cherished() {
    let memory = memory();
    let mut cherished = Vec::new();
    for i in 0..12 {
        let id = memory
            .remember(format!("memory {i}").into_bytes(), None, None)
            .await
            .unwrap();
        // Cherish a third of them, across every starting state below
        if i % 3 == 0 {
            memory.cherish(&id).await;
            cherished.push(id);
        }
        if i % 4 == 1 {
            memory.forget(&id).await;
        }
    }

    for _ in 0..5 {
        memory.decay_all(0.1).await;
        memory.consolidate().await.unwrap();
    }

    for id in &cherished {
        let snapshot = memory.get(id).await.unwrap();
        assert!(snapshot.cherished);
        assert_ne!(snapshot.lifecycle, Lifecycle::Composting);
    }
    assert!(memory.status().await.composting_count > 0);
}

#[tokio::test]
async fn test_unused_memories_fade_through_dormancy() {
    let memory = memory();
    let id = memory.remember(b"old news".to_vec(), None, None).await.unwrap();

    // 0.5 * 0.5 = 0.25 < dormant threshold
    memory.decay_all(0.5).await;
    let report = memory.consolidate().await.unwrap();
    assert_eq!(report.dormant_count, 1);
    assert_eq!(report.demoted_count, 0);
    assert_eq!(memory.get(&id).await.unwrap().lifecycle, Lifecycle::Dormant);

    // 0.25 * 0.2 = 0.05 < demote threshold
    memory.decay_all(0.2).await;
    let report = memory.consolidate().await.unwrap();
    assert_eq!(report.dreaming_count, 1);
    assert_eq!(report.demoted_count, 1);
    assert_eq!(memory.get(&id).await.unwrap().lifecycle, Lifecycle::Composting);
}

#[tokio::test]
async fn test_composted_memories_are_purged_everywhere() {
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let memory = memory_with(blob_store.clone(), MemoryConfig::default());
    let gone = memory.remember(b"gone".to_vec(), None, None).await.unwrap();
    let kept = memory.remember(b"kept".to_vec(), None, None).await.unwrap();

    memory.forget(&gone).await;
    for _ in 0..10 {
        memory.degrade_composting(0.5).await;
    }

    assert_eq!(memory.purge_composted(0.05).await.unwrap(), 1);
    assert!(memory.get(&gone).await.is_none());
    assert!(memory.get(&kept).await.is_some());
    assert_eq!(blob_store.len(), 1);
}

// =============================================================================
// Bounds
// =============================================================================

#[tokio::test]
async fn test_relevance_and_resolution_stay_in_bounds() {
    let memory = memory();
    let mut rng = SmallRng::seed_from_u64(42);
    let mut ids = Vec::new();

    for step in 0..300 {
        match rng.random_range(0..6) {
            0 => {
                let id = memory
                    .remember(format!("item {step}").into_bytes(), None, None)
                    .await
                    .unwrap();
                ids.push(id);
            }
            1 => {
                memory.decay_all(rng.random_range(-0.5..1.5)).await;
            }
            2 => {
                memory.degrade_composting(rng.random_range(-0.5..1.5)).await;
            }
            3 => {
                memory.consolidate().await.unwrap();
            }
            4 if !ids.is_empty() => {
                let id = ids[rng.random_range(0..ids.len())];
                memory.forget(&id).await;
            }
            _ => {
                memory.recall(format!("item {}", step / 2), 3, 0.0).await.unwrap();
            }
        }

        for id in &ids {
            let snapshot = memory.get(id).await.unwrap();
            assert!((0.0..=1.0).contains(&snapshot.relevance));
            assert!(snapshot.resolution > 0.0 && snapshot.resolution <= 1.0);
            assert!(snapshot.resolution >= MIN_RESOLUTION);
            assert!(!(snapshot.cherished && snapshot.lifecycle == Lifecycle::Composting));
        }
    }
}
