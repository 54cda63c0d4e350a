//! Crystal: in-memory concept store
//!
//! Maps concept ids to (content, embedding) pairs and answers cosine
//! similarity queries. Ownership and quota logic live in the layers above.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubstrateError};
use crate::types::ConceptId;

/// Relevance assigned to concepts stored without an explicit one
pub const DEFAULT_CONCEPT_RELEVANCE: f32 = 0.5;

/// A single pattern held by a crystal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    /// Raw content bytes
    pub content: Vec<u8>,
    /// Embedding, always `dimension` components long
    pub embedding: Vec<f32>,
    /// When the concept was first stored
    pub created_at: DateTime<Utc>,
    /// Importance used to order elision during compaction and demotion (0.0-1.0)
    pub relevance: f32,
    /// Number of original patterns folded into this one by compaction
    pub mass: u32,
}

/// Embedding-indexed concept store
#[derive(Debug, Clone)]
pub struct Crystal {
    dimension: usize,
    concepts: HashMap<ConceptId, Concept>,
}

impl Crystal {
    /// Create an empty crystal for embeddings of the given dimension
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            concepts: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.concepts.contains_key(id)
    }

    pub fn get(&self, id: &ConceptId) -> Option<&Concept> {
        self.concepts.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConceptId, &Concept)> {
        self.concepts.iter()
    }

    /// Concept ids in sorted order
    pub fn concept_ids(&self) -> Vec<ConceptId> {
        let mut ids: Vec<ConceptId> = self.concepts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Upsert a concept.
    ///
    /// Overwrites content and embedding of any existing entry with the same
    /// id; an overwritten concept keeps its `created_at`, relevance and mass.
    /// New concepts start at the default relevance.
    pub fn store(
        &mut self,
        id: impl Into<ConceptId>,
        content: Vec<u8>,
        embedding: Vec<f32>,
    ) -> Result<()> {
        let id = id.into();
        let relevance = self
            .concepts
            .get(&id)
            .map_or(DEFAULT_CONCEPT_RELEVANCE, |c| c.relevance);
        self.store_with_relevance(id, content, embedding, relevance)
    }

    /// Upsert a concept with an explicit relevance (clamped to 0.0-1.0)
    ///
    /// An overwritten concept keeps its `created_at` and mass.
    pub fn store_with_relevance(
        &mut self,
        id: impl Into<ConceptId>,
        content: Vec<u8>,
        embedding: Vec<f32>,
        relevance: f32,
    ) -> Result<()> {
        self.check_dimension(embedding.len())?;

        let id = id.into();
        let (created_at, mass) = self
            .concepts
            .get(&id)
            .map_or_else(|| (Utc::now(), 1), |c| (c.created_at, c.mass));

        self.concepts.insert(
            id,
            Concept {
                content,
                embedding,
                created_at,
                relevance: relevance.clamp(0.0, 1.0),
                mass,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: &ConceptId) -> Option<Concept> {
        self.concepts.remove(id)
    }

    pub(crate) fn get_mut(&mut self, id: &ConceptId) -> Option<&mut Concept> {
        self.concepts.get_mut(id)
    }

    /// Set the relevance of a concept. Returns false if it does not exist.
    pub fn set_relevance(&mut self, id: &ConceptId, relevance: f32) -> bool {
        match self.concepts.get_mut(id) {
            Some(concept) => {
                concept.relevance = relevance.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    /// Rank concepts by cosine similarity to `query`
    ///
    /// Results are sorted by similarity descending (ties by concept id) and
    /// filtered to `similarity >= threshold`.
    pub fn retrieve(&self, query: &[f32], threshold: f32) -> Result<Vec<(ConceptId, f32)>> {
        self.check_dimension(query.len())?;

        let mut results: Vec<(ConceptId, f32)> = self
            .concepts
            .iter()
            .map(|(id, concept)| (id.clone(), cosine_similarity(query, &concept.embedding)))
            .filter(|(_, similarity)| *similarity >= threshold)
            .collect();

        results.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(results)
    }

    /// Concepts ordered from least to most relevant (ties: older first, then id)
    pub fn least_relevant_first(&self) -> Vec<ConceptId> {
        let mut entries: Vec<(&ConceptId, &Concept)> = self.concepts.iter().collect();
        entries.sort_by(|a, b| {
            a.1.relevance
                .partial_cmp(&b.1.relevance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.created_at.cmp(&b.1.created_at))
                .then_with(|| a.0.cmp(b.0))
        });
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual != self.dimension {
            tracing::error!(
                expected = self.dimension,
                actual,
                "Embedding dimension mismatch"
            );
            return Err(SubstrateError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }
}

/// Cosine similarity of two vectors; 0.0 when either has zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dimension: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[axis] = 1.0;
        v
    }

    mod store {
        use super::*;

        #[test]
        fn test_store_and_get() {
            let mut crystal = Crystal::new(4);
            crystal.store("a", b"alpha".to_vec(), unit(4, 0)).unwrap();

            assert_eq!(crystal.len(), 1);
            let concept = crystal.get(&ConceptId::from("a")).unwrap();
            assert_eq!(concept.content, b"alpha");
            assert_eq!(concept.mass, 1);
            assert_eq!(concept.relevance, DEFAULT_CONCEPT_RELEVANCE);
        }

        #[test]
        fn test_store_overwrites_same_id() {
            let mut crystal = Crystal::new(4);
            crystal.store("a", b"first".to_vec(), unit(4, 0)).unwrap();
            let created = crystal.get(&ConceptId::from("a")).unwrap().created_at;

            crystal.store("a", b"second".to_vec(), unit(4, 1)).unwrap();

            assert_eq!(crystal.len(), 1);
            let concept = crystal.get(&ConceptId::from("a")).unwrap();
            assert_eq!(concept.content, b"second");
            assert_eq!(concept.embedding, unit(4, 1));
            assert_eq!(concept.created_at, created);
        }

        #[test]
        fn test_overwrite_keeps_mass_and_relevance() {
            let mut crystal = Crystal::new(4);
            crystal
                .store_with_relevance("a", b"first".to_vec(), unit(4, 0), 0.9)
                .unwrap();
            crystal.get_mut(&ConceptId::from("a")).unwrap().mass = 3;

            crystal.store("a", b"second".to_vec(), unit(4, 1)).unwrap();
            let concept = crystal.get(&ConceptId::from("a")).unwrap();
            assert_eq!(concept.mass, 3);
            assert_eq!(concept.relevance, 0.9);

            crystal
                .store_with_relevance("a", b"third".to_vec(), unit(4, 2), 0.2)
                .unwrap();
            let concept = crystal.get(&ConceptId::from("a")).unwrap();
            assert_eq!(concept.mass, 3);
            assert_eq!(concept.relevance, 0.2);
        }

        #[test]
        fn test_store_rejects_wrong_dimension() {
            let mut crystal = Crystal::new(4);
            let err = crystal.store("a", Vec::new(), vec![1.0; 3]).unwrap_err();
            assert!(matches!(
                err,
                SubstrateError::DimensionMismatch {
                    expected: 4,
                    actual: 3
                }
            ));
            assert!(crystal.is_empty());
        }

        #[test]
        fn test_relevance_is_clamped() {
            let mut crystal = Crystal::new(2);
            crystal
                .store_with_relevance("a", Vec::new(), vec![1.0, 0.0], 3.0)
                .unwrap();
            assert_eq!(crystal.get(&ConceptId::from("a")).unwrap().relevance, 1.0);

            assert!(crystal.set_relevance(&ConceptId::from("a"), -1.0));
            assert_eq!(crystal.get(&ConceptId::from("a")).unwrap().relevance, 0.0);
            assert!(!crystal.set_relevance(&ConceptId::from("missing"), 0.5));
        }
    }

    mod retrieve {
        use super::*;

        #[test]
        fn test_retrieve_orders_by_similarity() {
            let mut crystal = Crystal::new(3);
            crystal.store("x", Vec::new(), vec![1.0, 0.0, 0.0]).unwrap();
            crystal.store("xy", Vec::new(), vec![1.0, 1.0, 0.0]).unwrap();
            crystal.store("z", Vec::new(), vec![0.0, 0.0, 1.0]).unwrap();

            let results = crystal.retrieve(&[1.0, 0.0, 0.0], 0.0).unwrap();

            assert_eq!(results[0].0.as_str(), "x");
            assert!((results[0].1 - 1.0).abs() < 1e-6);
            assert_eq!(results[1].0.as_str(), "xy");
            assert_eq!(results[2].0.as_str(), "z");
        }

        #[test]
        fn test_retrieve_applies_threshold() {
            let mut crystal = Crystal::new(3);
            crystal.store("x", Vec::new(), vec![1.0, 0.0, 0.0]).unwrap();
            crystal.store("z", Vec::new(), vec![0.0, 0.0, 1.0]).unwrap();

            let results = crystal.retrieve(&[1.0, 0.0, 0.0], 0.5).unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].0.as_str(), "x");
        }

        #[test]
        fn test_retrieve_ties_break_by_id() {
            let mut crystal = Crystal::new(2);
            crystal.store("b", Vec::new(), vec![1.0, 0.0]).unwrap();
            crystal.store("a", Vec::new(), vec![2.0, 0.0]).unwrap();

            let results = crystal.retrieve(&[1.0, 0.0], 0.0).unwrap();
            assert_eq!(results[0].0.as_str(), "a");
            assert_eq!(results[1].0.as_str(), "b");
        }

        #[test]
        fn test_retrieve_rejects_wrong_dimension() {
            let crystal = Crystal::new(3);
            let result = crystal.retrieve(&[1.0, 0.0], 0.0);
            assert!(matches!(
                result,
                Err(SubstrateError::DimensionMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_least_relevant_first() {
        let mut crystal = Crystal::new(2);
        crystal
            .store_with_relevance("high", Vec::new(), vec![1.0, 0.0], 0.9)
            .unwrap();
        crystal
            .store_with_relevance("low", Vec::new(), vec![0.0, 1.0], 0.1)
            .unwrap();
        crystal
            .store_with_relevance("mid", Vec::new(), vec![1.0, 1.0], 0.5)
            .unwrap();

        let order = crystal.least_relevant_first();
        let names: Vec<&str> = order.iter().map(|id| id.as_str()).collect();
        assert_eq!(names, vec!["low", "mid", "high"]);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
