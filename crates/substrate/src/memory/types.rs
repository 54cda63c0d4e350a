//! Memory types for the associative index
//!
//! Callers only ever see [`Memory`] snapshots; the live entries stay inside
//! [`AssociativeMemory`](crate::memory::AssociativeMemory).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DatumId;

/// Where a memory sits in its fade-out cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Recallable and fully weighted
    Active,
    /// Rarely used; still recallable, candidate for composting
    Dormant,
    /// Forgotten; skipped by recall and slowly losing resolution
    Composting,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Active => "active",
            Lifecycle::Dormant => "dormant",
            Lifecycle::Composting => "composting",
        };
        f.write_str(name)
    }
}

/// Snapshot of one indexed memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Id of the content in the blob store; also the concept id in the crystal
    pub datum_id: DatumId,
    pub embedding: Vec<f32>,
    /// Recall fidelity in (0, 1]
    pub resolution: f32,
    pub lifecycle: Lifecycle,
    /// Importance in [0, 1]
    pub relevance: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    /// Cherished memories can never be forgotten
    pub cherished: bool,
    pub metadata: BTreeMap<String, String>,
}

/// What to recall by
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Embedded with the configured embedder
    Text(String),
    Embedding(Vec<f32>),
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::Text(text.to_string())
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::Text(text)
    }
}

impl From<Vec<f32>> for Query {
    fn from(embedding: Vec<f32>) -> Self {
        Query::Embedding(embedding)
    }
}

/// A recalled memory with its similarity to the query and its content
#[derive(Debug, Clone, Serialize)]
pub struct RecallResult {
    pub memory: Memory,
    pub similarity: f32,
    pub datum_content: Vec<u8>,
}

/// Outcome of one consolidation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    /// Active memories moved to dormant
    pub dormant_count: usize,
    /// Dormant memories moved to composting
    pub demoted_count: usize,
    /// Dormant memories examined
    pub dreaming_count: usize,
    /// Memories dropped because compaction removed their pattern
    pub evicted_count: usize,
    pub duration_ms: u64,
}

/// Aggregate view of the index
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStatus {
    pub total: usize,
    pub active_count: usize,
    pub dormant_count: usize,
    pub composting_count: usize,
    pub cherished_count: usize,
    pub average_relevance: f32,
    pub average_resolution: f32,
    pub is_consolidating: bool,
}
