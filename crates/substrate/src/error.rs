//! Error types for the memory substrate

use thiserror::Error;

use crate::types::AgentId;

/// Main error type for substrate operations
#[derive(Error, Debug)]
pub enum SubstrateError {
    /// An embedding did not have the crystal's dimension. Always a caller bug.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The agent already holds a shared allocation
    #[error("Agent {0} already holds an allocation")]
    AlreadyAllocated(AgentId),

    /// The agent already holds a dedicated crystal
    #[error("Agent {0} already holds a dedicated crystal")]
    AlreadyDedicated(AgentId),

    /// No shared allocation is registered for the agent
    #[error("No allocation for agent {0}")]
    AllocationNotFound(AgentId),

    /// No dedicated crystal is registered for the agent
    #[error("No dedicated crystal for agent {0}")]
    DedicatedNotFound(AgentId),

    /// Promotion thresholds are not met
    #[error("Agent {agent_id} is not eligible for promotion: {reason}")]
    PromotionNotEligible { agent_id: AgentId, reason: String },

    /// The allocation is full and the pattern is new
    #[error("Quota exceeded for agent {agent_id} (max {max_patterns} patterns)")]
    QuotaExceeded {
        agent_id: AgentId,
        max_patterns: usize,
    },

    /// The allocation's crystal was moved out by a promotion or release
    #[error("Allocation for agent {0} has been retired")]
    AllocationRetired(AgentId),

    /// A long-running scan observed its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Blob store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Memory index errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for substrate operations
pub type Result<T> = std::result::Result<T, SubstrateError>;
