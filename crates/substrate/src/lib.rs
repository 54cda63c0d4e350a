//! Substrate - shared, quota-bounded memory for cooperating agents
//!
//! Agents hold allocations of one shared substrate. Each allocation is a
//! crystal of embedded patterns that is compacted under pressure, promoted
//! to a dedicated crystal when it proves hot, and demoted back when it
//! cools. An associative memory layer sits on top of a crystal, and a
//! pheromone field routes work between agents.

pub mod compaction;
pub mod config;
pub mod crystal;
pub mod embedding;
pub mod error;
pub mod inference;
pub mod memory;
pub mod routing;
pub mod storage;
pub mod substrate;
pub mod testing;
pub mod types;

pub use error::{Result, SubstrateError};
pub use types::{AgentId, ConceptId, DatumId};
