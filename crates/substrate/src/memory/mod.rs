//! Associative memory layered over a crystal
//!
//! Provides:
//! - `types`: memory snapshots, lifecycle, query and report types
//! - `binding`: which crystal (shared or dedicated) backs the memory
//! - `associative`: the remember/recall/forget/consolidate index

pub mod associative;
pub mod binding;
pub mod types;

pub use associative::{AssociativeMemory, MIN_RESOLUTION, SCAN_YIELD_EVERY};
pub use binding::CrystalBinding;
pub use types::{ConsolidationReport, Lifecycle, Memory, MemoryStatus, Query, RecallResult};
