//! Stigmergic routing
//!
//! Agents leave decaying signals in a shared [`PheromoneField`]; the
//! [`CategoricalRouter`] sends work to whoever left the strongest one.

pub mod pheromone;
pub mod router;

pub use pheromone::{Pheromone, PheromoneField};
pub use router::{CategoricalRouter, RoutingDecision, Task};
