//! Vertex programs shipped with the engine.

pub mod degree;
pub mod pagerank;
pub mod sssp;

pub use degree::{Degrees, NeighbourCount};
pub use pagerank::PageRank;
pub use sssp::{Distance, MinDistance, ShortestPath, Weight};
