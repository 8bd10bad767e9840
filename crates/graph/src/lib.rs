//! Partitioned in-memory graph.
//!
//! A [`GraphBuilder`] collects the global graph and cuts it into one
//! [`DistributedGraph`] per machine. The engine reads structure through
//! [`LocalTopology`] and data through the per-vertex and per-edge guards.

pub mod builder;
pub mod generators;
pub mod store;
pub mod topology;

pub use builder::{GraphBuilder, PartitionStrategy};
pub use store::{DistributedGraph, GraphStats, VertexRecord};
pub use topology::{LocalEdge, LocalTopology};
