use serde::{Deserialize, Serialize};
use trellis_core::EdgeDirection;

use crate::messages::Combine;
use crate::program::{Context, EdgeMut, NoGather, VertexMut, VertexProgram, VertexView};

/// Best known distance from the source. Unreached vertices are at infinity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distance(pub f64);

impl Default for Distance {
    fn default() -> Self {
        Distance(f64::INFINITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weight(pub f64);

impl Default for Weight {
    fn default() -> Self {
        Weight(1.0)
    }
}

/// A candidate distance. Folding keeps the shortest, and shorter
/// candidates run first under the priority scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinDistance(pub f64);

impl Default for MinDistance {
    fn default() -> Self {
        MinDistance(f64::INFINITY)
    }
}

impl Combine for MinDistance {
    fn combine(&mut self, other: Self) {
        self.0 = self.0.min(other.0);
    }

    fn priority(&self) -> f64 {
        -self.0
    }
}

/// Single-source shortest paths over out-edges. Signal the source with
/// `MinDistance(0.0)` to start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShortestPath {
    candidate: f64,
    improved: bool,
}

impl VertexProgram for ShortestPath {
    type VertexData = Distance;
    type EdgeData = Weight;
    type Gather = NoGather;
    type Message = MinDistance;

    fn init(&mut self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Distance>, message: &MinDistance) {
        self.candidate = message.0;
    }

    fn gather_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Distance>) -> EdgeDirection {
        EdgeDirection::None
    }

    fn apply(&mut self, _ctx: &Context<'_, Self>, vertex: VertexMut<'_, Distance>, _total: &NoGather) {
        if self.candidate < vertex.data.0 {
            vertex.data.0 = self.candidate;
            self.improved = true;
        }
    }

    fn scatter_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Distance>) -> EdgeDirection {
        if self.improved {
            EdgeDirection::Out
        } else {
            EdgeDirection::None
        }
    }

    fn scatter(&self, ctx: &Context<'_, Self>, vertex: VertexView<'_, Distance>, edge: EdgeMut<'_, Distance, Weight>) {
        ctx.signal(edge.target.gvid, MinDistance(vertex.data.0 + edge.data.0));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use trellis_core::{EngineOptions, SchedulerKind};
    use trellis_graph::{generators, GraphBuilder, LocalTopology, PartitionStrategy};
    use trellis_rpc::{LocalCluster, RpcConfig};

    use super::*;
    use crate::algorithms::testing::small_options;
    use crate::engine::{AsyncEngine, TerminationReason};

    async fn distances(builder: GraphBuilder<Distance, Weight>, options: EngineOptions) -> Vec<(u64, f64)> {
        let rpc = LocalCluster::spawn(1, RpcConfig::local()).remove(0);
        let graph = Arc::new(builder.partition(1, PartitionStrategy::Hashed).remove(0));
        let engine = AsyncEngine::<ShortestPath>::new(rpc, graph.clone(), options).await.unwrap();
        engine.signal(0, MinDistance(0.0)).await.unwrap();
        assert_eq!(engine.start().await.unwrap(), TerminationReason::TaskDepletion);

        let mut out: Vec<(u64, f64)> = (0..graph.num_local_vertices())
            .map(|lvid| (graph.global_id(lvid), graph.vertex_data(lvid).0))
            .collect();
        out.sort_by_key(|(gvid, _)| *gvid);
        out
    }

    #[test]
    fn min_distance_folds_to_shortest() {
        let mut m = MinDistance(4.0);
        m.combine(MinDistance(2.5));
        m.combine(MinDistance(3.0));
        assert_eq!(m, MinDistance(2.5));
        assert_eq!(m.priority(), -2.5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn grid_distances_are_manhattan() {
        let found = distances(generators::grid(3, 4), small_options()).await;
        for (gvid, dist) in found {
            let (row, col) = (gvid / 4, gvid % 4);
            assert_eq!(dist, (row + col) as f64, "vertex {}", gvid);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn weighted_shortcut_wins_under_priority_scheduler() {
        let mut b = GraphBuilder::new();
        b.add_edge(0, 1, Weight(10.0));
        b.add_edge(0, 2, Weight(1.0));
        b.add_edge(2, 3, Weight(1.0));
        b.add_edge(3, 1, Weight(1.0));
        b.add_vertex(4, Distance::default());
        let options = EngineOptions {
            scheduler: SchedulerKind::Priority,
            ..small_options()
        };

        let found = distances(b, options).await;
        assert_eq!(found[..4], [(0, 0.0), (1, 3.0), (2, 1.0), (3, 2.0)]);
        assert_eq!(found[4].1, f64::INFINITY);
    }
}
