use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use trellis_core::EdgeDirection;

use crate::program::{Context, EdgeView, VertexMut, VertexProgram, VertexView};

/// Neighbour counts of one vertex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degrees {
    pub inbound: usize,
    pub outbound: usize,
}

impl Degrees {
    pub fn total(&self) -> usize {
        self.inbound + self.outbound
    }
}

impl AddAssign for Degrees {
    fn add_assign(&mut self, other: Self) {
        self.inbound += other.inbound;
        self.outbound += other.outbound;
    }
}

/// Counts each vertex's neighbours by gathering over every incident edge,
/// on every replica. One signal per vertex is enough.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeighbourCount;

impl VertexProgram for NeighbourCount {
    type VertexData = Degrees;
    type EdgeData = ();
    type Gather = Degrees;
    type Message = ();

    fn gather_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Degrees>) -> EdgeDirection {
        EdgeDirection::All
    }

    fn gather(
        &self,
        _ctx: &Context<'_, Self>,
        vertex: VertexView<'_, Degrees>,
        edge: EdgeView<'_, Degrees, ()>,
    ) -> Degrees {
        if edge.target.gvid == vertex.gvid {
            Degrees { inbound: 1, outbound: 0 }
        } else {
            Degrees { inbound: 0, outbound: 1 }
        }
    }

    fn apply(&mut self, _ctx: &Context<'_, Self>, vertex: VertexMut<'_, Degrees>, total: &Degrees) {
        *vertex.data = *total;
    }

    fn scatter_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Degrees>) -> EdgeDirection {
        EdgeDirection::None
    }
}

#[cfg(test)]
mod tests {
    use trellis_graph::{generators, LocalTopology};

    use super::*;
    use crate::algorithms::testing::{run_everywhere, small_options};

    #[test]
    fn degrees_add_up() {
        let mut d = Degrees { inbound: 1, outbound: 2 };
        d += Degrees { inbound: 3, outbound: 0 };
        assert_eq!(d, Degrees { inbound: 4, outbound: 2 });
        assert_eq!(d.total(), 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn grid_counts_match_records() {
        let (_, graph) = run_everywhere::<NeighbourCount>(generators::grid(3, 3), small_options(), ()).await;
        for lvid in 0..graph.num_local_vertices() {
            let record = graph.record(lvid);
            let counted = *graph.vertex_data(lvid);
            assert_eq!(counted.inbound, record.num_in_edges, "vertex {}", record.gvid);
            assert_eq!(counted.outbound, record.num_out_edges, "vertex {}", record.gvid);
        }
        // Centre of a 3x3 grid: two in, two out.
        let centre = graph.local_id(4).unwrap();
        assert_eq!(graph.vertex_data(centre).total(), 4);
    }
}
