use serde::{Deserialize, Serialize};
use trellis_core::EdgeDirection;

use crate::program::{Context, EdgeMut, EdgeView, VertexMut, VertexProgram, VertexView};

/// Probability of a random jump.
pub const RESET_PROB: f64 = 0.15;

/// A vertex whose rank moved by less than this stops signalling.
pub const TOLERANCE: f64 = 1e-3;

/// Dynamic PageRank: a vertex recomputes its rank when signalled and
/// signals its out-neighbours only if the rank moved.
///
/// Ranks are not normalised: on a graph with no dangling vertices they
/// sum to the number of vertices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageRank {
    delta: f64,
}

impl VertexProgram for PageRank {
    type VertexData = f64;
    type EdgeData = ();
    type Gather = f64;
    type Message = ();

    fn gather(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, f64>, edge: EdgeView<'_, f64, ()>) -> f64 {
        *edge.source.data / edge.source.num_out_edges as f64
    }

    fn apply(&mut self, _ctx: &Context<'_, Self>, vertex: VertexMut<'_, f64>, total: &f64) {
        let rank = RESET_PROB + (1.0 - RESET_PROB) * total;
        self.delta = (rank - *vertex.data).abs();
        *vertex.data = rank;
    }

    fn scatter_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, f64>) -> EdgeDirection {
        if self.delta > TOLERANCE {
            EdgeDirection::Out
        } else {
            EdgeDirection::None
        }
    }

    fn scatter(&self, ctx: &Context<'_, Self>, _vertex: VertexView<'_, f64>, edge: EdgeMut<'_, f64, ()>) {
        ctx.signal(edge.target.gvid, ());
    }
}
