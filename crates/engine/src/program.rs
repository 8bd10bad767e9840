//! The vertex-program contract and the views the engine hands to it.

use std::ops::AddAssign;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_core::{EdgeDirection, VertexId};
use trellis_graph::VertexRecord;

use crate::engine::EngineShared;
use crate::messages::Combine;

/// A computation run on one vertex each time it is signalled.
///
/// A fresh program is built with `Default` for every execution, receives
/// the folded message in [`init`](Self::init) and then goes through
/// gather, apply and scatter. The program is serialised and shipped to
/// mirror machines for their share of gather and scatter, so any state set
/// in `init` or `apply` is visible there.
pub trait VertexProgram: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type VertexData: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static;
    type EdgeData: Send + Sync + 'static;
    /// Summed over every gathered edge, on every machine.
    type Gather: AddAssign + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Message: Combine + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn init(&mut self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Self::VertexData>, _message: &Self::Message) {}

    fn gather_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Self::VertexData>) -> EdgeDirection {
        EdgeDirection::In
    }

    fn gather(
        &self,
        _ctx: &Context<'_, Self>,
        _vertex: VertexView<'_, Self::VertexData>,
        _edge: EdgeView<'_, Self::VertexData, Self::EdgeData>,
    ) -> Self::Gather {
        Self::Gather::default()
    }

    /// Runs on the master only, holding the vertex's data lock.
    fn apply(&mut self, ctx: &Context<'_, Self>, vertex: VertexMut<'_, Self::VertexData>, total: &Self::Gather);

    fn scatter_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Self::VertexData>) -> EdgeDirection {
        EdgeDirection::Out
    }

    fn scatter(
        &self,
        _ctx: &Context<'_, Self>,
        _vertex: VertexView<'_, Self::VertexData>,
        _edge: EdgeMut<'_, Self::VertexData, Self::EdgeData>,
    ) {
    }
}

/// Gather type for programs that never gather.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoGather;

impl AddAssign for NoGather {
    fn add_assign(&mut self, _other: Self) {}
}

/// Read access to one vertex. Degrees are global.
#[derive(Debug)]
pub struct VertexView<'a, V> {
    pub gvid: VertexId,
    pub num_in_edges: usize,
    pub num_out_edges: usize,
    pub data: &'a V,
}

impl<V> Clone for VertexView<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for VertexView<'_, V> {}

impl<'a, V> VertexView<'a, V> {
    pub(crate) fn new(record: &VertexRecord, data: &'a V) -> Self {
        Self {
            gvid: record.gvid,
            num_in_edges: record.num_in_edges,
            num_out_edges: record.num_out_edges,
            data,
        }
    }
}

#[derive(Debug)]
pub struct VertexMut<'a, V> {
    pub gvid: VertexId,
    pub num_in_edges: usize,
    pub num_out_edges: usize,
    pub data: &'a mut V,
}

impl<'a, V> VertexMut<'a, V> {
    pub(crate) fn new(record: &VertexRecord, data: &'a mut V) -> Self {
        Self {
            gvid: record.gvid,
            num_in_edges: record.num_in_edges,
            num_out_edges: record.num_out_edges,
            data,
        }
    }
}

/// An edge with both endpoints locked.
#[derive(Debug)]
pub struct EdgeView<'a, V, E> {
    pub source: VertexView<'a, V>,
    pub target: VertexView<'a, V>,
    pub data: &'a E,
}

#[derive(Debug)]
pub struct EdgeMut<'a, V, E> {
    pub source: VertexView<'a, V>,
    pub target: VertexView<'a, V>,
    pub data: &'a mut E,
}

/// What a vertex program may do to the running engine.
pub struct Context<'a, P: VertexProgram> {
    engine: &'a EngineShared<P>,
}

impl<'a, P: VertexProgram> Context<'a, P> {
    pub(crate) fn new(engine: &'a EngineShared<P>) -> Self {
        Self { engine }
    }

    pub fn procid(&self) -> trellis_core::ProcId {
        self.engine.rpc.procid()
    }

    pub fn num_procs(&self) -> usize {
        self.engine.rpc.num_procs()
    }

    /// Vertices in the whole graph.
    pub fn num_vertices(&self) -> usize {
        self.engine.graph.num_vertices()
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.engine.elapsed_seconds()
    }

    /// Send `message` to `gvid`, scheduling it.
    pub fn signal(&self, gvid: VertexId, message: P::Message) {
        self.engine.context_signal(gvid, message);
    }

    /// Add `delta` to this machine's cached gather contribution of `gvid`,
    /// if there is one.
    pub fn post_delta(&self, gvid: VertexId, delta: P::Gather) {
        self.engine.post_delta(gvid, delta);
    }

    /// Drop this machine's cached gather contribution of `gvid`.
    pub fn clear_gather_cache(&self, gvid: VertexId) {
        self.engine.clear_gather_cache(gvid);
    }

    /// Abort the run on every machine.
    pub fn stop(&self) {
        self.engine.request_stop();
    }
}
