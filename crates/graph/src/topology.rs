use trellis_core::{EdgeId, LocalVertexId, ProcId, VertexId};

/// A local edge as seen by one machine: its slot in the local edge table
/// and both endpoints as local vertex ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalEdge {
    pub id: EdgeId,
    pub source: LocalVertexId,
    pub target: LocalVertexId,
}

impl LocalEdge {
    /// The endpoint that is not `lvid`.
    pub fn other(&self, lvid: LocalVertexId) -> LocalVertexId {
        if self.source == lvid { self.target } else { self.source }
    }
}

/// Read-only structural view of one machine's graph partition.
///
/// This is the surface the lock manager needs: replica placement, id
/// translation and local adjacency. It never exposes vertex or edge data.
pub trait LocalTopology: Send + Sync {
    fn procid(&self) -> ProcId;

    fn num_local_vertices(&self) -> usize;

    fn num_local_edges(&self) -> usize;

    fn global_id(&self, lvid: LocalVertexId) -> VertexId;

    fn local_id(&self, gvid: VertexId) -> Option<LocalVertexId>;

    /// Machine holding the master replica of `lvid`.
    fn owner(&self, lvid: LocalVertexId) -> ProcId;

    /// Machines holding mirror replicas of `lvid`, sorted, excluding the owner.
    fn mirrors(&self, lvid: LocalVertexId) -> &[ProcId];

    fn in_edges(&self, lvid: LocalVertexId) -> &[LocalEdge];

    fn out_edges(&self, lvid: LocalVertexId) -> &[LocalEdge];

    fn is_master(&self, lvid: LocalVertexId) -> bool {
        self.owner(lvid) == self.procid()
    }

    /// Number of local edges touching `lvid`.
    fn num_local_incident(&self, lvid: LocalVertexId) -> usize {
        self.in_edges(lvid).len() + self.out_edges(lvid).len()
    }
}
