use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use trellis_core::{EdgeId, LocalVertexId, ProcId, VertexId};

use crate::topology::{LocalEdge, LocalTopology};

/// Placement and global degree of one vertex replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VertexRecord {
    pub gvid: VertexId,
    pub owner: ProcId,
    /// Sorted, excludes the owner.
    pub mirrors: Vec<ProcId>,
    /// In-degree over the whole graph, not just this machine.
    pub num_in_edges: usize,
    /// Out-degree over the whole graph, not just this machine.
    pub num_out_edges: usize,
}

pub(crate) struct LocalVertex<V> {
    pub(crate) record: VertexRecord,
    pub(crate) data: Mutex<V>,
}

pub(crate) struct EdgeSlot<E> {
    pub(crate) edge: LocalEdge,
    pub(crate) data: Mutex<E>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub procid: ProcId,
    pub local_vertices: usize,
    pub owned_vertices: usize,
    pub mirror_vertices: usize,
    pub local_edges: usize,
    pub total_vertices: usize,
    pub total_edges: usize,
}

/// One machine's partition of a distributed graph.
///
/// Every edge lives on exactly one machine. Every vertex with a local edge
/// has a replica here; exactly one replica across the cluster is the
/// master. Vertex and edge data sit behind per-item mutexes so the engine
/// can run edge functions concurrently.
pub struct DistributedGraph<V, E> {
    pub(crate) procid: ProcId,
    pub(crate) num_procs: usize,
    pub(crate) total_vertices: usize,
    pub(crate) total_edges: usize,
    pub(crate) vertices: Vec<LocalVertex<V>>,
    pub(crate) edges: Vec<EdgeSlot<E>>,
    pub(crate) in_edges: Vec<Vec<LocalEdge>>,
    pub(crate) out_edges: Vec<Vec<LocalEdge>>,
    pub(crate) index: HashMap<VertexId, LocalVertexId>,
}

impl<V, E> DistributedGraph<V, E> {
    pub fn num_procs(&self) -> usize {
        self.num_procs
    }

    /// Number of vertices in the whole graph.
    pub fn num_vertices(&self) -> usize {
        self.total_vertices
    }

    /// Number of edges in the whole graph.
    pub fn num_edges(&self) -> usize {
        self.total_edges
    }

    pub fn record(&self, lvid: LocalVertexId) -> &VertexRecord {
        &self.vertices[lvid].record
    }

    /// Machine that owns the master replica of any global id.
    pub fn master_of(&self, gvid: VertexId) -> ProcId {
        (gvid % self.num_procs as u64) as ProcId
    }

    pub fn edge(&self, eid: EdgeId) -> LocalEdge {
        self.edges[eid].edge
    }

    /// Local ids of the vertices whose master lives on this machine.
    pub fn owned_vertices(&self) -> impl Iterator<Item = LocalVertexId> + '_ {
        self.vertices
            .iter()
            .enumerate()
            .filter(move |(_, v)| v.record.owner == self.procid)
            .map(|(lvid, _)| lvid)
    }

    pub fn vertex_data(&self, lvid: LocalVertexId) -> MutexGuard<'_, V> {
        self.vertices[lvid].data.lock()
    }

    /// Lock the data of two distinct vertices in ascending local id order
    /// and return the guards in argument order.
    pub fn lock_vertex_pair(
        &self,
        a: LocalVertexId,
        b: LocalVertexId,
    ) -> (MutexGuard<'_, V>, MutexGuard<'_, V>) {
        debug_assert_ne!(a, b, "self edges are rejected at build time");
        if a < b {
            let ga = self.vertices[a].data.lock();
            let gb = self.vertices[b].data.lock();
            (ga, gb)
        } else {
            let gb = self.vertices[b].data.lock();
            let ga = self.vertices[a].data.lock();
            (ga, gb)
        }
    }

    pub fn edge_data(&self, eid: EdgeId) -> MutexGuard<'_, E> {
        self.edges[eid].data.lock()
    }

    pub fn stats(&self) -> GraphStats {
        let owned = self.owned_vertices().count();
        GraphStats {
            procid: self.procid,
            local_vertices: self.vertices.len(),
            owned_vertices: owned,
            mirror_vertices: self.vertices.len() - owned,
            local_edges: self.edges.len(),
            total_vertices: self.total_vertices,
            total_edges: self.total_edges,
        }
    }
}

impl<V: Send, E: Send> LocalTopology for DistributedGraph<V, E> {
    fn procid(&self) -> ProcId {
        self.procid
    }

    fn num_local_vertices(&self) -> usize {
        self.vertices.len()
    }

    fn num_local_edges(&self) -> usize {
        self.edges.len()
    }

    fn global_id(&self, lvid: LocalVertexId) -> VertexId {
        self.vertices[lvid].record.gvid
    }

    fn local_id(&self, gvid: VertexId) -> Option<LocalVertexId> {
        self.index.get(&gvid).copied()
    }

    fn owner(&self, lvid: LocalVertexId) -> ProcId {
        self.vertices[lvid].record.owner
    }

    fn mirrors(&self, lvid: LocalVertexId) -> &[ProcId] {
        &self.vertices[lvid].record.mirrors
    }

    fn in_edges(&self, lvid: LocalVertexId) -> &[LocalEdge] {
        &self.in_edges[lvid]
    }

    fn out_edges(&self, lvid: LocalVertexId) -> &[LocalEdge] {
        &self.out_edges[lvid]
    }
}
