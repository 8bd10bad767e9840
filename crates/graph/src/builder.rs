use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::Path;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info};
use trellis_core::{LocalVertexId, ProcId, TrellisError, VertexId};

use crate::store::{DistributedGraph, EdgeSlot, LocalVertex, VertexRecord};
use crate::topology::LocalEdge;

/// How edges are assigned to machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionStrategy {
    /// Hash of the (source, target) pair. Spreads high-degree vertices.
    #[default]
    Hashed,
    /// Edge lives with its source's master.
    BySource,
}

/// Collects a global graph and cuts it into per-machine partitions.
pub struct GraphBuilder<V, E> {
    vertices: BTreeMap<VertexId, V>,
    edges: Vec<(VertexId, VertexId, E)>,
    edge_set: HashSet<(VertexId, VertexId)>,
}

impl<V, E> Default for GraphBuilder<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> GraphBuilder<V, E> {
    pub fn new() -> Self {
        Self {
            vertices: BTreeMap::new(),
            edges: Vec::new(),
            edge_set: HashSet::new(),
        }
    }

    /// Add a vertex with data. Returns `false` if the id already exists.
    pub fn add_vertex(&mut self, gvid: VertexId, data: V) -> bool {
        if self.vertices.contains_key(&gvid) {
            return false;
        }
        self.vertices.insert(gvid, data);
        true
    }

    /// Add a directed edge. Self edges and repeated (source, target) pairs
    /// are rejected with `false`.
    pub fn add_edge(&mut self, source: VertexId, target: VertexId, data: E) -> bool {
        if source == target || !self.edge_set.insert((source, target)) {
            return false;
        }
        self.edges.push((source, target, data));
        true
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Distinct vertex ids, counting endpoints that were never added explicitly.
    pub fn num_vertices(&self) -> usize {
        let mut ids: BTreeSet<VertexId> = self.vertices.keys().copied().collect();
        for (s, t, _) in &self.edges {
            ids.insert(*s);
            ids.insert(*t);
        }
        ids.len()
    }
}

impl<V: Default, E: Default> GraphBuilder<V, E> {
    /// Read a whitespace-separated `source target` edge list. Blank lines and
    /// lines starting with `#` or `%` are skipped. Returns the number of
    /// edges accepted.
    pub fn load_edge_list(&mut self, path: impl AsRef<Path>) -> Result<usize, TrellisError> {
        let file = std::fs::File::open(path.as_ref())?;
        self.read_edge_list(BufReader::new(file))
    }

    pub fn read_edge_list(&mut self, reader: impl BufRead) -> Result<usize, TrellisError> {
        let mut accepted = 0;
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('%') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(src), Some(dst)) = (parts.next(), parts.next()) else {
                return Err(TrellisError::EdgeList {
                    line: idx + 1,
                    reason: "expected two vertex ids".into(),
                });
            };
            let parse = |s: &str| {
                s.parse::<VertexId>().map_err(|e| TrellisError::EdgeList {
                    line: idx + 1,
                    reason: format!("bad vertex id '{s}': {e}"),
                })
            };
            if self.add_edge(parse(src)?, parse(dst)?, E::default()) {
                accepted += 1;
            }
        }
        Ok(accepted)
    }
}

fn edge_hash(source: VertexId, target: VertexId) -> u64 {
    // splitmix64 over the packed pair
    let mut z = source
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(target)
        .wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl<V, E> GraphBuilder<V, E>
where
    V: Clone + Default + Send + Sync,
    E: Send,
{
    /// Cut the graph into `num_procs` partitions, one per machine, indexed by
    /// machine id. The master of vertex `v` is machine `v % num_procs`.
    pub fn partition(
        self,
        num_procs: usize,
        strategy: PartitionStrategy,
    ) -> Vec<DistributedGraph<V, E>> {
        assert!(num_procs > 0, "a cluster needs at least one machine");
        let n = num_procs as u64;
        let owner_of = |gvid: VertexId| (gvid % n) as ProcId;

        let mut vertex_data = self.vertices;
        let mut in_degree: HashMap<VertexId, usize> = HashMap::new();
        let mut out_degree: HashMap<VertexId, usize> = HashMap::new();
        let mut replicas: HashMap<VertexId, BTreeSet<ProcId>> = HashMap::new();
        let mut per_machine: Vec<Vec<(VertexId, VertexId, E)>> =
            (0..num_procs).map(|_| Vec::new()).collect();

        for (source, target, data) in self.edges {
            let machine = match strategy {
                PartitionStrategy::Hashed => (edge_hash(source, target) % n) as ProcId,
                PartitionStrategy::BySource => owner_of(source),
            };
            vertex_data.entry(source).or_default();
            vertex_data.entry(target).or_default();
            *out_degree.entry(source).or_default() += 1;
            *in_degree.entry(target).or_default() += 1;
            replicas.entry(source).or_default().insert(machine);
            replicas.entry(target).or_default().insert(machine);
            per_machine[machine as usize].push((source, target, data));
        }

        let total_vertices = vertex_data.len();
        let total_edges: usize = per_machine.iter().map(Vec::len).sum();

        let mut records: BTreeMap<VertexId, VertexRecord> = BTreeMap::new();
        for &gvid in vertex_data.keys() {
            let owner = owner_of(gvid);
            let mut placed = replicas.remove(&gvid).unwrap_or_default();
            placed.insert(owner);
            records.insert(
                gvid,
                VertexRecord {
                    gvid,
                    owner,
                    mirrors: placed.into_iter().filter(|&p| p != owner).collect(),
                    num_in_edges: in_degree.get(&gvid).copied().unwrap_or(0),
                    num_out_edges: out_degree.get(&gvid).copied().unwrap_or(0),
                },
            );
        }

        let records = &records;
        let vertex_data = &vertex_data;
        let graphs: Vec<DistributedGraph<V, E>> = per_machine
            .into_par_iter()
            .enumerate()
            .map(|(machine, edges)| {
                build_partition(
                    machine as ProcId,
                    num_procs,
                    total_vertices,
                    total_edges,
                    edges,
                    records,
                    vertex_data,
                )
            })
            .collect();

        info!(
            machines = num_procs,
            vertices = total_vertices,
            edges = total_edges,
            "graph partitioned"
        );
        graphs
    }
}

fn build_partition<V: Clone, E>(
    procid: ProcId,
    num_procs: usize,
    total_vertices: usize,
    total_edges: usize,
    edges: Vec<(VertexId, VertexId, E)>,
    records: &BTreeMap<VertexId, VertexRecord>,
    vertex_data: &BTreeMap<VertexId, V>,
) -> DistributedGraph<V, E> {
    // BTreeMap iteration keeps local ids ordered by global id.
    let local: Vec<&VertexRecord> = records
        .values()
        .filter(|r| r.owner == procid || r.mirrors.contains(&procid))
        .collect();

    let index: HashMap<VertexId, LocalVertexId> = local
        .iter()
        .enumerate()
        .map(|(lvid, r)| (r.gvid, lvid))
        .collect();

    let vertices: Vec<LocalVertex<V>> = local
        .iter()
        .map(|r| LocalVertex {
            record: (*r).clone(),
            data: Mutex::new(vertex_data[&r.gvid].clone()),
        })
        .collect();

    let mut in_edges: Vec<Vec<LocalEdge>> = vec![Vec::new(); vertices.len()];
    let mut out_edges: Vec<Vec<LocalEdge>> = vec![Vec::new(); vertices.len()];
    let mut slots = Vec::with_capacity(edges.len());

    for (id, (source, target, data)) in edges.into_iter().enumerate() {
        let edge = LocalEdge {
            id,
            source: index[&source],
            target: index[&target],
        };
        out_edges[edge.source].push(edge);
        in_edges[edge.target].push(edge);
        slots.push(EdgeSlot { edge, data: Mutex::new(data) });
    }

    debug!(
        procid,
        local_vertices = vertices.len(),
        local_edges = slots.len(),
        "built partition"
    );

    DistributedGraph {
        procid,
        num_procs,
        total_vertices,
        total_edges,
        vertices,
        edges: slots,
        in_edges,
        out_edges,
        index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::LocalTopology;

    #[test]
    fn rejects_self_and_duplicate_edges() {
        let mut b: GraphBuilder<(), ()> = GraphBuilder::new();
        assert!(b.add_edge(1, 2, ()));
        assert!(!b.add_edge(1, 2, ()));
        assert!(!b.add_edge(3, 3, ()));
        assert!(b.add_edge(2, 1, ()));
        assert_eq!(b.num_edges(), 2);
    }

    #[test]
    fn rejects_duplicate_vertex() {
        let mut b: GraphBuilder<u32, ()> = GraphBuilder::new();
        assert!(b.add_vertex(7, 1));
        assert!(!b.add_vertex(7, 2));
    }

    #[test]
    fn single_machine_holds_everything() {
        let mut b: GraphBuilder<u32, ()> = GraphBuilder::new();
        b.add_vertex(0, 10);
        b.add_edge(0, 1, ());
        b.add_edge(1, 2, ());
        let graphs = b.partition(1, PartitionStrategy::Hashed);
        assert_eq!(graphs.len(), 1);
        let g = &graphs[0];
        assert_eq!(g.num_local_vertices(), 3);
        assert_eq!(g.num_local_edges(), 2);
        assert_eq!(*g.vertex_data(0), 10);
        assert_eq!(*g.vertex_data(2), 0);
        for lvid in 0..3 {
            assert!(g.is_master(lvid));
            assert!(g.mirrors(lvid).is_empty());
        }
    }

    #[test]
    fn local_ids_follow_global_order() {
        let mut b: GraphBuilder<(), ()> = GraphBuilder::new();
        b.add_edge(40, 10, ());
        b.add_edge(10, 30, ());
        let g = b.partition(1, PartitionStrategy::Hashed).remove(0);
        let ids: Vec<VertexId> = (0..g.num_local_vertices()).map(|l| g.global_id(l)).collect();
        assert_eq!(ids, vec![10, 30, 40]);
        assert_eq!(g.local_id(30), Some(1));
        assert_eq!(g.local_id(99), None);
    }

    #[test]
    fn every_edge_on_exactly_one_machine() {
        let mut b: GraphBuilder<(), ()> = GraphBuilder::new();
        for i in 0..50u64 {
            b.add_edge(i, (i + 1) % 50, ());
            b.add_edge(i, (i + 7) % 50, ());
        }
        let graphs = b.partition(4, PartitionStrategy::Hashed);
        let total: usize = graphs.iter().map(|g| g.num_local_edges()).sum();
        assert_eq!(total, 100);
        for g in &graphs {
            assert_eq!(g.num_edges(), 100);
            assert_eq!(g.num_vertices(), 50);
        }
    }

    #[test]
    fn replicas_agree_on_placement() {
        let mut b: GraphBuilder<(), ()> = GraphBuilder::new();
        for i in 1..20u64 {
            b.add_edge(i, 0, ());
        }
        let graphs = b.partition(3, PartitionStrategy::Hashed);

        // Exactly one master per vertex, and every replica lists the same mirrors.
        for gvid in 0..20u64 {
            let holders: Vec<&DistributedGraph<(), ()>> =
                graphs.iter().filter(|g| g.local_id(gvid).is_some()).collect();
            let masters = holders
                .iter()
                .filter(|g| g.is_master(g.local_id(gvid).unwrap()))
                .count();
            assert_eq!(masters, 1, "vertex {gvid}");
            let first = holders[0].record(holders[0].local_id(gvid).unwrap()).clone();
            assert_eq!(first.owner as u64, gvid % 3);
            assert_eq!(holders.len(), first.mirrors.len() + 1);
            for g in &holders {
                assert_eq!(g.record(g.local_id(gvid).unwrap()), &first);
            }
        }

        let hub = graphs[0].record(graphs[0].local_id(0).unwrap());
        assert_eq!(hub.num_in_edges, 19);
        assert_eq!(hub.num_out_edges, 0);
    }

    #[test]
    fn by_source_keeps_out_edges_with_master() {
        let mut b: GraphBuilder<(), ()> = GraphBuilder::new();
        for i in 0..12u64 {
            b.add_edge(i, (i + 5) % 12, ());
        }
        let graphs = b.partition(3, PartitionStrategy::BySource);
        for g in &graphs {
            for lvid in 0..g.num_local_vertices() {
                if !g.out_edges(lvid).is_empty() {
                    assert!(g.is_master(lvid));
                }
            }
        }
    }

    #[test]
    fn edge_list_parsing() {
        let text = "# comment\n0 1\n1\t2\n\n2 2\n0 1\n";
        let mut b: GraphBuilder<(), ()> = GraphBuilder::new();
        let accepted = b.read_edge_list(text.as_bytes()).unwrap();
        assert_eq!(accepted, 2);
        assert_eq!(b.num_vertices(), 3);

        let mut bad: GraphBuilder<(), ()> = GraphBuilder::new();
        let err = bad.read_edge_list("0 x\n".as_bytes()).unwrap_err();
        assert!(matches!(err, TrellisError::EdgeList { line: 1, .. }));
    }

    #[test]
    fn vertex_pair_locking_returns_argument_order() {
        let mut b: GraphBuilder<u32, ()> = GraphBuilder::new();
        b.add_vertex(0, 100);
        b.add_vertex(1, 200);
        b.add_edge(0, 1, ());
        let g = b.partition(1, PartitionStrategy::Hashed).remove(0);
        let (hi, lo) = g.lock_vertex_pair(1, 0);
        assert_eq!(*hi, 200);
        assert_eq!(*lo, 100);
    }
}
