//! Whole runs of the engine on in-process clusters of several machines.

use std::collections::{BTreeMap, HashSet};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use trellis_core::{EdgeDirection, EngineOptions, VertexId};
use trellis_engine::algorithms::{Degrees, NeighbourCount, PageRank};
use trellis_engine::{
    AsyncEngine, Combine, Context, EdgeMut, EdgeView, SignalOrder, TerminationReason, VertexMut, VertexProgram, VertexView,
};
use trellis_graph::{generators, GraphBuilder, LocalTopology, PartitionStrategy};
use trellis_rpc::{LocalCluster, RpcConfig};

async fn cluster<P: VertexProgram>(
    machines: usize,
    builder: GraphBuilder<P::VertexData, P::EdgeData>,
    strategy: PartitionStrategy,
    options: EngineOptions,
) -> Vec<AsyncEngine<P>> {
    let rpcs = LocalCluster::spawn(machines, RpcConfig::local());
    let graphs = builder.partition(machines, strategy);
    join_all(
        rpcs.into_iter()
            .zip(graphs)
            .map(|(rpc, graph)| AsyncEngine::<P>::new(rpc, Arc::new(graph), options.clone())),
    )
    .await
    .into_iter()
    .map(Result::unwrap)
    .collect()
}

async fn signal_all<P: VertexProgram>(engines: &[AsyncEngine<P>], message: P::Message) {
    for result in join_all(engines.iter().map(|e| e.signal_all(message.clone(), SignalOrder::Shuffle))).await {
        result.unwrap();
    }
}

async fn start_all<P: VertexProgram>(engines: &[AsyncEngine<P>]) -> TerminationReason {
    let reasons: Vec<TerminationReason> = join_all(engines.iter().map(|e| e.start()))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert!(reasons.windows(2).all(|w| w[0] == w[1]), "machines disagree: {:?}", reasons);
    reasons[0]
}

fn options(factorized: bool) -> EngineOptions {
    EngineOptions {
        nfibers: 8,
        ncpus: 2,
        factorized,
        ..Default::default()
    }
}

/// Every replica of every vertex holds the same bytes.
fn assert_mirrors_match<P: VertexProgram>(engines: &[AsyncEngine<P>]) {
    for engine in engines {
        let graph = engine.graph();
        for lvid in graph.owned_vertices() {
            let record = graph.record(lvid);
            let master = rmp_serde::to_vec(&*graph.vertex_data(lvid)).unwrap();
            for &mirror in &record.mirrors {
                let other = engines[mirror as usize].graph();
                let mlvid = other.local_id(record.gvid).unwrap();
                let copy = rmp_serde::to_vec(&*other.vertex_data(mlvid)).unwrap();
                assert_eq!(master, copy, "vertex {} differs on machine {}", record.gvid, mirror);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn neighbour_counts_in_both_modes() {
    for factorized in [true, false] {
        let engines = cluster::<NeighbourCount>(3, generators::grid(4, 5), PartitionStrategy::Hashed, options(factorized)).await;
        signal_all(&engines, ()).await;
        assert_eq!(start_all(&engines).await, TerminationReason::TaskDepletion);
        assert_eq!(engines[0].num_updates(), 20);

        for engine in &engines {
            let graph = engine.graph();
            for lvid in graph.owned_vertices() {
                let record = graph.record(lvid);
                let expected = Degrees { inbound: record.num_in_edges, outbound: record.num_out_edges };
                assert_eq!(*graph.vertex_data(lvid), expected, "vertex {} factorized={}", record.gvid, factorized);
            }
            if let Some(locks) = engine.lock_manager() {
                locks.verify_quiescent().unwrap();
            }
        }
        assert_mirrors_match(&engines);
    }
}

/// Every vertex starts at 1 and sums its own value with those of all its
/// neighbours once. Values gathered from are never written, so the result
/// does not depend on the execution order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Tally {
    value: u64,
    sum: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NeighbourSum;

impl VertexProgram for NeighbourSum {
    type VertexData = Tally;
    type EdgeData = ();
    type Gather = u64;
    type Message = ();

    fn gather_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Tally>) -> EdgeDirection {
        EdgeDirection::All
    }

    fn gather(&self, _ctx: &Context<'_, Self>, vertex: VertexView<'_, Tally>, edge: EdgeView<'_, Tally, ()>) -> u64 {
        if edge.source.gvid == vertex.gvid {
            edge.target.data.value
        } else {
            edge.source.data.value
        }
    }

    fn apply(&mut self, _ctx: &Context<'_, Self>, vertex: VertexMut<'_, Tally>, total: &u64) {
        vertex.data.sum = vertex.data.value + total;
    }

    fn scatter_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, Tally>) -> EdgeDirection {
        EdgeDirection::None
    }
}

/// A star of 12 pointing at 0, with the leaves also chained 1 -> 2 -> ... -> 11.
fn star_with_rim() -> Vec<(VertexId, VertexId)> {
    let spokes = (1..12).map(|leaf| (leaf, 0));
    let rim = (1..11).map(|leaf| (leaf, leaf + 1));
    spokes.chain(rim).collect()
}

/// The same sums computed one vertex at a time.
fn sequential_sums(edges: &[(VertexId, VertexId)]) -> BTreeMap<VertexId, u64> {
    let mut sums: BTreeMap<VertexId, u64> = BTreeMap::new();
    for &(source, target) in edges {
        *sums.entry(source).or_insert(1) += 1;
        *sums.entry(target).or_insert(1) += 1;
    }
    sums
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn neighbour_sums_match_a_sequential_run() {
    let edges = star_with_rim();
    let expected = sequential_sums(&edges);
    assert_eq!(expected[&0], 12);

    for factorized in [true, false] {
        let mut builder = GraphBuilder::new();
        for &gvid in expected.keys() {
            builder.add_vertex(gvid, Tally { value: 1, sum: 0 });
        }
        for &(source, target) in &edges {
            builder.add_edge(source, target, ());
        }

        let engines = cluster::<NeighbourSum>(2, builder, PartitionStrategy::Hashed, options(factorized)).await;
        signal_all(&engines, ()).await;
        assert_eq!(start_all(&engines).await, TerminationReason::TaskDepletion);
        assert_eq!(engines[0].num_updates(), expected.len() as u64);

        let mut found = BTreeMap::new();
        for engine in &engines {
            let graph = engine.graph();
            for lvid in graph.owned_vertices() {
                found.insert(graph.global_id(lvid), graph.vertex_data(lvid).sum);
            }
            if let Some(locks) = engine.lock_manager() {
                locks.verify_quiescent().unwrap();
            }
        }
        assert_eq!(found, expected, "factorized={}", factorized);
        assert_mirrors_match(&engines);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_cluster_terminates() {
    let engines = cluster::<NeighbourCount>(3, generators::ring(6), PartitionStrategy::BySource, options(true)).await;
    assert_eq!(start_all(&engines).await, TerminationReason::TaskDepletion);
    assert!(engines.iter().all(|e| e.num_updates() == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pagerank_spreads_across_machines() {
    let engines = cluster::<PageRank>(2, generators::ring(10), PartitionStrategy::Hashed, options(true)).await;
    signal_all(&engines, ()).await;
    assert_eq!(start_all(&engines).await, TerminationReason::TaskDepletion);

    for engine in &engines {
        let graph = engine.graph();
        for lvid in graph.owned_vertices() {
            let rank = *graph.vertex_data(lvid);
            assert!((rank - 1.0).abs() < 0.05, "vertex {} has rank {}", graph.global_id(lvid), rank);
        }
    }
    assert_mirrors_match(&engines);
}

// ── Mutual exclusion ──────────────────────────────────────────────────

static RUNNING: Mutex<Vec<VertexId>> = Mutex::new(Vec::new());
static OVERLAPS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Neighbours(Vec<VertexId>);

impl AddAssign for Neighbours {
    fn add_assign(&mut self, other: Self) {
        self.0.extend(other.0);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Rounds(u32);

impl Combine for Rounds {
    fn combine(&mut self, other: Self) {
        self.0 = self.0.max(other.0);
    }
}

/// Marks itself running from `init` to the end of `apply` and checks that
/// no neighbour is marked meanwhile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Exclusive {
    rounds: u32,
}

impl VertexProgram for Exclusive {
    type VertexData = u32;
    type EdgeData = ();
    type Gather = Neighbours;
    type Message = Rounds;

    fn init(&mut self, _ctx: &Context<'_, Self>, vertex: VertexView<'_, u32>, message: &Rounds) {
        self.rounds = message.0;
        RUNNING.lock().unwrap().push(vertex.gvid);
    }

    fn gather_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, u32>) -> EdgeDirection {
        EdgeDirection::All
    }

    fn gather(&self, _ctx: &Context<'_, Self>, vertex: VertexView<'_, u32>, edge: EdgeView<'_, u32, ()>) -> Neighbours {
        let other = if edge.source.gvid == vertex.gvid { edge.target.gvid } else { edge.source.gvid };
        Neighbours(vec![other])
    }

    fn apply(&mut self, ctx: &Context<'_, Self>, vertex: VertexMut<'_, u32>, total: &Neighbours) {
        std::thread::sleep(Duration::from_micros(200));
        let mut running = RUNNING.lock().unwrap();
        let neighbours: HashSet<VertexId> = total.0.iter().copied().collect();
        if running.iter().any(|v| neighbours.contains(v)) {
            OVERLAPS.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(pos) = running.iter().position(|&v| v == vertex.gvid) {
            running.swap_remove(pos);
        }
        drop(running);

        *vertex.data += 1;
        if self.rounds > 1 {
            ctx.signal(vertex.gvid, Rounds(self.rounds - 1));
        }
    }

    fn scatter_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, u32>) -> EdgeDirection {
        EdgeDirection::None
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adjacent_vertices_never_overlap_with_full_consistency() {
    let engines = cluster::<Exclusive>(2, generators::grid(4, 4), PartitionStrategy::Hashed, options(false)).await;
    signal_all(&engines, Rounds(3)).await;
    assert_eq!(start_all(&engines).await, TerminationReason::TaskDepletion);

    assert_eq!(OVERLAPS.load(Ordering::SeqCst), 0);
    assert!(RUNNING.lock().unwrap().is_empty());
    for engine in &engines {
        let graph = engine.graph();
        for lvid in graph.owned_vertices() {
            assert_eq!(*graph.vertex_data(lvid), 3, "vertex {}", graph.global_id(lvid));
        }
        engine.lock_manager().unwrap().verify_quiescent().unwrap();
    }
    assert_mirrors_match(&engines);
}

// ── Termination ───────────────────────────────────────────────────────

/// Forwards a token along out-edges until its hop count runs out, then
/// stops the whole cluster if the last vertex is marked to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Relay {
    hops: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct Hops(u32);

impl Combine for Hops {
    fn combine(&mut self, other: Self) {
        self.0 = self.0.max(other.0);
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct RelayState {
    visits: u32,
    stop_at_end: bool,
    left: u32,
}

impl VertexProgram for Relay {
    type VertexData = RelayState;
    type EdgeData = ();
    type Gather = u32;
    type Message = Hops;

    fn init(&mut self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, RelayState>, message: &Hops) {
        self.hops = message.0;
    }

    fn gather_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, RelayState>) -> EdgeDirection {
        EdgeDirection::None
    }

    fn apply(&mut self, ctx: &Context<'_, Self>, vertex: VertexMut<'_, RelayState>, _total: &u32) {
        vertex.data.visits += 1;
        vertex.data.left = self.hops;
        if self.hops == 0 && vertex.data.stop_at_end {
            ctx.stop();
        }
    }

    fn scatter_edges(&self, _ctx: &Context<'_, Self>, _vertex: VertexView<'_, RelayState>) -> EdgeDirection {
        if self.hops > 0 {
            EdgeDirection::Out
        } else {
            EdgeDirection::None
        }
    }

    fn scatter(&self, ctx: &Context<'_, Self>, _vertex: VertexView<'_, RelayState>, edge: EdgeMut<'_, RelayState, ()>) {
        ctx.signal(edge.target.gvid, Hops(self.hops - 1));
    }
}

fn relay_ring(n: usize, stop_at_end: bool) -> GraphBuilder<RelayState, ()> {
    let mut b = GraphBuilder::new();
    for v in 0..n as VertexId {
        b.add_vertex(v, RelayState { stop_at_end, ..Default::default() });
    }
    for v in 0..n as VertexId {
        b.add_edge(v, (v + 1) % n as VertexId, ());
    }
    b
}

async fn signal_one<P: VertexProgram>(engines: &[AsyncEngine<P>], gvid: VertexId, message: P::Message) {
    // Collective: one machine contributes the message, the rest contribute
    // an empty one that folds away.
    for result in join_all(engines.iter().enumerate().map(|(m, e)| {
        let msg = if m == 0 { message.clone() } else { P::Message::default() };
        e.signal(gvid, msg)
    }))
    .await
    {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn token_travels_until_depletion() {
    let engines = cluster::<Relay>(3, relay_ring(7, false), PartitionStrategy::BySource, options(true)).await;
    signal_one(&engines, 0, Hops(20)).await;
    assert_eq!(start_all(&engines).await, TerminationReason::TaskDepletion);
    assert_eq!(engines[0].num_updates(), 21);

    // Hop 20 lands on vertex 20 % 7 = 6.
    let last = &engines[6 % 3];
    let graph = last.graph();
    let state = *graph.vertex_data(graph.local_id(6).unwrap());
    assert_eq!(state.left, 0);
    assert_mirrors_match(&engines);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_from_one_machine_aborts_every_machine() {
    let engines = cluster::<Relay>(3, relay_ring(5, true), PartitionStrategy::Hashed, options(true)).await;
    signal_one(&engines, 0, Hops(12)).await;
    assert_eq!(start_all(&engines).await, TerminationReason::ForcedAbort);
    let metrics = engines[1].metrics().unwrap();
    assert_eq!(metrics.reason, TerminationReason::ForcedAbort);
}
