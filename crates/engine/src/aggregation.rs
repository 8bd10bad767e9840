//! Keyed map-reduce over vertex and edge data.
//!
//! Each key is either run on demand with [`Aggregator::aggregate_now`]
//! (a collective) or on a period. Periodic rounds are driven by machine 0:
//! it announces `(key, round)` to every machine, each machine splits its
//! map into one job per scheduler lane, the worker that finishes a
//! machine's last lane broadcasts the machine's partial, and every machine
//! finalizes once it holds all partials of the round.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trellis_core::ProcId;
use trellis_graph::{DistributedGraph, LocalTopology};
use trellis_rpc::{Message, Rpc, RpcError};

use crate::error::EngineError;
use crate::program::{EdgeView, VertexView};

pub(crate) const TOPIC_START: &str = "engine.aggregate_start";
pub(crate) const TOPIC_PARTIAL: &str = "engine.aggregate_partial";

/// Announcement of a periodic round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RoundStart {
    pub key: String,
    pub round: u64,
}

/// One machine's contribution to a periodic round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RoundPartial {
    pub key: String,
    pub round: u64,
    pub partial: Vec<u8>,
}

/// A registered reduction with its value type erased.
trait Reduction<V, E>: Send + Sync {
    fn map_lane(&self, graph: &DistributedGraph<V, E>, lane: usize, lanes: usize) -> Result<Vec<u8>, EngineError>;

    /// Sum encoded partials into one encoded value.
    fn merge(&self, parts: &[Vec<u8>]) -> Result<Vec<u8>, EngineError>;

    fn finalize(&self, parts: &[Vec<u8>]) -> Result<(), EngineError>;
}

fn sum_parts<T>(parts: &[Vec<u8>]) -> Result<T, EngineError>
where
    T: AddAssign + Default + DeserializeOwned,
{
    let mut total = T::default();
    for bytes in parts {
        total += rmp_serde::from_slice::<T>(bytes)?;
    }
    Ok(total)
}

struct VertexReduction<T, M, F> {
    map: M,
    finalize: F,
    _value: PhantomData<fn() -> T>,
}

impl<V, E, T, M, F> Reduction<V, E> for VertexReduction<T, M, F>
where
    V: Send,
    T: AddAssign + Default + Serialize + DeserializeOwned,
    M: Fn(VertexView<'_, V>) -> T + Send + Sync,
    F: Fn(&T) + Send + Sync,
{
    fn map_lane(&self, graph: &DistributedGraph<V, E>, lane: usize, lanes: usize) -> Result<Vec<u8>, EngineError> {
        let mut total = T::default();
        for (idx, lvid) in graph.owned_vertices().enumerate() {
            if idx % lanes != lane {
                continue;
            }
            let data = graph.vertex_data(lvid);
            total += (self.map)(VertexView::new(graph.record(lvid), &*data));
        }
        Ok(rmp_serde::to_vec(&total)?)
    }

    fn merge(&self, parts: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        Ok(rmp_serde::to_vec(&sum_parts::<T>(parts)?)?)
    }

    fn finalize(&self, parts: &[Vec<u8>]) -> Result<(), EngineError> {
        (self.finalize)(&sum_parts::<T>(parts)?);
        Ok(())
    }
}

struct EdgeReduction<T, M, F> {
    map: M,
    finalize: F,
    _value: PhantomData<fn() -> T>,
}

impl<V, E, T, M, F> Reduction<V, E> for EdgeReduction<T, M, F>
where
    V: Send,
    E: Send,
    T: AddAssign + Default + Serialize + DeserializeOwned,
    M: Fn(EdgeView<'_, V, E>) -> T + Send + Sync,
    F: Fn(&T) + Send + Sync,
{
    fn map_lane(&self, graph: &DistributedGraph<V, E>, lane: usize, lanes: usize) -> Result<Vec<u8>, EngineError> {
        let mut total = T::default();
        for eid in (lane..graph.num_local_edges()).step_by(lanes) {
            let edge = graph.edge(eid);
            let (source, target) = graph.lock_vertex_pair(edge.source, edge.target);
            let data = graph.edge_data(eid);
            total += (self.map)(EdgeView {
                source: VertexView::new(graph.record(edge.source), &*source),
                target: VertexView::new(graph.record(edge.target), &*target),
                data: &*data,
            });
        }
        Ok(rmp_serde::to_vec(&total)?)
    }

    fn merge(&self, parts: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        Ok(rmp_serde::to_vec(&sum_parts::<T>(parts)?)?)
    }

    fn finalize(&self, parts: &[Vec<u8>]) -> Result<(), EngineError> {
        (self.finalize)(&sum_parts::<T>(parts)?);
        Ok(())
    }
}

struct Periodic {
    interval: Duration,
    next_due: Instant,
}

/// Lane results of one round on this machine.
struct LocalRound {
    parts: Vec<Option<Vec<u8>>>,
    remaining: usize,
}

/// Machine partials of one round.
struct GlobalRound {
    parts: Vec<Option<Vec<u8>>>,
    arrived: usize,
}

pub struct Aggregator<V, E> {
    rpc: Rpc,
    graph: Arc<DistributedGraph<V, E>>,
    reductions: RwLock<BTreeMap<String, Arc<dyn Reduction<V, E>>>>,
    periodic: Mutex<BTreeMap<String, Periodic>>,
    running: AtomicBool,
    lanes: Mutex<usize>,
    lane_jobs: RwLock<Vec<Mutex<VecDeque<(String, u64)>>>>,
    local_rounds: Mutex<HashMap<(String, u64), LocalRound>>,
    global_rounds: Mutex<HashMap<(String, u64), GlobalRound>>,
    next_round: AtomicU64,
}

impl<V, E> Aggregator<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn new(rpc: Rpc, graph: Arc<DistributedGraph<V, E>>) -> Self {
        Self {
            rpc,
            graph,
            reductions: RwLock::new(BTreeMap::new()),
            periodic: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            lanes: Mutex::new(1),
            lane_jobs: RwLock::new(Vec::new()),
            local_rounds: Mutex::new(HashMap::new()),
            global_rounds: Mutex::new(HashMap::new()),
            next_round: AtomicU64::new(0),
        }
    }

    fn insert(&self, key: &str, reduction: Arc<dyn Reduction<V, E>>) -> bool {
        if self.running.load(Ordering::SeqCst) {
            warn!(key, "cannot add an aggregator while the engine runs");
            return false;
        }
        let mut reductions = self.reductions.write();
        if reductions.contains_key(key) {
            return false;
        }
        reductions.insert(key.to_string(), reduction);
        true
    }

    /// Register a reduction over the vertices mastered by each machine.
    /// Every machine must register the same keys. Returns false if the key
    /// is taken.
    pub fn add_vertex_aggregator<T, M, F>(&self, key: &str, map: M, finalize: F) -> bool
    where
        T: AddAssign + Default + Serialize + DeserializeOwned + 'static,
        M: Fn(VertexView<'_, V>) -> T + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(key, Arc::new(VertexReduction { map, finalize, _value: PhantomData }))
    }

    /// Register a reduction over every edge.
    pub fn add_edge_aggregator<T, M, F>(&self, key: &str, map: M, finalize: F) -> bool
    where
        T: AddAssign + Default + Serialize + DeserializeOwned + 'static,
        M: Fn(EdgeView<'_, V, E>) -> T + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(key, Arc::new(EdgeReduction { map, finalize, _value: PhantomData }))
    }

    /// Run `key` on `seconds` while the engine runs, and once at start.
    pub fn aggregate_periodic(&self, key: &str, seconds: f64) -> bool {
        if !seconds.is_finite() || seconds < 0.0 || !self.reductions.read().contains_key(key) {
            return false;
        }
        let interval = Duration::from_secs_f64(seconds);
        self.periodic.lock().insert(
            key.to_string(),
            Periodic { interval, next_due: Instant::now() + interval },
        );
        true
    }

    fn reduction(&self, key: &str) -> Result<Arc<dyn Reduction<V, E>>, EngineError> {
        self.reductions
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAggregator(key.to_string()))
    }

    /// Run `key` over the whole graph now. Collective: every machine calls
    /// it with the same key.
    pub async fn aggregate_now(&self, key: &str) -> Result<(), EngineError> {
        let reduction = self.reduction(key)?;
        let lanes = rayon::current_num_threads().max(1);
        let graph = self.graph.as_ref();
        let parts = (0..lanes)
            .into_par_iter()
            .map(|lane| reduction.map_lane(graph, lane, lanes))
            .collect::<Result<Vec<_>, _>>()?;
        let partial = reduction.merge(&parts)?;
        let all = self.rpc.all_gather(partial).await?;
        reduction.finalize(&all)
    }

    /// Collective: run every periodic key once, in key order.
    pub(crate) async fn aggregate_all_periodic(&self) -> Result<(), EngineError> {
        let keys: Vec<String> = self.periodic.lock().keys().cloned().collect();
        for key in keys {
            self.aggregate_now(&key).await?;
        }
        let now = Instant::now();
        for entry in self.periodic.lock().values_mut() {
            entry.next_due = now + entry.interval;
        }
        Ok(())
    }

    pub(crate) fn start(&self, lanes: usize) {
        let lanes = lanes.max(1);
        *self.lanes.lock() = lanes;
        *self.lane_jobs.write() = (0..lanes).map(|_| Mutex::new(VecDeque::new())).collect();
        self.local_rounds.lock().clear();
        self.global_rounds.lock().clear();
        self.running.store(true, Ordering::SeqCst);
    }

    /// Abandon any round still in flight.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for queue in self.lane_jobs.read().iter() {
            queue.lock().clear();
        }
        let local = self.local_rounds.lock().drain().count();
        let global = self.global_rounds.lock().drain().count();
        if local + global > 0 {
            debug!(procid = self.rpc.procid(), local, global, "abandoned aggregation rounds");
        }
    }

    /// Machine 0 announces every key that is due.
    pub(crate) fn tick(&self) {
        if self.rpc.procid() != 0 || !self.running.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let due: Vec<String> = {
            let mut periodic = self.periodic.lock();
            periodic
                .iter_mut()
                .filter(|(_, p)| p.next_due <= now)
                .map(|(key, p)| {
                    p.next_due = now + p.interval;
                    key.clone()
                })
                .collect()
        };
        for key in due {
            let round = self.next_round.fetch_add(1, Ordering::SeqCst);
            debug!(key = %key, round, "starting aggregation round");
            self.broadcast(TOPIC_START, &RoundStart { key, round });
        }
    }

    pub(crate) fn begin_round(&self, key: String, round: u64) {
        if !self.running.load(Ordering::SeqCst) {
            debug!(procid = self.rpc.procid(), key = %key, round, "round arrived while stopped");
            return;
        }
        let lanes = *self.lanes.lock();
        self.local_rounds.lock().insert(
            (key.clone(), round),
            LocalRound { parts: vec![None; lanes], remaining: lanes },
        );
        for queue in self.lane_jobs.read().iter() {
            queue.lock().push_back((key.clone(), round));
        }
    }

    /// Run at most one pending job of `lane`. Returns whether it ran one.
    pub(crate) fn run_lane(&self, lane: usize) -> bool {
        let job = match self.lane_jobs.read().get(lane) {
            Some(queue) => queue.lock().pop_front(),
            None => return false,
        };
        let Some((key, round)) = job else { return false };
        let lanes = *self.lanes.lock();

        let part = self
            .reduction(&key)
            .and_then(|r| r.map_lane(&self.graph, lane, lanes).map(|part| (r, part)));
        let (reduction, part) = match part {
            Ok(found) => found,
            Err(e) => {
                warn!(procid = self.rpc.procid(), key = %key, error = %e, "aggregation lane failed");
                return true;
            }
        };

        let finished = {
            let mut rounds = self.local_rounds.lock();
            let Some(local) = rounds.get_mut(&(key.clone(), round)) else { return true };
            if local.parts[lane].replace(part).is_none() {
                local.remaining -= 1;
            }
            if local.remaining == 0 {
                rounds.remove(&(key.clone(), round))
            } else {
                None
            }
        };

        if let Some(local) = finished {
            let parts: Vec<Vec<u8>> = local.parts.into_iter().flatten().collect();
            match reduction.merge(&parts) {
                Ok(partial) => self.broadcast(TOPIC_PARTIAL, &RoundPartial { key, round, partial }),
                Err(e) => warn!(procid = self.rpc.procid(), key = %key, error = %e, "aggregation merge failed"),
            }
        }
        true
    }

    pub(crate) fn receive_partial(&self, from: ProcId, partial: RoundPartial) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let n = self.rpc.num_procs();
        let complete = {
            let mut rounds = self.global_rounds.lock();
            let id = (partial.key.clone(), partial.round);
            let entry = rounds
                .entry(id.clone())
                .or_insert_with(|| GlobalRound { parts: vec![None; n], arrived: 0 });
            if entry.parts[from as usize].replace(partial.partial).is_none() {
                entry.arrived += 1;
            }
            if entry.arrived == n { rounds.remove(&id) } else { None }
        };
        let Some(global) = complete else { return };
        let parts: Vec<Vec<u8>> = global.parts.into_iter().flatten().collect();
        match self.reduction(&partial.key).and_then(|r| r.finalize(&parts)) {
            Ok(()) => info!(procid = self.rpc.procid(), key = %partial.key, round = partial.round, "aggregation round finalized"),
            Err(e) => warn!(procid = self.rpc.procid(), key = %partial.key, error = %e, "aggregation finalize failed"),
        }
    }

    fn broadcast<T: Serialize>(&self, topic: &str, payload: &T) {
        let result = Message::new(topic, payload)
            .map_err(RpcError::from)
            .and_then(|m| self.rpc.broadcast(self.rpc.machines(), 0, &m));
        if let Err(e) = result {
            warn!(procid = self.rpc.procid(), topic, error = %e, "aggregation broadcast failed");
        }
    }
}
