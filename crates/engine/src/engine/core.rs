use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use trellis_core::{EngineOptions, LocalVertexId, VertexId};
use trellis_graph::{DistributedGraph, LocalTopology};
use trellis_rpc::Rpc;

use super::{SignalOrder, TerminationReason, SERVICE};
use crate::aggregation::Aggregator;
use crate::consensus::AsyncConsensus;
use crate::error::EngineError;
use crate::locks::DistributedChandyMisra;
use crate::messages::MessageArray;
use crate::metrics::{EngineMetrics, RunHistory};
use crate::program::VertexProgram;
use crate::scheduler::{self, Scheduler};

/// How adjacent vertices are kept apart.
pub(crate) enum Consistency {
    /// Only each edge function runs with both endpoints locked.
    Factorized,
    /// Whole executions of adjacent vertices never overlap.
    Exclusive(Arc<DistributedChandyMisra>),
}

/// Per-vertex one-shot channels resolved by the lock manager's callback.
#[derive(Default)]
pub(crate) struct LockWaiters {
    slots: Vec<Mutex<Option<oneshot::Sender<()>>>>,
}

impl LockWaiters {
    fn new(num_vertices: usize) -> Self {
        Self {
            slots: (0..num_vertices).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Must be armed before the lock is requested: the grant may arrive
    /// before the request call returns.
    pub(crate) fn arm(&self, lvid: LocalVertexId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.slots[lvid].lock() = Some(tx);
        rx
    }

    fn fire(&self, lvid: LocalVertexId) {
        match self.slots[lvid].lock().take() {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => warn!(lvid, "lock granted with nobody waiting"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct VertexSlot<G> {
    pub(crate) running: bool,
    pub(crate) has_next: bool,
    pub(crate) cache: Option<G>,
}

impl<G> Default for VertexSlot<G> {
    fn default() -> Self {
        Self { running: false, has_next: false, cache: None }
    }
}

/// State shared by every worker of one machine's engine.
pub(crate) struct EngineShared<P: VertexProgram> {
    pub(crate) rpc: Rpc,
    pub(crate) graph: Arc<DistributedGraph<P::VertexData, P::EdgeData>>,
    pub(crate) options: EngineOptions,
    pub(crate) lanes: usize,
    pub(crate) consistency: Consistency,
    pub(crate) waiters: Arc<LockWaiters>,
    pub(crate) scheduler: Box<dyn Scheduler>,
    pub(crate) messages: MessageArray<P::Message>,
    pub(crate) slots: Vec<Mutex<VertexSlot<P::Gather>>>,
    pub(crate) consensus: Arc<AsyncConsensus>,
    pub(crate) aggregator: Aggregator<P::VertexData, P::EdgeData>,
    pub(crate) started: AtomicBool,
    pub(crate) force_stop: AtomicBool,
    pub(crate) endgame: AtomicBool,
    pub(crate) reason: Mutex<Option<TerminationReason>>,
    pub(crate) start_time: Mutex<Instant>,
    pub(crate) programs_executed: AtomicU64,
    pub(crate) total_updates: AtomicU64,
    pub(crate) task_time_nanos: AtomicU64,
    pub(crate) history: Mutex<RunHistory>,
}

impl<P: VertexProgram> EngineShared<P> {
    pub(crate) fn elapsed_seconds(&self) -> f64 {
        self.start_time.lock().elapsed().as_secs_f64()
    }

    /// Record why the run ends. A stronger reason wins.
    pub(crate) fn set_reason(&self, reason: TerminationReason) {
        let mut current = self.reason.lock();
        if current.map_or(true, |r| r < reason) {
            *current = Some(reason);
        }
    }

    pub(crate) fn lock_manager(&self) -> Option<&Arc<DistributedChandyMisra>> {
        match &self.consistency {
            Consistency::Factorized => None,
            Consistency::Exclusive(locks) => Some(locks),
        }
    }
}

/// One machine's handle to a distributed asynchronous engine.
///
/// Every machine of the cluster builds an engine over its partition of the
/// same graph and calls the collective methods in the same order.
pub struct AsyncEngine<P: VertexProgram> {
    shared: Arc<EngineShared<P>>,
}

impl<P: VertexProgram> AsyncEngine<P> {
    /// Build the engine for this machine and wait for every other machine to
    /// do the same.
    pub async fn new(
        rpc: Rpc,
        graph: Arc<DistributedGraph<P::VertexData, P::EdgeData>>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        options.validate()?;
        let nv = graph.num_local_vertices();
        let lanes = options.resolved_ncpus().min(options.nfibers).max(1);
        let waiters = Arc::new(LockWaiters::new(nv));

        let consistency = if options.factorized {
            Consistency::Factorized
        } else {
            let topology: Arc<dyn LocalTopology> = graph.clone();
            let notify = waiters.clone();
            let locks = DistributedChandyMisra::new(rpc.clone(), topology, move |lvid| notify.fire(lvid)).await?;
            Consistency::Exclusive(locks)
        };

        let shared = Arc::new(EngineShared {
            scheduler: scheduler::from_options(&options, nv, lanes),
            messages: MessageArray::new(nv),
            slots: (0..nv).map(|_| Mutex::new(VertexSlot::default())).collect(),
            consensus: AsyncConsensus::new(rpc.clone(), options.nfibers),
            aggregator: Aggregator::new(rpc.clone(), graph.clone()),
            started: AtomicBool::new(false),
            force_stop: AtomicBool::new(false),
            endgame: AtomicBool::new(false),
            reason: Mutex::new(None),
            start_time: Mutex::new(Instant::now()),
            programs_executed: AtomicU64::new(0),
            total_updates: AtomicU64::new(0),
            task_time_nanos: AtomicU64::new(0),
            history: Mutex::new(RunHistory::default()),
            rpc: rpc.clone(),
            graph,
            options,
            lanes,
            consistency,
            waiters,
        });
        rpc.register(SERVICE, &shared);
        rpc.barrier().await?;

        info!(
            procid = rpc.procid(),
            local_vertices = nv,
            local_edges = shared.graph.num_local_edges(),
            lanes,
            nfibers = shared.options.nfibers,
            factorized = shared.options.factorized,
            scheduler = %shared.options.scheduler,
            "engine ready"
        );
        Ok(Self { shared })
    }

    pub fn graph(&self) -> &Arc<DistributedGraph<P::VertexData, P::EdgeData>> {
        &self.shared.graph
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    pub fn aggregator(&self) -> &Aggregator<P::VertexData, P::EdgeData> {
        &self.shared.aggregator
    }

    /// The lock manager, when running with full consistency.
    pub fn lock_manager(&self) -> Option<&Arc<DistributedChandyMisra>> {
        self.shared.lock_manager()
    }

    /// Programs executed across the cluster during the last run.
    pub fn num_updates(&self) -> u64 {
        self.shared.total_updates.load(Ordering::SeqCst)
    }

    /// Seconds since the last start.
    pub fn elapsed_seconds(&self) -> f64 {
        self.shared.elapsed_seconds()
    }

    /// Metrics of the last finished run.
    pub fn metrics(&self) -> Option<EngineMetrics> {
        self.shared.history.lock().last.clone()
    }

    pub fn history(&self) -> RunHistory {
        self.shared.history.lock().clone()
    }

    /// Collective: every machine contributes `message` for `gvid`, folded at
    /// its master.
    pub async fn signal(&self, gvid: VertexId, message: P::Message) -> Result<(), EngineError> {
        self.shared.rpc.barrier().await?;
        self.shared.signal_gvid(gvid, message);
        self.shared.rpc.barrier().await?;
        Ok(())
    }

    /// Collective: signal every vertex with `message`.
    pub async fn signal_all(&self, message: P::Message, order: SignalOrder) -> Result<(), EngineError> {
        self.shared.signal_owned(message, order);
        self.shared.rpc.barrier().await?;
        Ok(())
    }

    /// Abort the current run on every machine. Tasks already running finish
    /// first. Ignored when no run is in progress.
    pub fn stop(&self) {
        if self.shared.started.load(Ordering::SeqCst) {
            self.shared.request_stop();
        }
    }

    /// Collective: run until the cluster is out of work, the timeout hits or
    /// a program stops the run.
    pub async fn start(&self) -> Result<TerminationReason, EngineError> {
        let s = &self.shared;
        if s.started.load(Ordering::SeqCst) {
            return Err(EngineError::Running("start"));
        }
        let old_fast_track = s.rpc.set_fast_track(false);
        s.consensus.reset();
        s.force_stop.store(false, Ordering::SeqCst);
        s.endgame.store(false, Ordering::SeqCst);
        *s.reason.lock() = None;
        s.programs_executed.store(0, Ordering::SeqCst);
        s.task_time_nanos.store(0, Ordering::SeqCst);

        s.aggregator.start(s.lanes);
        s.aggregator.aggregate_all_periodic().await?;

        s.started.store(true, Ordering::SeqCst);
        s.rpc.barrier().await?;
        *s.start_time.lock() = Instant::now();
        let started_at = Utc::now();
        info!(procid = s.rpc.procid(), nfibers = s.options.nfibers, lanes = s.lanes, "engine started");

        let mut workers = JoinSet::new();
        for worker in 0..s.options.nfibers {
            let shared = s.clone();
            workers.spawn(async move { shared.run_worker(worker).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(procid = s.rpc.procid(), error = %e, "worker task failed");
            }
        }
        s.aggregator.stop();
        let elapsed = s.elapsed_seconds();

        let local_reason = s.reason.lock().unwrap_or(TerminationReason::TaskDepletion);
        let reason = s
            .rpc
            .all_gather_value(&local_reason)
            .await?
            .into_iter()
            .max()
            .unwrap_or(local_reason);

        let local_tasks = s.programs_executed.load(Ordering::SeqCst);
        let completed = s.rpc.all_reduce_sum(local_tasks).await?;
        let joins = s.rpc.all_reduce_sum(s.messages.num_joins()).await?;
        let adds = s.rpc.all_reduce_sum(s.messages.num_adds()).await?;
        let task_nanos = s.rpc.all_reduce_sum(s.task_time_nanos.load(Ordering::SeqCst)).await?;
        s.total_updates.store(completed, Ordering::SeqCst);

        let mean_task_time = (s.options.track_task_time && completed > 0)
            .then(|| Duration::from_nanos(task_nanos / completed));
        if s.rpc.procid() == 0 {
            info!(completed, joins, adds, ?mean_task_time, %reason, elapsed, "engine finished");
        }

        if s.force_stop.load(Ordering::SeqCst) {
            s.scheduler.clear();
            s.messages.clear_all();
        } else if !s.scheduler.is_empty() {
            warn!(procid = s.rpc.procid(), "scheduler not empty after task depletion");
        }
        s.started.store(false, Ordering::SeqCst);
        s.rpc.set_fast_track(old_fast_track);

        s.history.lock().record(EngineMetrics {
            procid: s.rpc.procid(),
            reason,
            started_at,
            elapsed_seconds: elapsed,
            local_tasks,
            completed_tasks: completed,
            schedule_adds: adds,
            schedule_joins: joins,
            mean_task_time,
            locks: s.lock_manager().map(|l| l.stats()),
        });
        Ok(reason)
    }
}
