use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use trellis_core::LocalVertexId;
use trellis_graph::LocalTopology;

use super::{EngineShared, TerminationReason, TOPIC_ENDGAME};
use crate::consensus::Pending;
use crate::program::{Context, VertexMut, VertexProgram, VertexView};

/// Outcome of the last look for work before a worker sleeps.
enum Recheck<'a, M> {
    Task(LocalVertexId, M),
    Sleep(Pending<'a>),
}

impl<P: VertexProgram> EngineShared<P> {
    /// One worker's loop. Returns once the cluster agreed the run is over.
    pub(crate) async fn run_worker(self: Arc<Self>, worker: usize) {
        let lane = worker % self.lanes;
        let tick = Duration::from_millis(self.options.aggregator_tick_ms);
        let mut last_tick = Instant::now();

        loop {
            if !self.endgame.load(Ordering::SeqCst) && last_tick.elapsed() >= tick {
                self.aggregator.tick();
                last_tick = Instant::now();
            }
            while self.aggregator.run_lane(lane) {}
            self.check_timeout();

            match self.next_task(lane) {
                Some((lvid, message)) => {
                    self.eval_task(lvid, message).await;
                    if self.endgame.load(Ordering::SeqCst) {
                        self.rpc.flush();
                    }
                }
                None => {
                    if self.try_to_quit(worker, lane).await {
                        break;
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        debug!(procid = self.rpc.procid(), worker, "worker finished");
    }

    fn check_timeout(&self) {
        let Some(limit) = self.options.timeout_duration() else { return };
        if self.force_stop.load(Ordering::SeqCst) || self.elapsed_seconds() < limit.as_secs_f64() {
            return;
        }
        if !self.force_stop.swap(true, Ordering::SeqCst) {
            info!(procid = self.rpc.procid(), elapsed = self.elapsed_seconds(), "timeout");
            self.set_reason(TerminationReason::Timeout);
            self.consensus.cancel();
        }
    }

    /// Pop the next vertex with a pending message. A stopped engine drops
    /// all of its work instead.
    fn next_task(&self, lane: usize) -> Option<(LocalVertexId, P::Message)> {
        if self.force_stop.load(Ordering::SeqCst) {
            self.scheduler.clear();
            self.messages.clear_all();
            return None;
        }
        while let Some(lvid) = self.scheduler.get_next(lane) {
            if let Some(message) = self.messages.get(lvid) {
                return Some((lvid, message));
            }
        }
        None
    }

    /// Returns true when the cluster is done.
    async fn try_to_quit(&self, worker: usize, lane: usize) -> bool {
        tokio::task::yield_now().await;
        self.check_timeout();
        match self.recheck(worker, lane) {
            Recheck::Task(lvid, message) => {
                self.eval_task(lvid, message).await;
                false
            }
            Recheck::Sleep(pending) => pending.wait().await,
        }
    }

    fn recheck(&self, worker: usize, lane: usize) -> Recheck<'_, P::Message> {
        let section = self.consensus.begin_done_critical_section(worker);
        if let Some((lvid, message)) = self.next_task(lane) {
            section.cancel();
            return Recheck::Task(lvid, message);
        }
        if !self.endgame.swap(true, Ordering::SeqCst) {
            debug!(procid = self.rpc.procid(), "entering endgame");
            self.rpc.set_fast_track(true);
            let me = self.rpc.procid();
            for target in self.rpc.machines().filter(|&p| p != me) {
                self.send(target, TOPIC_ENDGAME, &());
            }
        }
        Recheck::Sleep(section.end())
    }

    /// Run one vertex program on a vertex mastered here.
    pub(crate) async fn eval_task(&self, lvid: LocalVertexId, message: P::Message) {
        let started = self.options.track_task_time.then(Instant::now);
        let record = self.graph.record(lvid);
        if !self.graph.is_master(lvid) {
            self.forward_signal(record.owner, record.gvid, message);
            return;
        }
        let Some(message) = self.claim(lvid, message) else { return };

        if let Some(locks) = self.lock_manager() {
            let granted = self.waiters.arm(lvid);
            locks.make_philosopher_hungry(lvid);
            if granted.await.is_err() {
                warn!(procid = self.rpc.procid(), gvid = record.gvid, "lock grant dropped");
                self.release(lvid);
                return;
            }
        }

        let ctx = Context::new(self);
        let mut program = P::default();
        {
            let data = self.graph.vertex_data(lvid);
            program.init(&ctx, VertexView::new(record, &*data), &message);
        }

        let total = self.gather_all(lvid, &program).await.unwrap_or_default();

        let mirror_data = {
            let mut data = self.graph.vertex_data(lvid);
            program.apply(&ctx, VertexMut::new(record, &mut *data), &total);
            (!record.mirrors.is_empty()).then(|| (*data).clone())
        };

        self.scatter_all(lvid, &program, mirror_data).await;
        self.release(lvid);

        self.programs_executed.fetch_add(1, Ordering::Relaxed);
        if let Some(started) = started {
            self.task_time_nanos
                .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
    }
}
