//! Distributed fork-based lock manager.
//!
//! Chandy-Misra dining philosophers over a vertex-cut graph: every local
//! edge carries a fork, every local vertex replica is a philosopher. A
//! vertex is locked once every replica holds all of its local forks and
//! the master has collected a readiness signal from each of them.
//!
//! Lock ordering: philosopher mutexes are taken in ascending local id
//! (with try-lock backoff when a higher id is already held); fork mutexes
//! are leaves, taken only while both endpoint philosophers are held.
//! No guard is ever held while a message is sent to another machine.

mod fork;
mod verify;


pub use fork::PhilosopherState;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trellis_core::{EdgeId, LocalVertexId, ProcId, VertexId};
use trellis_graph::{LocalEdge, LocalTopology};
use trellis_rpc::{Message, Rpc, RpcError, Service};

use self::fork::{by_side, Fork, Philosopher, Side};

/// Service name the lock manager registers under.
pub const SERVICE: &str = "locks";

type PhilosopherGuard<'a> = MutexGuard<'a, Philosopher>;

/// Invoked on the master replica when a vertex's lock is granted.
pub type LockCallback = Box<dyn Fn(LocalVertexId) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LockMessage {
    MakeHungry { gvid: VertexId, lock_id: bool },
    CancellationRequest { gvid: VertexId, requestor: ProcId, lock_id: bool },
    CancellationAccept { gvid: VertexId, lock_id: bool },
    SignalReady { gvid: VertexId, lock_id: bool },
    SetEating { gvid: VertexId, lock_id: bool },
    StopsEating { gvid: VertexId },
}

impl LockMessage {
    fn gvid(&self) -> VertexId {
        match *self {
            LockMessage::MakeHungry { gvid, .. }
            | LockMessage::CancellationRequest { gvid, .. }
            | LockMessage::CancellationAccept { gvid, .. }
            | LockMessage::SignalReady { gvid, .. }
            | LockMessage::SetEating { gvid, .. }
            | LockMessage::StopsEating { gvid } => gvid,
        }
    }

    fn topic(&self) -> &'static str {
        match self {
            LockMessage::MakeHungry { .. } => "locks.make_hungry",
            LockMessage::CancellationRequest { .. } => "locks.cancellation_request",
            LockMessage::CancellationAccept { .. } => "locks.cancellation_accept",
            LockMessage::SignalReady { .. } => "locks.signal_ready",
            LockMessage::SetEating { .. } => "locks.set_eating",
            LockMessage::StopsEating { .. } => "locks.stops_eating",
        }
    }
}

/// Every message about one vertex shares a sequencing key, so the
/// receiver handles them in the order they were sent.
fn seq_key(gvid: VertexId) -> u8 {
    (gvid % 254 + 1) as u8
}

#[derive(Debug, Default)]
struct Counters {
    collisions: AtomicU64,
    cancellations: AtomicU64,
    accepted_cancellations: AtomicU64,
}

/// Protocol counters for one machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Try-lock failures that forced a back-off.
    pub collisions: u64,
    pub cancellations: u64,
    pub accepted_cancellations: u64,
}

pub struct DistributedChandyMisra {
    rpc: Rpc,
    topology: Arc<dyn LocalTopology>,
    on_acquired: LockCallback,
    philosophers: Vec<Mutex<Philosopher>>,
    forks: Vec<Mutex<Fork>>,
    clean_forks: AtomicUsize,
    counters: Counters,
}

impl std::fmt::Debug for DistributedChandyMisra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedChandyMisra")
            .field("procid", &self.rpc.procid())
            .field("philosophers", &self.philosophers.len())
            .field("forks", &self.forks.len())
            .finish()
    }
}

impl DistributedChandyMisra {
    /// Build the fork table for this machine's partition, register the
    /// `locks` service and wait until every machine has done the same.
    ///
    /// Every fork starts dirty and owned by the endpoint with the larger
    /// global id, so all machines agree without exchanging anything.
    pub async fn new(
        rpc: Rpc,
        topology: Arc<dyn LocalTopology>,
        on_acquired: impl Fn(LocalVertexId) + Send + Sync + 'static,
    ) -> Result<Arc<Self>, RpcError> {
        let manager = Arc::new(Self::build(rpc.clone(), topology, Box::new(on_acquired)));
        rpc.register(SERVICE, &manager);
        rpc.barrier().await?;
        Ok(manager)
    }

    fn build(rpc: Rpc, topology: Arc<dyn LocalTopology>, on_acquired: LockCallback) -> Self {
        let nv = topology.num_local_vertices();
        let mut philosophers: Vec<Philosopher> = (0..nv)
            .map(|lvid| Philosopher::new(topology.num_local_incident(lvid)))
            .collect();
        let mut forks = vec![Fork::dirty_owned_by(Side::Source); topology.num_local_edges()];

        // Every local edge is some vertex's in-edge exactly once.
        for lvid in 0..nv {
            for edge in topology.in_edges(lvid) {
                let source_larger = topology.global_id(edge.source) > topology.global_id(edge.target);
                let (side, owner) = if source_larger {
                    (Side::Source, edge.source)
                } else {
                    (Side::Target, edge.target)
                };
                forks[edge.id] = Fork::dirty_owned_by(side);
                philosophers[owner].forks_acquired += 1;
            }
        }

        Self {
            rpc,
            topology,
            on_acquired,
            philosophers: philosophers.into_iter().map(Mutex::new).collect(),
            forks: forks.into_iter().map(Mutex::new).collect(),
            clean_forks: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    // ── Public operations ────────────────────────────────────────────

    /// Start a new lock episode for a vertex whose master lives here.
    /// The registered callback fires once every replica holds its forks.
    pub fn make_philosopher_hungry(&self, lvid: LocalVertexId) {
        if !self.topology.is_master(lvid) {
            warn!(procid = self.rpc.procid(), lvid, "make_philosopher_hungry called on a mirror");
            return;
        }
        let gvid = self.topology.global_id(lvid);
        let lock_id = {
            let mut p = self.philosophers[lvid].lock();
            p.lock_id = !p.lock_id;
            p.state = PhilosopherState::Hungry;
            p.counter = self.topology.mirrors(lvid).len() + 1;
            debug!(procid = self.rpc.procid(), gvid, counter = p.counter, "global hungry");
            p.lock_id
        };
        self.send_to_mirrors(lvid, LockMessage::MakeHungry { gvid, lock_id });
        self.grab_forks(lvid);
    }

    /// Release a vertex on the master and tell every mirror to release too.
    pub fn philosopher_stops_eating(&self, lvid: LocalVertexId) {
        let gvid = self.topology.global_id(lvid);
        debug!(procid = self.rpc.procid(), gvid, "global stop eating");
        self.philosophers[lvid].lock().counter = 0;
        self.send_to_mirrors(lvid, LockMessage::StopsEating { gvid });
        self.stops_eating_local(lvid);
    }

    /// Release only this machine's replica. Every replica must be released
    /// this way once, as the engine does after each replica's scatter.
    pub fn philosopher_stops_eating_per_replica(&self, lvid: LocalVertexId) {
        debug!(procid = self.rpc.procid(), gvid = self.topology.global_id(lvid), "replica stop eating");
        self.stops_eating_local(lvid);
    }

    pub fn philosopher_state(&self, lvid: LocalVertexId) -> PhilosopherState {
        self.philosophers[lvid].lock().state
    }

    pub fn forks_acquired(&self, lvid: LocalVertexId) -> usize {
        self.philosophers[lvid].lock().forks_acquired
    }

    pub fn num_clean_forks(&self) -> usize {
        self.clean_forks.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            collisions: self.counters.collisions.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            accepted_cancellations: self.counters.accepted_cancellations.load(Ordering::Relaxed),
        }
    }

    // ── Edge locking ─────────────────────────────────────────────────

    /// With `me` held, lock `other`. Going downward in id order first tries
    /// the lock and, if that fails, releases `me` and takes both ascending.
    fn lock_other<'a>(
        &'a self,
        me: &mut PhilosopherGuard<'a>,
        me_id: LocalVertexId,
        other: LocalVertexId,
    ) -> PhilosopherGuard<'a> {
        if me_id < other {
            return self.philosophers[other].lock();
        }
        if let Some(guard) = self.philosophers[other].try_lock() {
            return guard;
        }
        self.counters.collisions.fetch_add(1, Ordering::Relaxed);
        MutexGuard::unlocked(me, || self.philosophers[other].lock())
    }

    /// Visit every local edge of `lvid`, in-edges first, holding both
    /// endpoints. `visit` gets the edge, `lvid`'s side of it, `lvid`'s
    /// guard and the neighbour's guard; returning false stops the walk.
    fn for_each_incident<'a>(
        &'a self,
        lvid: LocalVertexId,
        me: &mut PhilosopherGuard<'a>,
        mut visit: impl FnMut(&LocalEdge, Side, &mut PhilosopherGuard<'a>, &mut PhilosopherGuard<'a>) -> bool,
    ) {
        let edges = self
            .topology
            .in_edges(lvid)
            .iter()
            .map(|e| (e, Side::Target))
            .chain(self.topology.out_edges(lvid).iter().map(|e| (e, Side::Source)));
        for (edge, side) in edges {
            let mut other = self.lock_other(me, lvid, edge.other(lvid));
            if !visit(edge, side, me, &mut other) {
                break;
            }
        }
    }

    // ── Fork transitions ─────────────────────────────────────────────

    /// Hand a requested dirty fork to the other side unless its holder is
    /// eating. A holder waiting in hors d'oeuvre is asked to cancel instead:
    /// both philosophers are released while the request goes out and
    /// re-taken in ascending order afterwards. The transfer condition is
    /// not re-checked after that; callers look at the fork again on their
    /// next pass. Returns whether the fork moved.
    fn advance_on_lock<'a>(
        &'a self,
        eid: EdgeId,
        source: LocalVertexId,
        target: LocalVertexId,
        src: &mut PhilosopherGuard<'a>,
        dst: &mut PhilosopherGuard<'a>,
    ) -> bool {
        let (holder_lvid, lock_id) = {
            let mut fork = self.forks[eid].lock();
            let owner = fork.owner;
            let (holder, taker): (&mut Philosopher, &mut Philosopher) = match owner {
                Side::Source => (&mut **src, &mut **dst),
                Side::Target => (&mut **dst, &mut **src),
            };
            if holder.state == PhilosopherState::Eating
                || !fork.dirty
                || !fork.requested_by(owner.other())
            {
                return false;
            }
            if holder.state != PhilosopherState::HorsDoeuvre {
                let holder_hungry = holder.state == PhilosopherState::Hungry;
                *fork = Fork::clean_owned_by(owner.other());
                if holder_hungry {
                    fork.request(owner);
                }
                holder.forks_acquired -= 1;
                taker.forks_acquired += 1;
                self.clean_forks.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            if holder.cancellation_sent {
                return false;
            }
            holder.cancellation_sent = true;
            let holder_lvid = match owner {
                Side::Source => source,
                Side::Target => target,
            };
            (holder_lvid, holder.lock_id)
        };

        self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
        let (low, high) = if source < target { (src, dst) } else { (dst, src) };
        MutexGuard::unlocked(high, || {
            MutexGuard::unlocked(low, || self.issue_cancellation_request(holder_lvid, lock_id))
        });
        false
    }

    /// Release path: a requested dirty fork goes to the other side.
    fn advance_on_unlock(&self, eid: EdgeId, src: &mut Philosopher, dst: &mut Philosopher) -> bool {
        let mut fork = self.forks[eid].lock();
        let owner = fork.owner;
        if !fork.dirty || !fork.requested_by(owner.other()) {
            return false;
        }
        *fork = Fork::clean_owned_by(owner.other());
        let (holder, taker) = match owner {
            Side::Source => (src, dst),
            Side::Target => (dst, src),
        };
        holder.forks_acquired -= 1;
        taker.forks_acquired += 1;
        self.clean_forks.fetch_add(1, Ordering::Relaxed);
        true
    }

    // ── Replica-local protocol steps ─────────────────────────────────

    fn grab_forks(&self, lvid: LocalVertexId) {
        let mut me = self.philosophers[lvid].lock();
        self.for_each_incident(lvid, &mut me, |edge, side, me, other| {
            if me.state != PhilosopherState::Hungry {
                return false;
            }
            let foreign = {
                let mut fork = self.forks[edge.id].lock();
                let foreign = fork.owner != side;
                if foreign {
                    fork.request(side);
                }
                foreign
            };
            if foreign {
                let (src, dst) = by_side(side, &mut *me, &mut *other);
                self.advance_on_lock(edge.id, edge.source, edge.target, src, dst);
            }
            true
        });
        let ready = me.try_enter_hors_doeuvre();
        drop(me);
        if ready {
            self.enter_hors_doeuvre(lvid);
        }
    }

    fn stops_eating_local(&self, lvid: LocalVertexId) {
        let mut me = self.philosophers[lvid].lock();
        if me.state != PhilosopherState::Eating {
            warn!(
                procid = self.rpc.procid(),
                gvid = self.topology.global_id(lvid),
                state = ?me.state,
                "stop eating on a philosopher that is not eating"
            );
        }
        let incident = self
            .topology
            .in_edges(lvid)
            .iter()
            .chain(self.topology.out_edges(lvid));
        for edge in incident {
            let mut fork = self.forks[edge.id].lock();
            if !fork.dirty {
                fork.dirty = true;
                self.clean_forks.fetch_sub(1, Ordering::Relaxed);
            }
        }
        me.state = PhilosopherState::Thinking;
        me.counter = 0;

        let mut ready = Vec::new();
        self.for_each_incident(lvid, &mut me, |edge, side, me, other| {
            if me.state != PhilosopherState::Thinking {
                return false;
            }
            let (src, dst) = by_side(side, &mut **me, &mut **other);
            self.advance_on_unlock(edge.id, src, dst);
            if other.try_enter_hors_doeuvre() {
                ready.push(edge.other(lvid));
            }
            true
        });
        drop(me);
        for neighbour in ready {
            self.enter_hors_doeuvre(neighbour);
        }
    }

    fn enter_hors_doeuvre(&self, lvid: LocalVertexId) {
        let gvid = self.topology.global_id(lvid);
        let lock_id = self.philosophers[lvid].lock().lock_id;
        debug!(procid = self.rpc.procid(), gvid, "local hors d'oeuvre");
        let owner = self.topology.owner(lvid);
        if owner == self.rpc.procid() {
            self.signal_ready(lvid, lock_id);
        } else {
            self.send(owner, LockMessage::SignalReady { gvid, lock_id });
        }
    }

    fn mirror_make_hungry(&self, lvid: LocalVertexId, lock_id: bool) {
        debug!(procid = self.rpc.procid(), gvid = self.topology.global_id(lvid), "local hungry");
        {
            let mut p = self.philosophers[lvid].lock();
            p.state = PhilosopherState::Hungry;
            p.lock_id = lock_id;
        }
        self.grab_forks(lvid);
    }

    fn issue_cancellation_request(&self, lvid: LocalVertexId, lock_id: bool) {
        let gvid = self.topology.global_id(lvid);
        let procid = self.rpc.procid();
        debug!(procid, gvid, lock_id, "requesting cancellation");
        let owner = self.topology.owner(lvid);
        if owner == procid {
            self.cancellation_request(lvid, procid, lock_id);
        } else {
            self.send(owner, LockMessage::CancellationRequest { gvid, requestor: procid, lock_id });
        }
    }

    // ── Master-side steps ────────────────────────────────────────────

    fn cancellation_request(&self, lvid: LocalVertexId, requestor: ProcId, lock_id: bool) {
        let gvid = self.topology.global_id(lvid);
        let procid = self.rpc.procid();
        {
            let mut p = self.philosophers[lvid].lock();
            if p.lock_id != lock_id {
                debug!(procid, gvid, lock_id, "cancellation denied: stale lock id");
                return;
            }
            if p.counter == 0 {
                debug!(procid, gvid, "cancellation denied: lock already complete");
                return;
            }
            p.counter += 1;
            debug!(procid, gvid, counter = p.counter, "cancellation accepted");
        }
        self.counters.accepted_cancellations.fetch_add(1, Ordering::Relaxed);
        if requestor == procid {
            self.cancellation_accept(lvid, lock_id);
        } else {
            self.send(requestor, LockMessage::CancellationAccept { gvid, lock_id });
        }
    }

    /// Back out of hors d'oeuvre: become hungry again, give away every
    /// requested dirty fork, and re-enter hors d'oeuvre if nothing left.
    fn cancellation_accept(&self, lvid: LocalVertexId, lock_id: bool) {
        let gvid = self.topology.global_id(lvid);
        let procid = self.rpc.procid();
        let mut me = self.philosophers[lvid].lock();
        if me.lock_id != lock_id {
            debug!(procid, gvid, lock_id, "cancellation accept dropped: stale lock id");
            return;
        }
        if me.state != PhilosopherState::HorsDoeuvre {
            warn!(procid, gvid, state = ?me.state, "cancellation accept outside hors d'oeuvre");
            return;
        }
        me.state = PhilosopherState::Hungry;
        me.cancellation_sent = false;
        debug!(procid, gvid, "cancellation accept received");

        let mut ready = Vec::new();
        self.for_each_incident(lvid, &mut me, |edge, side, me, other| {
            if me.state != PhilosopherState::Hungry {
                return false;
            }
            let owned_dirty = {
                let fork = self.forks[edge.id].lock();
                fork.owner == side && fork.dirty
            };
            if owned_dirty {
                let (src, dst) = by_side(side, &mut *me, &mut *other);
                let moved = self.advance_on_lock(edge.id, edge.source, edge.target, src, dst);
                if moved && other.try_enter_hors_doeuvre() {
                    ready.push(edge.other(lvid));
                }
            }
            true
        });
        if me.try_enter_hors_doeuvre() {
            ready.push(lvid);
        }
        drop(me);
        for v in ready {
            self.enter_hors_doeuvre(v);
        }
    }

    fn signal_ready(&self, lvid: LocalVertexId, lock_id: bool) {
        let gvid = self.topology.global_id(lvid);
        let procid = self.rpc.procid();
        let complete = {
            let mut p = self.philosophers[lvid].lock();
            if p.lock_id != lock_id {
                debug!(procid, gvid, lock_id, "signal ready dropped: stale lock id");
                return;
            }
            if !matches!(p.state, PhilosopherState::Hungry | PhilosopherState::HorsDoeuvre) {
                warn!(procid, gvid, state = ?p.state, "signal ready in unexpected state");
            }
            if p.counter == 0 {
                warn!(procid, gvid, "signal ready with no replica outstanding");
                return;
            }
            p.counter -= 1;
            debug!(procid, gvid, counter = p.counter, "global hors d'oeuvre");
            p.counter == 0
        };
        if complete {
            self.send_to_mirrors(lvid, LockMessage::SetEating { gvid, lock_id });
            self.set_eating(lvid, lock_id);
        }
    }

    fn set_eating(&self, lvid: LocalVertexId, lock_id: bool) {
        let gvid = self.topology.global_id(lvid);
        {
            let mut p = self.philosophers[lvid].lock();
            if p.lock_id != lock_id {
                debug!(procid = self.rpc.procid(), gvid, "set eating dropped: stale lock id");
                return;
            }
            p.state = PhilosopherState::Eating;
            p.cancellation_sent = false;
        }
        debug!(procid = self.rpc.procid(), gvid, "eating");
        if self.topology.is_master(lvid) {
            (self.on_acquired)(lvid);
        }
    }

    // ── Transport ────────────────────────────────────────────────────

    fn send(&self, target: ProcId, message: LockMessage) {
        let key = seq_key(message.gvid());
        let result = Message::new(message.topic(), &message)
            .map_err(RpcError::from)
            .and_then(|m| self.rpc.call_sequenced(target, key, m));
        if let Err(e) = result {
            warn!(procid = self.rpc.procid(), to = target, error = %e, "failed to send lock message");
        }
    }

    fn send_to_mirrors(&self, lvid: LocalVertexId, message: LockMessage) {
        let mirrors = self.topology.mirrors(lvid);
        if mirrors.is_empty() {
            return;
        }
        let key = seq_key(message.gvid());
        let result = Message::new(message.topic(), &message)
            .map_err(RpcError::from)
            .and_then(|m| self.rpc.broadcast(mirrors.iter().copied(), key, &m));
        if let Err(e) = result {
            warn!(procid = self.rpc.procid(), lvid, error = %e, "failed to broadcast lock message");
        }
    }
}

#[async_trait]
impl Service for DistributedChandyMisra {
    fn on_call(&self, _from: ProcId, message: Message) -> Result<(), RpcError> {
        let decoded: LockMessage = message.decode()?;
        let gvid = decoded.gvid();
        let Some(lvid) = self.topology.local_id(gvid) else {
            warn!(procid = self.rpc.procid(), gvid, topic = %message.topic, "lock message for unknown vertex");
            return Ok(());
        };
        match decoded {
            LockMessage::MakeHungry { lock_id, .. } => self.mirror_make_hungry(lvid, lock_id),
            LockMessage::CancellationRequest { requestor, lock_id, .. } => {
                self.cancellation_request(lvid, requestor, lock_id)
            }
            LockMessage::CancellationAccept { lock_id, .. } => self.cancellation_accept(lvid, lock_id),
            LockMessage::SignalReady { lock_id, .. } => self.signal_ready(lvid, lock_id),
            LockMessage::SetEating { lock_id, .. } => self.set_eating(lvid, lock_id),
            LockMessage::StopsEating { .. } => self.stops_eating_local(lvid),
        }
        Ok(())
    }
}
