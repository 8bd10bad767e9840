//! Distributed quiescence detection.
//!
//! Every worker that runs out of work enters a short critical section,
//! re-checks its source of work and then goes to sleep. When all workers of
//! a machine sleep, the machine forwards a token around the ring carrying
//! the cumulative counted-call totals. A token that makes a full round with
//! no change and equal sent/received totals ends the computation on every
//! machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use trellis_core::ProcId;
use trellis_rpc::{Message, Rpc, RpcError, Service};

pub const SERVICE: &str = "consensus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Token {
    total_calls_sent: u64,
    total_calls_received: u64,
    last_change: ProcId,
}

impl Token {
    fn initial(num_procs: usize) -> Self {
        Self {
            total_calls_sent: 0,
            total_calls_received: 0,
            last_change: (num_procs - 1) as ProcId,
        }
    }
}

#[derive(Debug)]
struct State {
    numactive: usize,
    done: bool,
    sleeping: Vec<bool>,
    has_token: bool,
    token: Token,
    last_calls_sent: u64,
    last_calls_received: u64,
}

impl State {
    fn new(procid: ProcId, num_procs: usize, nworkers: usize) -> Self {
        Self {
            numactive: nworkers,
            done: false,
            sleeping: vec![false; nworkers],
            has_token: procid == 0,
            token: Token::initial(num_procs),
            last_calls_sent: 0,
            last_calls_received: 0,
        }
    }
}

pub struct AsyncConsensus {
    rpc: Rpc,
    nworkers: usize,
    state: Mutex<State>,
    wakers: Vec<Notify>,
    trying_to_sleep: AtomicUsize,
    sleepers: AtomicUsize,
}

impl std::fmt::Debug for AsyncConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConsensus")
            .field("procid", &self.rpc.procid())
            .field("nworkers", &self.nworkers)
            .finish()
    }
}

impl AsyncConsensus {
    /// Register a consensus for `nworkers` local workers. Every machine must
    /// create one before any of them starts a round.
    pub fn new(rpc: Rpc, nworkers: usize) -> Arc<Self> {
        let state = State::new(rpc.procid(), rpc.num_procs(), nworkers);
        let consensus = Arc::new(Self {
            nworkers,
            state: Mutex::new(state),
            wakers: (0..nworkers).map(|_| Notify::new()).collect(),
            trying_to_sleep: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            rpc: rpc.clone(),
        });
        rpc.register(SERVICE, &consensus);
        consensus
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    /// Back to the initial state. Only call while no worker is inside the
    /// protocol, and on every machine before the next round starts.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = State::new(self.rpc.procid(), self.rpc.num_procs(), self.nworkers);
        self.trying_to_sleep.store(0, Ordering::SeqCst);
        self.sleepers.store(0, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Enter the critical section. The caller re-checks for work while it
    /// holds the section, then either cancels it or ends it and waits.
    pub fn begin_done_critical_section(&self, worker: usize) -> CriticalSection<'_> {
        self.trying_to_sleep.fetch_add(1, Ordering::SeqCst);
        CriticalSection {
            consensus: self,
            worker,
            guard: self.state.lock(),
        }
    }

    /// Wake every sleeping worker. Called whenever new local work appears.
    pub fn cancel(&self) {
        if self.trying_to_sleep.load(Ordering::SeqCst) == 0 && self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut state = self.state.lock();
        let was_idle = state.numactive == 0;
        self.wake_all(&mut state);
        if was_idle && !state.done {
            debug!(procid = self.rpc.procid(), "waking");
        }
    }

    /// End the computation locally without a token round.
    pub fn force_done(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.wake_all(&mut state);
    }

    fn wake_all(&self, state: &mut State) {
        for (worker, sleeping) in state.sleeping.iter_mut().enumerate() {
            if *sleeping {
                *sleeping = false;
                state.numactive += 1;
                self.sleepers.fetch_sub(1, Ordering::SeqCst);
                self.wakers[worker].notify_one();
            }
        }
    }

    fn receive_token(&self, token: Token) {
        let mut state = self.state.lock();
        state.has_token = true;
        state.token = token;
        debug!(
            procid = self.rpc.procid(),
            sent = token.total_calls_sent,
            received = token.total_calls_received,
            "token received"
        );
        if state.numactive == 0 {
            self.pass_the_token(&mut state);
        }
    }

    fn pass_the_token(&self, state: &mut State) {
        let me = self.rpc.procid();
        let token = state.token;
        if token.last_change == me && token.total_calls_sent == token.total_calls_received {
            info!(
                procid = me,
                sent = token.total_calls_sent,
                received = token.total_calls_received,
                "termination token completed"
            );
            for target in self.rpc.machines().filter(|&p| p != me) {
                self.control(target, "consensus.done", &());
            }
            state.done = true;
            self.wake_all(state);
            return;
        }

        let sent = self.rpc.calls_sent();
        let received = self.rpc.calls_received();
        if sent != state.last_calls_sent || received != state.last_calls_received {
            state.token.total_calls_sent += sent - state.last_calls_sent;
            state.token.total_calls_received += received - state.last_calls_received;
            state.token.last_change = me;
        }
        state.last_calls_sent = sent;
        state.last_calls_received = received;
        state.has_token = false;

        let next = ((me as usize + 1) % self.rpc.num_procs()) as ProcId;
        debug!(
            procid = me,
            to = next,
            sent = state.token.total_calls_sent,
            received = state.token.total_calls_received,
            "passing token"
        );
        let token = state.token;
        self.control(next, "consensus.token", &token);
    }

    fn control<T: Serialize>(&self, target: ProcId, topic: &str, payload: &T) {
        let result = Message::new(topic, payload)
            .map_err(RpcError::from)
            .and_then(|m| self.rpc.control_call(target, m));
        if let Err(e) = result {
            warn!(procid = self.rpc.procid(), to = target, topic, error = %e, "consensus call failed");
        }
    }
}

/// Held while a worker re-checks for work before sleeping.
pub struct CriticalSection<'a> {
    consensus: &'a AsyncConsensus,
    worker: usize,
    guard: MutexGuard<'a, State>,
}

impl<'a> CriticalSection<'a> {
    /// Work turned up: leave without sleeping.
    pub fn cancel(self) {
        drop(self.guard);
        self.consensus.trying_to_sleep.fetch_sub(1, Ordering::SeqCst);
    }

    /// Go to sleep. The returned handle resolves once the worker is woken,
    /// telling it whether the computation is over.
    pub fn end(self) -> Pending<'a> {
        let CriticalSection { consensus, worker, mut guard } = self;
        if guard.done {
            drop(guard);
            consensus.trying_to_sleep.fetch_sub(1, Ordering::SeqCst);
            return Pending { consensus, worker, done: true };
        }

        // numactive only changes inside the section, so it counts the
        // workers that are not asleep.
        guard.numactive -= 1;
        if guard.numactive == 0 {
            debug!(procid = consensus.rpc.procid(), "termination possible");
            if guard.has_token {
                consensus.pass_the_token(&mut guard);
            }
        }
        let done = guard.done;
        if !done {
            guard.sleeping[worker] = true;
            consensus.sleepers.fetch_add(1, Ordering::SeqCst);
        }
        drop(guard);
        Pending { consensus, worker, done }
    }
}

/// A worker asleep in the consensus.
#[must_use = "a sleeping worker has to wait for its wake-up"]
pub struct Pending<'a> {
    consensus: &'a AsyncConsensus,
    worker: usize,
    done: bool,
}

impl Pending<'_> {
    /// Wait until woken. Returns true when the computation is over.
    pub async fn wait(self) -> bool {
        let consensus = self.consensus;
        if !self.done {
            loop {
                consensus.wakers[self.worker].notified().await;
                let state = consensus.state.lock();
                if !state.sleeping[self.worker] || state.done {
                    break;
                }
            }
        }
        consensus.trying_to_sleep.fetch_sub(1, Ordering::SeqCst);
        consensus.state.lock().done
    }
}

#[async_trait]
impl Service for AsyncConsensus {
    fn on_call(&self, _from: ProcId, message: Message) -> Result<(), RpcError> {
        match message.method() {
            "token" => self.receive_token(message.decode()?),
            "done" => self.force_done(),
            other => return Err(RpcError::Unsupported(format!("consensus.{other}"))),
        }
        Ok(())
    }
}
