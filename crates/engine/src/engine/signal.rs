use std::sync::atomic::Ordering;

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, warn};
use trellis_core::{LocalVertexId, ProcId, VertexId};
use trellis_graph::LocalTopology;
use trellis_rpc::{Message, RpcError};

use super::{EngineShared, SignalOrder, TerminationReason, RESCHEDULE_PRIORITY, TOPIC_SIGNAL, TOPIC_STOP};
use crate::program::VertexProgram;

impl<P: VertexProgram> EngineShared<P> {
    /// Store the message and schedule the vertex on this machine.
    pub(crate) fn internal_signal(&self, lvid: LocalVertexId, message: P::Message) {
        if self.force_stop.load(Ordering::SeqCst) {
            return;
        }
        let (_, priority) = self.messages.add(lvid, message);
        self.scheduler.schedule(lvid, priority);
        self.consensus.cancel();
    }

    /// Signal from inside a vertex program. In endgame a message for a vertex
    /// mastered elsewhere goes straight to its master.
    pub(crate) fn context_signal(&self, gvid: VertexId, message: P::Message) {
        if self.force_stop.load(Ordering::SeqCst) {
            return;
        }
        match self.graph.local_id(gvid) {
            Some(lvid) => {
                let owner = self.graph.owner(lvid);
                if self.started.load(Ordering::SeqCst)
                    && self.endgame.load(Ordering::SeqCst)
                    && owner != self.rpc.procid()
                {
                    self.forward_signal(owner, gvid, message);
                } else {
                    self.internal_signal(lvid, message);
                }
            }
            None => self.forward_signal(self.graph.master_of(gvid), gvid, message),
        }
    }

    /// Deliver at the master of `gvid`, wherever that is.
    pub(crate) fn signal_gvid(&self, gvid: VertexId, message: P::Message) {
        let master = self.graph.master_of(gvid);
        if master != self.rpc.procid() {
            self.forward_signal(master, gvid, message);
            return;
        }
        match self.graph.local_id(gvid) {
            Some(lvid) => self.internal_signal(lvid, message),
            None => warn!(procid = self.rpc.procid(), gvid, "signal for a vertex that is not in the graph"),
        }
    }

    pub(crate) fn signal_owned(&self, message: P::Message, order: SignalOrder) {
        let mut owned: Vec<LocalVertexId> = self.graph.owned_vertices().collect();
        if order == SignalOrder::Shuffle {
            owned.shuffle(&mut rand::thread_rng());
        }
        for lvid in owned {
            self.internal_signal(lvid, message.clone());
        }
    }

    pub(crate) fn forward_signal(&self, owner: ProcId, gvid: VertexId, message: P::Message) {
        self.send(owner, TOPIC_SIGNAL, &(gvid, message));
    }

    /// A forwarded signal arrived.
    pub(crate) fn rpc_signal(&self, gvid: VertexId, message: P::Message) {
        if self.force_stop.load(Ordering::SeqCst) {
            return;
        }
        match self.graph.local_id(gvid) {
            Some(lvid) => self.internal_signal(lvid, message),
            None => warn!(procid = self.rpc.procid(), gvid, "forwarded signal for an unknown vertex"),
        }
    }

    /// Take exclusive ownership of a vertex execution. If another worker runs
    /// it, park the message and ask for a rerun.
    pub(crate) fn claim(&self, lvid: LocalVertexId, message: P::Message) -> Option<P::Message> {
        let mut slot = self.slots[lvid].lock();
        if slot.running {
            self.messages.add(lvid, message);
            slot.has_next = true;
            return None;
        }
        slot.running = true;
        Some(message)
    }

    pub(crate) fn release(&self, lvid: LocalVertexId) {
        let rescheduled = {
            let mut slot = self.slots[lvid].lock();
            slot.running = false;
            std::mem::take(&mut slot.has_next)
        };
        if rescheduled {
            self.scheduler.schedule(lvid, RESCHEDULE_PRIORITY);
            self.consensus.cancel();
        }
    }

    pub(crate) fn post_delta(&self, gvid: VertexId, delta: P::Gather) {
        if !self.options.use_cache {
            return;
        }
        if let Some(lvid) = self.graph.local_id(gvid) {
            if let Some(cache) = self.slots[lvid].lock().cache.as_mut() {
                *cache += delta;
            }
        }
    }

    pub(crate) fn clear_gather_cache(&self, gvid: VertexId) {
        if !self.options.use_cache {
            return;
        }
        if let Some(lvid) = self.graph.local_id(gvid) {
            self.slots[lvid].lock().cache = None;
        }
    }

    /// Tell every machine, this one included, to stop.
    pub(crate) fn request_stop(&self) {
        debug!(procid = self.rpc.procid(), "stop requested");
        for target in self.rpc.machines() {
            self.send(target, TOPIC_STOP, &());
        }
    }

    pub(crate) fn on_stop(&self) {
        self.set_reason(TerminationReason::ForcedAbort);
        self.force_stop.store(true, Ordering::SeqCst);
        self.consensus.cancel();
    }

    pub(crate) fn send<T: Serialize>(&self, target: ProcId, topic: &str, payload: &T) {
        let result = Message::new(topic, payload)
            .map_err(RpcError::from)
            .and_then(|m| self.rpc.call(target, m));
        if let Err(e) = result {
            warn!(procid = self.rpc.procid(), to = target, topic, error = %e, "engine call failed");
        }
    }
}
