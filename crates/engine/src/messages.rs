//! Pending-message store: at most one folded message per local vertex.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use trellis_core::LocalVertexId;

/// How two messages addressed to the same vertex are folded together.
///
/// `combine` must be commutative and associative: messages from different
/// machines arrive in no particular order.
pub trait Combine {
    fn combine(&mut self, other: Self);

    /// Scheduling priority of a (possibly folded) message.
    fn priority(&self) -> f64 {
        1.0
    }
}

impl Combine for () {
    fn combine(&mut self, _other: Self) {}
}

/// One slot per local vertex.
pub struct MessageArray<M> {
    slots: Vec<Mutex<Option<M>>>,
    adds: AtomicU64,
    joins: AtomicU64,
}

impl<M: Combine + Clone> MessageArray<M> {
    pub fn new(num_vertices: usize) -> Self {
        Self {
            slots: (0..num_vertices).map(|_| Mutex::new(None)).collect(),
            adds: AtomicU64::new(0),
            joins: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store or fold `message`. Returns whether the slot was empty and the
    /// priority of the message now held.
    pub fn add(&self, lvid: LocalVertexId, message: M) -> (bool, f64) {
        let mut slot = self.slots[lvid].lock();
        self.adds.fetch_add(1, Ordering::Relaxed);
        match slot.as_mut() {
            Some(pending) => {
                pending.combine(message);
                self.joins.fetch_add(1, Ordering::Relaxed);
                (false, pending.priority())
            }
            None => {
                let priority = message.priority();
                *slot = Some(message);
                (true, priority)
            }
        }
    }

    /// Take the pending message, leaving the slot empty.
    pub fn get(&self, lvid: LocalVertexId) -> Option<M> {
        self.slots[lvid].lock().take()
    }

    pub fn peek(&self, lvid: LocalVertexId) -> Option<M> {
        self.slots[lvid].lock().clone()
    }

    pub fn clear(&self, lvid: LocalVertexId) {
        self.slots[lvid].lock().take();
    }

    pub fn clear_all(&self) {
        for slot in &self.slots {
            slot.lock().take();
        }
    }

    pub fn has_message(&self, lvid: LocalVertexId) -> bool {
        self.slots[lvid].lock().is_some()
    }

    /// True when no vertex has a pending message.
    pub fn all_empty(&self) -> bool {
        self.slots.iter().all(|s| s.lock().is_none())
    }

    pub fn num_adds(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }

    /// Adds that folded into an already pending message.
    pub fn num_joins(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }
}
