use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use trellis_core::LocalVertexId;

use super::{Scheduler, QUEUES_PER_LANE};

#[derive(Debug, Clone, Copy)]
struct Entry {
    priority: f64,
    lvid: LocalVertexId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap on priority; lower local id first among equals.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.lvid.cmp(&self.lvid))
    }
}

/// Heap with lazy deletion: `current` holds the live priority of every
/// queued vertex, stale heap entries are skipped on pop.
#[derive(Default)]
struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    current: HashMap<LocalVertexId, f64>,
}

impl PriorityQueue {
    /// Returns true if the vertex was not queued before.
    fn push_or_raise(&mut self, lvid: LocalVertexId, priority: f64) -> bool {
        match self.current.get(&lvid) {
            Some(&old) if old >= priority => false,
            Some(_) => {
                self.current.insert(lvid, priority);
                self.heap.push(Entry { priority, lvid });
                false
            }
            None => {
                self.current.insert(lvid, priority);
                self.heap.push(Entry { priority, lvid });
                true
            }
        }
    }

    fn pop(&mut self) -> Option<LocalVertexId> {
        while let Some(entry) = self.heap.pop() {
            if self.current.get(&entry.lvid) == Some(&entry.priority) {
                self.current.remove(&entry.lvid);
                return Some(entry.lvid);
            }
        }
        None
    }

    fn peek_priority(&mut self) -> Option<f64> {
        while let Some(entry) = self.heap.peek() {
            if self.current.get(&entry.lvid) == Some(&entry.priority) {
                return Some(entry.priority);
            }
            self.heap.pop();
        }
        None
    }
}

/// Highest priority first within each queue. A vertex always lands in
/// the same queue, so re-scheduling raises its priority in place.
pub struct PriorityScheduler {
    lanes: usize,
    num_vertices: usize,
    min_priority: f64,
    queues: Vec<Mutex<PriorityQueue>>,
    queued: AtomicUsize,
}

impl PriorityScheduler {
    pub fn new(lanes: usize) -> Self {
        let lanes = lanes.max(1);
        Self {
            lanes,
            num_vertices: 0,
            min_priority: f64::NEG_INFINITY,
            queues: (0..lanes * QUEUES_PER_LANE)
                .map(|_| Mutex::new(PriorityQueue::default()))
                .collect(),
            queued: AtomicUsize::new(0),
        }
    }

    /// Ignore schedule requests whose priority is below `min`.
    pub fn with_min_priority(mut self, min: f64) -> Self {
        self.min_priority = min;
        self
    }

    fn queue_of(&self, lvid: LocalVertexId) -> usize {
        lvid % self.queues.len()
    }
}

impl Scheduler for PriorityScheduler {
    fn set_num_vertices(&mut self, n: usize) {
        self.clear();
        self.num_vertices = n;
    }

    fn schedule(&self, lvid: LocalVertexId, priority: f64) {
        if lvid >= self.num_vertices || priority < self.min_priority {
            return;
        }
        let mut queue = self.queues[self.queue_of(lvid)].lock();
        if queue.push_or_raise(lvid, priority) {
            self.queued.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Takes the best head among this lane's queues, then falls back to
    /// scanning every queue.
    fn get_next(&self, lane: usize) -> Option<LocalVertexId> {
        let lane = lane % self.lanes;
        let own = lane * QUEUES_PER_LANE..(lane + 1) * QUEUES_PER_LANE;

        let best = own
            .clone()
            .filter_map(|idx| self.queues[idx].lock().peek_priority().map(|p| (idx, p)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(idx, _)| idx);

        let candidates = best.into_iter().chain(own).chain(0..self.queues.len());
        for idx in candidates {
            if let Some(lvid) = self.queues[idx].lock().pop() {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                return Some(lvid);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.queued.load(Ordering::Acquire) == 0
    }

    fn clear(&self) {
        for queue in &self.queues {
            let mut queue = queue.lock();
            let removed = queue.current.len();
            queue.heap.clear();
            queue.current.clear();
            self.queued.fetch_sub(removed, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prio(lanes: usize, n: usize) -> PriorityScheduler {
        let mut s = PriorityScheduler::new(lanes);
        s.set_num_vertices(n);
        s
    }

    #[test]
    fn highest_priority_first_in_one_queue() {
        let s = prio(1, 30);
        // 0, 3, 6 share queue 0 of 3.
        s.schedule(0, 1.0);
        s.schedule(3, 5.0);
        s.schedule(6, 2.0);
        let order: Vec<_> = std::iter::from_fn(|| s.get_next(0)).collect();
        assert_eq!(order, vec![3, 6, 0]);
        assert!(s.is_empty());
    }

    #[test]
    fn reschedule_raises_but_never_lowers() {
        let s = prio(1, 30);
        s.schedule(0, 1.0);
        s.schedule(3, 2.0);
        s.schedule(0, 10.0);
        s.schedule(3, 0.5);
        assert_eq!(s.get_next(0), Some(0));
        assert_eq!(s.get_next(0), Some(3));
        assert_eq!(s.get_next(0), None);
    }

    #[test]
    fn best_head_across_own_queues() {
        let s = prio(1, 30);
        s.schedule(1, 1.0);
        s.schedule(2, 9.0);
        assert_eq!(s.get_next(0), Some(2));
    }

    #[test]
    fn min_priority_filters() {
        let mut s = PriorityScheduler::new(2).with_min_priority(1.0);
        s.set_num_vertices(10);
        s.schedule(4, 0.5);
        assert!(s.is_empty());
        s.schedule(4, 1.0);
        assert_eq!(s.get_next(1), Some(4));
    }

    #[test]
    fn clear_resets_count() {
        let s = prio(2, 10);
        for v in 0..10 {
            s.schedule(v, v as f64);
        }
        s.clear();
        assert!(s.is_empty());
        assert_eq!(s.get_next(0), None);
    }
}
