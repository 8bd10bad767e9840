use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use trellis_core::LocalVertexId;

use super::{Scheduler, QUEUES_PER_LANE};

/// Multi-queue FIFO. A vertex sits in at most one queue at a time; new
/// entries go to the shorter of two randomly picked queues.
pub struct FifoScheduler {
    lanes: usize,
    queues: Vec<Mutex<VecDeque<LocalVertexId>>>,
    scheduled: Vec<AtomicBool>,
    cursors: Vec<AtomicUsize>,
    queued: AtomicUsize,
}

impl FifoScheduler {
    pub fn new(lanes: usize) -> Self {
        let lanes = lanes.max(1);
        let nqueues = lanes * QUEUES_PER_LANE;
        Self {
            lanes,
            queues: (0..nqueues).map(|_| Mutex::new(VecDeque::new())).collect(),
            scheduled: Vec::new(),
            cursors: (0..lanes).map(|_| AtomicUsize::new(0)).collect(),
            queued: AtomicUsize::new(0),
        }
    }

    fn pick_queue(&self) -> usize {
        let n = self.queues.len();
        if n == 1 {
            return 0;
        }
        let r = rand::thread_rng().gen_range(0..n * n);
        let (a, b) = (r / n, r % n);
        let len_a = self.queues[a].lock().len();
        let len_b = self.queues[b].lock().len();
        if len_a < len_b { a } else { b }
    }
}

impl Scheduler for FifoScheduler {
    fn set_num_vertices(&mut self, n: usize) {
        self.clear();
        self.scheduled = (0..n).map(|_| AtomicBool::new(false)).collect();
    }

    fn schedule(&self, lvid: LocalVertexId, _priority: f64) {
        let Some(flag) = self.scheduled.get(lvid) else { return };
        if flag.swap(true, Ordering::AcqRel) {
            return;
        }
        let idx = self.pick_queue();
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.queues[idx].lock().push_back(lvid);
    }

    fn get_next(&self, lane: usize) -> Option<LocalVertexId> {
        let lane = lane % self.lanes;
        let n = self.queues.len();
        let cursor = &self.cursors[lane];
        let initial = cursor.load(Ordering::Relaxed) % QUEUES_PER_LANE + lane * QUEUES_PER_LANE;
        for i in 0..n {
            let idx = (initial + i) % n;
            if i < QUEUES_PER_LANE {
                cursor.fetch_add(1, Ordering::Relaxed);
            }
            let mut queue = self.queues[idx].lock();
            while let Some(lvid) = queue.pop_front() {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                if self.scheduled[lvid].swap(false, Ordering::AcqRel) {
                    return Some(lvid);
                }
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
            for lvid in queue.drain(..) {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                self.scheduled[lvid].store(false, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn fifo(lanes: usize, n: usize) -> FifoScheduler {
        let mut s = FifoScheduler::new(lanes);
        s.set_num_vertices(n);
        s
    }

    #[test]
    fn drains_every_scheduled_vertex() {
        let s = fifo(1, 10);
        for v in [3, 1, 2] {
            s.schedule(v, 1.0);
        }
        let mut seen = HashSet::new();
        while let Some(v) = s.get_next(0) {
            seen.insert(v);
        }
        assert_eq!(seen, HashSet::from([1, 2, 3]));
        assert!(s.is_empty());
    }

    #[test]
    fn duplicates_are_suppressed() {
        let s = fifo(2, 4);
        s.schedule(2, 1.0);
        s.schedule(2, 5.0);
        assert_eq!(s.get_next(1), Some(2));
        assert_eq!(s.get_next(0), None);

        s.schedule(2, 1.0);
        assert_eq!(s.get_next(0), Some(2));
    }

    #[test]
    fn out_of_range_ignored() {
        let s = fifo(1, 2);
        s.schedule(7, 1.0);
        assert!(s.is_empty());
    }

    #[test]
    fn any_lane_can_steal() {
        let s = fifo(4, 100);
        for v in 0..100 {
            s.schedule(v, 1.0);
        }
        let mut count = 0;
        while s.get_next(3).is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn clear_drops_everything() {
        let s = fifo(2, 8);
        for v in 0..8 {
            s.schedule(v, 1.0);
        }
        s.clear();
        assert!(s.is_empty());
        assert_eq!(s.get_next(0), None);
        s.schedule(5, 1.0);
        assert_eq!(s.get_next(0), Some(5));
    }
}
