//! Vertex schedulers.
//!
//! A scheduler only tracks *which* local vertices have work; the work
//! itself (the folded message) lives in the
//! [`MessageArray`](crate::messages::MessageArray). Workers pull from the
//! lane they are pinned to and steal from the others when it runs dry.

mod fifo;
mod priority;

pub use fifo::FifoScheduler;
pub use priority::PriorityScheduler;

use trellis_core::{EngineOptions, LocalVertexId, SchedulerKind};

/// Queues per lane.
const QUEUES_PER_LANE: usize = 3;

pub trait Scheduler: Send + Sync {
    /// Size the scheduler for `n` local vertices. Drops anything queued.
    fn set_num_vertices(&mut self, n: usize);

    /// Mark `lvid` as having work. Scheduling an already scheduled vertex
    /// does not queue it twice.
    fn schedule(&self, lvid: LocalVertexId, priority: f64);

    /// Next vertex for a worker on `lane`, or `None` if every queue is empty.
    fn get_next(&self, lane: usize) -> Option<LocalVertexId>;

    fn is_empty(&self) -> bool;

    /// Drop every queued vertex.
    fn clear(&self);
}

/// Build the scheduler selected by `options`.
pub fn from_options(options: &EngineOptions, num_vertices: usize, lanes: usize) -> Box<dyn Scheduler> {
    let mut scheduler: Box<dyn Scheduler> = match options.scheduler {
        SchedulerKind::Fifo => Box::new(FifoScheduler::new(lanes)),
        SchedulerKind::Priority => {
            let mut s = PriorityScheduler::new(lanes);
            if let Some(min) = options.min_priority {
                s = s.with_min_priority(min);
            }
            Box::new(s)
        }
    };
    scheduler.set_num_vertices(num_vertices);
    scheduler
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_picks_policy() {
        let options = EngineOptions {
            scheduler: SchedulerKind::Priority,
            min_priority: Some(0.5),
            ..Default::default()
        };
        let s = from_options(&options, 4, 2);
        s.schedule(0, 0.1);
        assert!(s.is_empty());
        s.schedule(1, 2.0);
        assert_eq!(s.get_next(0), Some(1));

        let s = from_options(&EngineOptions::default(), 4, 2);
        s.schedule(0, 0.1);
        assert_eq!(s.get_next(1), Some(0));
    }
}
