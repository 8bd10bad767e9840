use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use trellis_core::ProcId;

use crate::engine::TerminationReason;
use crate::locks::LockStats;

/// What one machine saw of the last engine run. Counts other than
/// `local_tasks` are cluster-wide.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub procid: ProcId,
    pub reason: TerminationReason,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    /// Programs executed on this machine.
    pub local_tasks: u64,
    pub completed_tasks: u64,
    /// Messages stored, and how many of them were folded into a pending one.
    pub schedule_adds: u64,
    pub schedule_joins: u64,
    /// Only tracked when `track_task_time` is on.
    pub mean_task_time: Option<Duration>,
    /// Lock manager counters, when running with full consistency.
    pub locks: Option<LockStats>,
}

impl EngineMetrics {
    pub fn updates_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.completed_tasks as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }
}

/// Every run of one engine, summarised.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunHistory {
    pub runs: u64,
    pub total_updates: u64,
    /// Mean wall time of a run.
    pub mean_elapsed: Duration,
    pub last: Option<EngineMetrics>,
}

impl RunHistory {
    pub fn record(&mut self, metrics: EngineMetrics) {
        self.runs += 1;
        self.total_updates += metrics.completed_tasks;

        let elapsed = Duration::from_secs_f64(metrics.elapsed_seconds.max(0.0));
        // Incremental mean: new_avg = prev_avg + (elapsed - prev_avg) / runs
        self.mean_elapsed = if self.runs == 1 {
            elapsed
        } else {
            let prev = self.mean_elapsed.as_nanos() as f64;
            let cur = elapsed.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / self.runs as f64) as u64)
        };
        self.last = Some(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(elapsed_seconds: f64, completed_tasks: u64) -> EngineMetrics {
        EngineMetrics {
            procid: 0,
            reason: TerminationReason::TaskDepletion,
            started_at: Utc::now(),
            elapsed_seconds,
            local_tasks: completed_tasks,
            completed_tasks,
            schedule_adds: completed_tasks,
            schedule_joins: 0,
            mean_task_time: None,
            locks: None,
        }
    }

    #[test]
    fn throughput() {
        assert_eq!(run(2.0, 10).updates_per_second(), 5.0);
        assert_eq!(run(0.0, 10).updates_per_second(), 0.0);
    }

    #[test]
    fn history_averages_runs() {
        let mut h = RunHistory::default();
        h.record(run(0.1, 4));
        h.record(run(0.2, 6));

        assert_eq!(h.runs, 2);
        assert_eq!(h.total_updates, 10);
        let mean = h.mean_elapsed.as_millis();
        assert!((140..=160).contains(&mean), "expected ~150ms, got {}ms", mean);
        assert_eq!(h.last.map(|m| m.completed_tasks), Some(6));
    }

    #[test]
    fn serialises_to_json() {
        let json = serde_json::to_value(run(1.0, 3)).unwrap();
        assert_eq!(json["completed_tasks"], 3);
        assert_eq!(json["reason"], "TaskDepletion");
    }
}
