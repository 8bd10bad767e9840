//! Asynchronous gather-apply-scatter engine.
//!
//! Split into focused submodules:
//! - `core`: shared state, construction and the public [`AsyncEngine`] handle
//! - `execution`: worker loop, task evaluation and termination
//! - `gas`: local and remote gather and scatter
//! - `signal`: message injection and vertex claiming
//! - `service`: remote calls between engine instances

mod core;
mod execution;
mod gas;
mod service;
mod signal;

use serde::{Deserialize, Serialize};

pub use self::core::AsyncEngine;
pub(crate) use self::core::EngineShared;

const SERVICE: &str = "engine";
const TOPIC_SIGNAL: &str = "engine.signal";
const TOPIC_ENDGAME: &str = "engine.endgame";
const TOPIC_STOP: &str = "engine.stop";
const TOPIC_GATHER: &str = "engine.gather";
const TOPIC_SCATTER: &str = "engine.scatter";

/// Priority given to a vertex that was signalled while it ran.
const RESCHEDULE_PRIORITY: f64 = 10_000.0;

/// Why [`AsyncEngine::start`] returned. Ordered by precedence when
/// machines disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Every machine ran out of work.
    TaskDepletion,
    Timeout,
    /// A vertex program called [`Context::stop`](crate::program::Context::stop).
    ForcedAbort,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::TaskDepletion => write!(f, "task depletion"),
            TerminationReason::Timeout => write!(f, "timeout"),
            TerminationReason::ForcedAbort => write!(f, "forced abort"),
        }
    }
}

/// Order in which [`AsyncEngine::signal_all`] schedules vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalOrder {
    #[default]
    Shuffle,
    Sequential,
}
