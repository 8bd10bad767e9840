//! Distributed asynchronous vertex-program engine.
//!
//! Every machine of a cluster holds one partition of the graph and runs an
//! [`AsyncEngine`] over it. Vertices run gather, apply and scatter when
//! signalled; adjacent vertices are kept apart either per edge or, with
//! full consistency, by the [`DistributedChandyMisra`] lock manager. A run
//! ends when the whole cluster is out of work, on timeout, or when a
//! program stops it.

pub mod aggregation;
pub mod algorithms;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod locks;
pub mod messages;
pub mod metrics;
pub mod program;
pub mod scheduler;

pub use aggregation::Aggregator;
pub use consensus::AsyncConsensus;
pub use engine::{AsyncEngine, SignalOrder, TerminationReason};
pub use error::{EngineError, LockInvariant};
pub use locks::{DistributedChandyMisra, LockStats, PhilosopherState};
pub use messages::{Combine, MessageArray};
pub use metrics::{EngineMetrics, RunHistory};
pub use program::{Context, EdgeMut, EdgeView, NoGather, VertexMut, VertexProgram, VertexView};
pub use scheduler::{FifoScheduler, PriorityScheduler, Scheduler};
