use trellis_core::{EdgeId, TrellisError, VertexId};
use trellis_rpc::RpcError;

use crate::locks::PhilosopherState;

/// Error type for engine construction and collective operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Config error: {0}")]
    Config(#[from] TrellisError),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Unknown aggregator: {0}")]
    UnknownAggregator(String),
    #[error("Engine is running: {0}")]
    Running(&'static str),
}

/// A violated fork-table invariant, reported by the lock manager's
/// self-checks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LockInvariant {
    #[error("vertex {gvid}: forks_acquired is {recorded} but it owns {owned} forks")]
    ForkCount {
        gvid: VertexId,
        recorded: usize,
        owned: usize,
    },
    #[error("{owned} forks owned across philosophers, {edges} local edges")]
    ForkConservation { owned: usize, edges: usize },
    #[error("vertex {gvid} is thinking but holds a clean fork")]
    CleanForkWhileThinking { gvid: VertexId },
    #[error("vertex {gvid} is eating with {owned} of {edges} forks")]
    EatingWithoutForks {
        gvid: VertexId,
        owned: usize,
        edges: usize,
    },
    #[error("fork {eid} is clean")]
    CleanFork { eid: EdgeId },
    #[error("vertex {gvid} is {state:?}, expected thinking")]
    NotThinking {
        gvid: VertexId,
        state: PhilosopherState,
    },
}
