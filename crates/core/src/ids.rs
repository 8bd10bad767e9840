use serde::{Deserialize, Serialize};

/// Global vertex id, identical on every machine.
pub type VertexId = u64;

/// Machine-local vertex id. Local ids are dense and ordered by global id.
pub type LocalVertexId = usize;

/// Machine-local edge id (index into the local edge table).
pub type EdgeId = usize;

/// Machine (process) id within a cluster.
pub type ProcId = u16;

/// Which incident edges a gather or scatter phase visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EdgeDirection {
    None,
    #[default]
    In,
    Out,
    All,
}

impl EdgeDirection {
    pub fn includes_in(self) -> bool {
        matches!(self, EdgeDirection::In | EdgeDirection::All)
    }

    pub fn includes_out(self) -> bool {
        matches!(self, EdgeDirection::Out | EdgeDirection::All)
    }
}

impl std::fmt::Display for EdgeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeDirection::None => write!(f, "none"),
            EdgeDirection::In => write!(f, "in"),
            EdgeDirection::Out => write!(f, "out"),
            EdgeDirection::All => write!(f, "all"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_membership() {
        assert!(EdgeDirection::All.includes_in());
        assert!(EdgeDirection::All.includes_out());
        assert!(EdgeDirection::In.includes_in());
        assert!(!EdgeDirection::In.includes_out());
        assert!(!EdgeDirection::None.includes_in());
        assert!(!EdgeDirection::None.includes_out());
    }
}
