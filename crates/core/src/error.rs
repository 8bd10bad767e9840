use thiserror::Error;

use crate::ids::VertexId;

#[derive(Error, Debug)]
pub enum TrellisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Unexpected engine option: {0}")]
    UnknownOption(String),

    #[error("Vertex not found: {0}")]
    VertexNotFound(VertexId),

    #[error("Malformed edge list at line {line}: {reason}")]
    EdgeList { line: usize, reason: String },

    #[error("{0}")]
    Other(String),
}
