use thiserror::Error;
use trellis_core::ProcId;

/// Errors that can occur in the remote call layer.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("no service registered for topic '{0}'")]
    UnknownService(String),

    #[error("unsupported method '{0}'")]
    Unsupported(String),

    #[error("machine {0} is not part of this cluster")]
    UnknownMachine(ProcId),

    #[error("remote handler failed: {0}")]
    Remote(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
