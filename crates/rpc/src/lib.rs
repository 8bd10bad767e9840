//! Remote call layer between the machines of a cluster.
//!
//! Provides fire-and-forget calls (ordered or unordered), requests with
//! replies, barriers and all-gather collectives, batching with a
//! fast-track switch, and the sent/received call counters the
//! distributed termination protocol relies on.

pub mod cluster;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod node;
pub mod traits;
pub(crate) mod transport;

pub use cluster::LocalCluster;
pub use config::RpcConfig;
pub use error::RpcError;
pub use message::Message;
pub use metrics::{MetricsCollector, TopicMetrics};
pub use node::Rpc;
pub use traits::Service;
