use trellis_core::ProcId;

use crate::config::RpcConfig;
use crate::node::Rpc;
use crate::transport::{mesh, Outbox};

/// A cluster of machines living in one process.
///
/// Machines share nothing but their links: each has its own inbox,
/// dispatcher, service registry and counters, and every payload crosses
/// the link as MessagePack bytes.
pub struct LocalCluster;

impl LocalCluster {
    /// Start `num_procs` fully connected machines and return their handles,
    /// indexed by machine id. Must be called from within a tokio runtime.
    pub fn spawn(num_procs: usize, config: RpcConfig) -> Vec<Rpc> {
        assert!(num_procs > 0, "a cluster needs at least one machine");
        let (links, inboxes) = mesh(num_procs);
        inboxes
            .into_iter()
            .enumerate()
            .map(|(procid, inbox)| {
                let outboxes = links
                    .iter()
                    .enumerate()
                    .map(|(target, link)| Outbox::new(target as ProcId, link.clone()))
                    .collect();
                Rpc::start(procid as ProcId, num_procs, config.clone(), outboxes, inbox)
            })
            .collect()
    }
}
