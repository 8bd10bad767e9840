use trellis_graph::LocalTopology;

use super::fork::Side;
use super::{DistributedChandyMisra, PhilosopherState};
use crate::error::LockInvariant;

impl DistributedChandyMisra {
    /// Check the fork bookkeeping of this machine. Only meaningful while no
    /// lock traffic is in flight.
    pub fn verify_consistency(&self) -> Result<(), LockInvariant> {
        let topo = &self.topology;
        let mut total_owned = 0;
        for lvid in 0..topo.num_local_vertices() {
            let gvid = topo.global_id(lvid);
            let p = self.philosophers[lvid].lock();
            let incident = topo
                .in_edges(lvid)
                .iter()
                .map(|e| (e.id, Side::Target))
                .chain(topo.out_edges(lvid).iter().map(|e| (e.id, Side::Source)));

            let mut owned = 0;
            let mut owns_clean = false;
            for (eid, side) in incident {
                let fork = self.forks[eid].lock();
                if fork.owner == side {
                    owned += 1;
                    owns_clean |= !fork.dirty;
                }
            }

            if owned != p.forks_acquired {
                return Err(LockInvariant::ForkCount { gvid, recorded: p.forks_acquired, owned });
            }
            if p.state == PhilosopherState::Thinking && owns_clean {
                return Err(LockInvariant::CleanForkWhileThinking { gvid });
            }
            if p.state == PhilosopherState::Eating && owned != p.num_edges {
                return Err(LockInvariant::EatingWithoutForks { gvid, owned, edges: p.num_edges });
            }
            total_owned += owned;
        }

        let edges = topo.num_local_edges();
        if total_owned != edges {
            return Err(LockInvariant::ForkConservation { owned: total_owned, edges });
        }
        Ok(())
    }

    /// With no lock held anywhere, every fork is dirty and every replica is
    /// thinking.
    pub fn verify_quiescent(&self) -> Result<(), LockInvariant> {
        self.verify_consistency()?;
        for (eid, fork) in self.forks.iter().enumerate() {
            if !fork.lock().dirty {
                return Err(LockInvariant::CleanFork { eid });
            }
        }
        for (lvid, p) in self.philosophers.iter().enumerate() {
            let state = p.lock().state;
            if state != PhilosopherState::Thinking {
                return Err(LockInvariant::NotThinking {
                    gvid: self.topology.global_id(lvid),
                    state,
                });
            }
        }
        Ok(())
    }
}
