use std::ops::AddAssign;

use futures::future::join_all;
use tracing::warn;
use trellis_core::{EdgeDirection, LocalVertexId, ProcId, VertexId};
use trellis_graph::{LocalEdge, LocalTopology};
use trellis_rpc::Message;

use super::{EngineShared, TOPIC_GATHER, TOPIC_SCATTER};
use crate::error::EngineError;
use crate::program::{Context, EdgeMut, EdgeView, VertexProgram, VertexView};

fn fold<G: AddAssign>(acc: &mut Option<G>, value: G) {
    match acc {
        Some(total) => *total += value,
        None => *acc = Some(value),
    }
}

impl<P: VertexProgram> EngineShared<P> {
    fn edges_in(&self, lvid: LocalVertexId, dir: EdgeDirection) -> impl Iterator<Item = &LocalEdge> {
        let ins = if dir.includes_in() { self.graph.in_edges(lvid) } else { &[] };
        let outs = if dir.includes_out() { self.graph.out_edges(lvid) } else { &[] };
        ins.iter().chain(outs)
    }

    /// Gather over this machine's edges of `lvid`. `None` if no edge was
    /// visited.
    pub(crate) fn gather_local(&self, lvid: LocalVertexId, program: &P) -> Option<P::Gather> {
        if self.options.use_cache {
            if let Some(cached) = self.slots[lvid].lock().cache.clone() {
                return Some(cached);
            }
        }

        let ctx = Context::new(self);
        let record = self.graph.record(lvid);
        let dir = {
            let data = self.graph.vertex_data(lvid);
            program.gather_edges(&ctx, VertexView::new(record, &*data))
        };

        let mut acc = None;
        for edge in self.edges_in(lvid, dir) {
            let (source, target) = self.graph.lock_vertex_pair(edge.source, edge.target);
            let data = self.graph.edge_data(edge.id);
            let source = VertexView::new(self.graph.record(edge.source), &*source);
            let target = VertexView::new(self.graph.record(edge.target), &*target);
            let me = if edge.source == lvid { source } else { target };
            fold(&mut acc, program.gather(&ctx, me, EdgeView { source, target, data: &*data }));
        }

        if self.options.use_cache {
            if let Some(total) = &acc {
                self.slots[lvid].lock().cache = Some(total.clone());
            }
        }
        acc
    }

    /// Gather on every replica of `lvid` and sum the contributions.
    pub(crate) async fn gather_all(&self, lvid: LocalVertexId, program: &P) -> Option<P::Gather> {
        let record = self.graph.record(lvid);
        let remote = join_all(
            record
                .mirrors
                .iter()
                .map(|&mirror| self.remote_gather(mirror, record.gvid, program)),
        );
        let (remote, local) = tokio::join!(remote, async { self.gather_local(lvid, program) });

        let mut acc = local;
        for (mirror, part) in record.mirrors.iter().zip(remote) {
            match part {
                Ok(Some(value)) => fold(&mut acc, value),
                Ok(None) => {}
                Err(e) => warn!(procid = self.rpc.procid(), gvid = record.gvid, mirror, error = %e, "remote gather failed"),
            }
        }
        acc
    }

    async fn remote_gather(&self, mirror: ProcId, gvid: VertexId, program: &P) -> Result<Option<P::Gather>, EngineError> {
        let request = Message::new(TOPIC_GATHER, &(gvid, program))?;
        let reply = self.rpc.request(mirror, request).await?;
        Ok(reply.decode()?)
    }

    /// Scatter over this machine's edges of `lvid`, then release this
    /// replica's lock.
    pub(crate) fn scatter_local(&self, lvid: LocalVertexId, program: &P) {
        let ctx = Context::new(self);
        let record = self.graph.record(lvid);
        let dir = {
            let data = self.graph.vertex_data(lvid);
            program.scatter_edges(&ctx, VertexView::new(record, &*data))
        };

        for edge in self.edges_in(lvid, dir) {
            let (source, target) = self.graph.lock_vertex_pair(edge.source, edge.target);
            let mut data = self.graph.edge_data(edge.id);
            let source = VertexView::new(self.graph.record(edge.source), &*source);
            let target = VertexView::new(self.graph.record(edge.target), &*target);
            let me = if edge.source == lvid { source } else { target };
            program.scatter(&ctx, me, EdgeMut { source, target, data: &mut *data });
        }

        if let Some(locks) = self.lock_manager() {
            locks.philosopher_stops_eating_per_replica(lvid);
        }
    }

    /// Push `data` to every mirror, scatter everywhere and wait for all
    /// replicas to finish.
    pub(crate) async fn scatter_all(&self, lvid: LocalVertexId, program: &P, data: Option<P::VertexData>) {
        let record = self.graph.record(lvid);
        let remote = async {
            let Some(data) = data.as_ref() else { return Vec::new() };
            join_all(
                record
                    .mirrors
                    .iter()
                    .map(|&mirror| self.remote_scatter(mirror, record.gvid, program, data)),
            )
            .await
        };
        let (remote, ()) = tokio::join!(remote, async { self.scatter_local(lvid, program) });

        for (mirror, result) in record.mirrors.iter().zip(remote) {
            if let Err(e) = result {
                warn!(procid = self.rpc.procid(), gvid = record.gvid, mirror, error = %e, "remote scatter failed");
            }
        }
    }

    async fn remote_scatter(
        &self,
        mirror: ProcId,
        gvid: VertexId,
        program: &P,
        data: &P::VertexData,
    ) -> Result<(), EngineError> {
        let request = Message::new(TOPIC_SCATTER, &(gvid, program, data))?;
        self.rpc.request(mirror, request).await?;
        Ok(())
    }

    /// A mirror's share of a scatter: take the master's data, then scatter.
    pub(crate) fn mirror_scatter(&self, lvid: LocalVertexId, program: &P, data: P::VertexData) {
        *self.graph.vertex_data(lvid) = data;
        self.scatter_local(lvid, program);
    }
}
