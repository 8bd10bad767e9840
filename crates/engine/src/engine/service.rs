use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tracing::debug;
use trellis_core::{ProcId, VertexId};
use trellis_graph::LocalTopology;
use trellis_rpc::{Message, RpcError, Service};

use super::EngineShared;
use crate::aggregation::{RoundPartial, RoundStart};
use crate::program::VertexProgram;

#[async_trait]
impl<P: VertexProgram> Service for EngineShared<P> {
    fn on_call(&self, from: ProcId, message: Message) -> Result<(), RpcError> {
        match message.method() {
            "signal" => {
                let (gvid, payload): (VertexId, P::Message) = message.decode()?;
                self.rpc_signal(gvid, payload);
            }
            "endgame" => {
                if !self.endgame.swap(true, Ordering::SeqCst) {
                    debug!(procid = self.rpc.procid(), from, "endgame announced");
                    self.rpc.set_fast_track(true);
                }
            }
            "stop" => self.on_stop(),
            "aggregate_start" => {
                let start: RoundStart = message.decode()?;
                self.aggregator.begin_round(start.key, start.round);
                self.consensus.cancel();
            }
            "aggregate_partial" => {
                let partial: RoundPartial = message.decode()?;
                self.aggregator.receive_partial(from, partial);
            }
            other => return Err(RpcError::Unsupported(format!("engine.{other}"))),
        }
        Ok(())
    }

    async fn on_request(&self, from: ProcId, message: Message) -> Result<Message, RpcError> {
        match message.method() {
            "gather" => {
                let (gvid, program): (VertexId, P) = message.decode()?;
                let lvid = self.graph.local_id(gvid).ok_or_else(|| unknown_vertex(from, gvid))?;
                let partial = self.gather_local(lvid, &program);
                Ok(message.reply(&partial)?)
            }
            "scatter" => {
                let (gvid, program, data): (VertexId, P, P::VertexData) = message.decode()?;
                let lvid = self.graph.local_id(gvid).ok_or_else(|| unknown_vertex(from, gvid))?;
                self.mirror_scatter(lvid, &program, data);
                Ok(message.reply(&())?)
            }
            other => Err(RpcError::Unsupported(format!("engine.{other}"))),
        }
    }
}

fn unknown_vertex(from: ProcId, gvid: VertexId) -> RpcError {
    RpcError::Remote(format!("machine {from} asked about vertex {gvid}, which has no replica here"))
}
