use std::sync::Arc;

use async_trait::async_trait;
use trellis_core::ProcId;

use crate::error::RpcError;
use crate::message::Message;

/// A named receiver of remote calls on one machine.
///
/// Calls are fire-and-forget. Sequenced calls run on the dispatcher in
/// arrival order, so `on_call` must not block on anything that needs the
/// dispatcher to make progress. Requests run on their own task and their
/// result travels back to the caller.
#[async_trait]
pub trait Service: Send + Sync {
    /// Handle a fire-and-forget call.
    fn on_call(&self, from: ProcId, message: Message) -> Result<(), RpcError>;

    /// Handle a request and produce the reply.
    async fn on_request(&self, from: ProcId, message: Message) -> Result<Message, RpcError> {
        let _ = from;
        Err(RpcError::Unsupported(message.topic))
    }
}

/// Blanket implementation so `Arc<dyn Service>` can be used directly.
#[async_trait]
impl<T: Service + ?Sized> Service for Arc<T> {
    fn on_call(&self, from: ProcId, message: Message) -> Result<(), RpcError> {
        (**self).on_call(from, message)
    }

    async fn on_request(&self, from: ProcId, message: Message) -> Result<Message, RpcError> {
        (**self).on_request(from, message).await
    }
}
