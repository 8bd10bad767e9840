//! In-process links between machines.
//!
//! Each machine owns one inbox. Every other machine (and the machine
//! itself) holds a sender to it plus a per-target outbox that batches
//! frames. Frames from one sender to one receiver arrive in the order
//! they were enqueued.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;
use trellis_core::ProcId;
use uuid::Uuid;

use crate::message::Message;

/// What travels over a link.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Fire-and-forget call. `seq_key == 0` may run concurrently with
    /// other unordered calls; any other key runs inline in arrival order.
    /// Uncounted calls are invisible to the termination protocol.
    Call {
        message: Message,
        seq_key: u8,
        counted: bool,
    },
    Request {
        message: Message,
    },
    Reply {
        correlation_id: Uuid,
        result: Result<Message, String>,
    },
    /// One machine's contribution to a collective (barrier or all-gather).
    Collective {
        epoch: u64,
        payload: Vec<u8>,
    },
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) from: ProcId,
    pub(crate) frame: Frame,
}

impl Envelope {
    pub(crate) fn topic(&self) -> &str {
        match &self.frame {
            Frame::Call { message, .. } | Frame::Request { message } => &message.topic,
            Frame::Reply { result: Ok(message), .. } => &message.topic,
            Frame::Reply { result: Err(_), .. } => "rpc.error",
            Frame::Collective { .. } => "rpc.collective",
        }
    }

    /// Size of the message payload, for per-topic accounting.
    pub(crate) fn payload_len(&self) -> usize {
        match &self.frame {
            Frame::Call { message, .. } | Frame::Request { message } => message.payload.len(),
            Frame::Reply { result: Ok(message), .. } => message.payload.len(),
            Frame::Reply { result: Err(_), .. } => 0,
            Frame::Collective { payload, .. } => payload.len(),
        }
    }
}

pub(crate) type Inbox = mpsc::UnboundedReceiver<Envelope>;
pub(crate) type Link = mpsc::UnboundedSender<Envelope>;

/// Buffered outbound frames for one target machine.
pub(crate) struct Outbox {
    target: ProcId,
    link: Link,
    pending: Mutex<Vec<Envelope>>,
}

impl Outbox {
    pub(crate) fn new(target: ProcId, link: Link) -> Self {
        Self {
            target,
            link,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Buffer a frame; push the whole buffer out if `flush_now` or the
    /// buffer reached `max_batch`.
    pub(crate) fn push(&self, envelope: Envelope, flush_now: bool, max_batch: usize) {
        let mut pending = self.pending.lock();
        pending.push(envelope);
        if flush_now || pending.len() >= max_batch {
            self.drain(&mut pending);
        }
    }

    pub(crate) fn flush(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            self.drain(&mut pending);
        }
    }

    // Sending under the buffer lock keeps per-target FIFO order.
    fn drain(&self, pending: &mut Vec<Envelope>) {
        for envelope in pending.drain(..) {
            if self.link.send(envelope).is_err() {
                warn!(to = self.target, "link closed, dropping frame");
            }
        }
    }
}

/// Create `n` linked inboxes: `links[i]` sends to `inboxes[i]`.
pub(crate) fn mesh(n: usize) -> (Vec<Link>, Vec<Inbox>) {
    (0..n).map(|_| mpsc::unbounded_channel()).unzip()
}
