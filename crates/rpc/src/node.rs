//! The per-machine remote call handle and its dispatcher.
//!
//! - [`Rpc`] is the explicit context object every distributed component
//!   receives: machine id, cluster size, service registry, calls,
//!   requests, collectives and the call counters the termination protocol
//!   reads.
//! - The dispatcher drains the machine's inbox. Sequenced calls run inline
//!   in arrival order, unordered calls and requests on their own tasks.
//!   A collective frame first waits for every unordered call received
//!   before it, so a barrier also fences earlier calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, warn};
use trellis_core::ProcId;
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::message::Message;
use crate::metrics::{MetricsCollector, TopicMetrics};
use crate::traits::Service;
use crate::transport::{Envelope, Frame, Inbox, Outbox};

type PendingMap = tokio::sync::Mutex<HashMap<Uuid, oneshot::Sender<Result<Message, RpcError>>>>;

struct CollectiveSlot {
    parts: Vec<Option<Vec<u8>>>,
    arrived: usize,
    waiter: Option<oneshot::Sender<Vec<Vec<u8>>>>,
}

impl CollectiveSlot {
    fn new(n: usize) -> Self {
        Self {
            parts: vec![None; n],
            arrived: 0,
            waiter: None,
        }
    }

    fn take_parts(self) -> Vec<Vec<u8>> {
        self.parts.into_iter().map(Option::unwrap_or_default).collect()
    }
}

pub(crate) struct RpcInner {
    procid: ProcId,
    num_procs: usize,
    config: RpcConfig,
    outboxes: Vec<Outbox>,
    services: RwLock<HashMap<String, Weak<dyn Service>>>,
    pending: PendingMap,
    collectives: Mutex<HashMap<u64, CollectiveSlot>>,
    next_epoch: AtomicU64,
    fast_track: AtomicBool,
    calls_sent: AtomicU64,
    calls_received: AtomicU64,
    metrics: MetricsCollector,
}

/// Handle to one machine's remote call layer. Cheap to clone.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<RpcInner>,
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("procid", &self.inner.procid)
            .field("num_procs", &self.inner.num_procs)
            .finish()
    }
}

impl Rpc {
    /// Wire up one machine and spawn its dispatcher and flusher tasks.
    /// Must be called from within a tokio runtime.
    pub(crate) fn start(
        procid: ProcId,
        num_procs: usize,
        config: RpcConfig,
        outboxes: Vec<Outbox>,
        inbox: Inbox,
    ) -> Self {
        let flush_every = config.flush_interval();
        let inner = Arc::new(RpcInner {
            procid,
            num_procs,
            config,
            outboxes,
            services: RwLock::new(HashMap::new()),
            pending: tokio::sync::Mutex::new(HashMap::new()),
            collectives: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
            fast_track: AtomicBool::new(false),
            calls_sent: AtomicU64::new(0),
            calls_received: AtomicU64::new(0),
            metrics: MetricsCollector::new(),
        });
        tokio::spawn(run_dispatcher(Arc::downgrade(&inner), inbox));
        tokio::spawn(run_flusher(Arc::downgrade(&inner), flush_every));
        Self { inner }
    }

    pub fn procid(&self) -> ProcId {
        self.inner.procid
    }

    pub fn num_procs(&self) -> usize {
        self.inner.num_procs
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// All machine ids, in order.
    pub fn machines(&self) -> impl Iterator<Item = ProcId> {
        0..self.inner.num_procs as ProcId
    }

    // ── Registry ─────────────────────────────────────────────────────

    /// Route topics `name.*` to `service`. The registry keeps a weak
    /// reference; the caller owns the service. Re-registering a name
    /// replaces the previous service.
    pub fn register<S: Service + 'static>(&self, name: impl Into<String>, service: &Arc<S>) {
        let weak: Weak<dyn Service> = Arc::downgrade(service) as Weak<dyn Service>;
        let name = name.into();
        debug!(procid = self.inner.procid, service = %name, "registered service");
        self.inner.services.write().insert(name, weak);
    }

    pub fn unregister(&self, name: &str) {
        self.inner.services.write().remove(name);
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Fire-and-forget call. May be handled concurrently with other
    /// unordered calls on the receiver.
    pub fn call(&self, target: ProcId, message: Message) -> Result<(), RpcError> {
        self.call_sequenced(target, 0, message)
    }

    /// Fire-and-forget call. A non-zero `seq_key` makes the receiver handle
    /// it inline, after every earlier sequenced call from this machine.
    pub fn call_sequenced(&self, target: ProcId, seq_key: u8, message: Message) -> Result<(), RpcError> {
        self.inner.check_target(target)?;
        self.inner.calls_sent.fetch_add(1, Ordering::SeqCst);
        self.inner.push(
            target,
            Frame::Call { message, seq_key, counted: true },
            false,
        )
    }

    /// Send a copy of `message` to every target.
    pub fn broadcast(
        &self,
        targets: impl IntoIterator<Item = ProcId>,
        seq_key: u8,
        message: &Message,
    ) -> Result<(), RpcError> {
        for target in targets {
            self.call_sequenced(target, seq_key, message.clone())?;
        }
        Ok(())
    }

    /// Protocol-plumbing call: flushed immediately, handled inline, and
    /// not counted in [`calls_sent`](Self::calls_sent)/[`calls_received`](Self::calls_received).
    pub fn control_call(&self, target: ProcId, message: Message) -> Result<(), RpcError> {
        self.inner.check_target(target)?;
        self.inner.push(
            target,
            Frame::Call { message, seq_key: u8::MAX, counted: false },
            true,
        )
    }

    /// Send a request and await its reply.
    #[instrument(skip_all, fields(procid = self.inner.procid, to = target, topic = %message.topic))]
    pub async fn request(&self, target: ProcId, message: Message) -> Result<Message, RpcError> {
        self.inner.check_target(target)?;
        let cid = message.correlation_id;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(cid, tx);

        self.inner.calls_sent.fetch_add(1, Ordering::SeqCst);
        self.inner.push(target, Frame::Request { message }, true)?;
        debug!(correlation_id = %cid, "sent request");

        let timeout = self.inner.config.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Transport("reply channel closed".into())),
            Err(_) => {
                self.inner.pending.lock().await.remove(&cid);
                warn!(correlation_id = %cid, "request timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Push every buffered call out now.
    pub fn flush(&self) {
        self.inner.flush_all();
    }

    /// While on, every call is flushed as soon as it is made. Returns the
    /// previous setting.
    pub fn set_fast_track(&self, on: bool) -> bool {
        let previous = self.inner.fast_track.swap(on, Ordering::SeqCst);
        if on {
            self.inner.flush_all();
        }
        previous
    }

    pub fn fast_track(&self) -> bool {
        self.inner.fast_track.load(Ordering::SeqCst)
    }

    // ── Collectives ──────────────────────────────────────────────────

    /// Every machine contributes `payload`; returns all contributions
    /// indexed by machine id. All machines must call collectives in the
    /// same order.
    pub async fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, RpcError> {
        let inner = &self.inner;
        let epoch = inner.next_epoch.fetch_add(1, Ordering::SeqCst);
        for target in self.machines() {
            inner.push(
                target,
                Frame::Collective { epoch, payload: payload.clone() },
                true,
            )?;
        }

        let rx = {
            let mut slots = inner.collectives.lock();
            let complete = slots
                .get(&epoch)
                .is_some_and(|slot| slot.arrived == inner.num_procs);
            if complete {
                let slot = slots.remove(&epoch).map(CollectiveSlot::take_parts);
                return Ok(slot.unwrap_or_default());
            }
            let (tx, rx) = oneshot::channel();
            slots
                .entry(epoch)
                .or_insert_with(|| CollectiveSlot::new(inner.num_procs))
                .waiter = Some(tx);
            rx
        };

        rx.await
            .map_err(|_| RpcError::Transport(format!("collective {epoch} abandoned")))
    }

    /// Typed [`all_gather`](Self::all_gather).
    pub async fn all_gather_value<T: Serialize + DeserializeOwned>(
        &self,
        value: &T,
    ) -> Result<Vec<T>, RpcError> {
        let parts = self.all_gather(rmp_serde::to_vec(value)?).await?;
        parts
            .iter()
            .map(|bytes| rmp_serde::from_slice(bytes).map_err(RpcError::from))
            .collect()
    }

    pub async fn all_reduce_sum(&self, value: u64) -> Result<u64, RpcError> {
        Ok(self.all_gather_value(&value).await?.into_iter().sum())
    }

    /// Block until every machine reached the barrier and every call sent
    /// before it has been handled.
    pub async fn barrier(&self) -> Result<(), RpcError> {
        self.all_gather(Vec::new()).await.map(|_| ())
    }

    // ── Counters ─────────────────────────────────────────────────────

    /// Counted calls, requests and replies sent by this machine.
    pub fn calls_sent(&self) -> u64 {
        self.inner.calls_sent.load(Ordering::SeqCst)
    }

    /// Counted calls, requests and replies fully handled by this machine.
    pub fn calls_received(&self) -> u64 {
        self.inner.calls_received.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> HashMap<String, TopicMetrics> {
        self.inner.metrics.snapshot()
    }
}

impl RpcInner {
    fn check_target(&self, target: ProcId) -> Result<(), RpcError> {
        if (target as usize) < self.num_procs {
            Ok(())
        } else {
            Err(RpcError::UnknownMachine(target))
        }
    }

    fn push(&self, target: ProcId, frame: Frame, flush_now: bool) -> Result<(), RpcError> {
        let outbox = self
            .outboxes
            .get(target as usize)
            .ok_or(RpcError::UnknownMachine(target))?;
        let urgent = flush_now || self.fast_track.load(Ordering::Relaxed);
        outbox.push(
            Envelope { from: self.procid, frame },
            urgent,
            self.config.max_batch,
        );
        Ok(())
    }

    fn flush_all(&self) {
        for outbox in &self.outboxes {
            outbox.flush();
        }
    }

    fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.read().get(name).and_then(Weak::upgrade)
    }

    fn handle_call(&self, from: ProcId, message: Message, counted: bool) {
        match self.service(message.service()) {
            Some(service) => {
                let topic = message.topic.clone();
                if let Err(e) = service.on_call(from, message) {
                    warn!(procid = self.procid, from, topic = %topic, error = %e, "call handler failed");
                }
            }
            None => {
                warn!(procid = self.procid, from, topic = %message.topic, "no service for call, dropping");
            }
        }
        if counted {
            self.calls_received.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn handle_request(&self, from: ProcId, message: Message) {
        let cid = message.correlation_id;
        let topic = message.topic.clone();
        let result = match self.service(message.service()) {
            Some(service) => service.on_request(from, message).await,
            None => Err(RpcError::UnknownService(topic.clone())),
        };
        let result = result.map_err(|e| {
            warn!(procid = self.procid, from, topic = %topic, error = %e, "request handler failed");
            e.to_string()
        });

        self.calls_sent.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.push(from, Frame::Reply { correlation_id: cid, result }, true) {
            warn!(procid = self.procid, from, error = %e, "failed to send reply");
        }
        self.calls_received.fetch_add(1, Ordering::SeqCst);
    }

    async fn resolve_reply(&self, cid: Uuid, result: Result<Message, String>) {
        let waiter = self.pending.lock().await.remove(&cid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result.map_err(RpcError::Remote));
            }
            None => debug!(correlation_id = %cid, "received reply for unknown correlation_id"),
        }
        self.calls_received.fetch_add(1, Ordering::SeqCst);
    }

    fn record_collective(&self, from: ProcId, epoch: u64, payload: Vec<u8>) {
        let mut slots = self.collectives.lock();
        let slot = slots
            .entry(epoch)
            .or_insert_with(|| CollectiveSlot::new(self.num_procs));
        if slot.parts[from as usize].replace(payload).is_none() {
            slot.arrived += 1;
        }
        if slot.arrived == self.num_procs && slot.waiter.is_some() {
            if let Some(mut slot) = slots.remove(&epoch) {
                if let Some(tx) = slot.waiter.take() {
                    let _ = tx.send(slot.take_parts());
                }
            }
        }
    }
}

async fn run_dispatcher(weak: Weak<RpcInner>, mut inbox: Inbox) {
    let mut unordered: JoinSet<()> = JoinSet::new();
    while let Some(envelope) = inbox.recv().await {
        while unordered.try_join_next().is_some() {}
        let Some(inner) = weak.upgrade() else { break };
        inner.metrics.record(envelope.topic(), envelope.payload_len());

        let from = envelope.from;
        match envelope.frame {
            Frame::Call { message, seq_key: 0, counted } => {
                unordered.spawn(async move { inner.handle_call(from, message, counted) });
            }
            Frame::Call { message, counted, .. } => inner.handle_call(from, message, counted),
            Frame::Request { message } => {
                tokio::spawn(async move { inner.handle_request(from, message).await });
            }
            Frame::Reply { correlation_id, result } => {
                inner.resolve_reply(correlation_id, result).await
            }
            Frame::Collective { epoch, payload } => {
                while unordered.join_next().await.is_some() {}
                inner.record_collective(from, epoch, payload);
            }
        }
    }
    debug!("dispatcher stopped");
}

async fn run_flusher(weak: Weak<RpcInner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match weak.upgrade() {
            Some(inner) => inner.flush_all(),
            None => break,
        }
    }
}
