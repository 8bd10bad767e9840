//! Integration tests for the in-process cluster: ordering, requests,
//! collectives and the call counters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use trellis_core::ProcId;
use trellis_rpc::{LocalCluster, Message, Rpc, RpcConfig, RpcError, Service};

/// Records every call payload in arrival order.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<u32>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Service for Recorder {
    fn on_call(&self, _from: ProcId, message: Message) -> Result<(), RpcError> {
        let value: u32 = message.decode()?;
        self.seen.lock().unwrap().push(value);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_request(&self, from: ProcId, message: Message) -> Result<Message, RpcError> {
        let value: u32 = message.decode()?;
        Ok(message.reply(&(value * 2, from))?)
    }
}

async fn barrier_all(rpcs: &[Rpc]) {
    for result in join_all(rpcs.iter().map(|r| r.barrier())).await {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequenced_calls_arrive_in_order() {
    let rpcs = LocalCluster::spawn(2, RpcConfig::local());
    let recorder = Arc::new(Recorder::default());
    rpcs[1].register("rec", &recorder);

    for i in 0..200u32 {
        rpcs[0]
            .call_sequenced(1, 7, Message::new("rec.push", &i).unwrap())
            .unwrap();
    }
    barrier_all(&rpcs).await;

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen, (0..200).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_fences_unordered_calls() {
    let rpcs = LocalCluster::spawn(3, RpcConfig::local());
    let recorders: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
    for (rpc, rec) in rpcs.iter().zip(&recorders) {
        rpc.register("rec", rec);
    }

    for rpc in &rpcs {
        for target in rpc.machines() {
            for i in 0..25u32 {
                rpc.call(target, Message::new("rec.push", &i).unwrap()).unwrap();
            }
        }
    }
    barrier_all(&rpcs).await;

    for rec in &recorders {
        assert_eq!(rec.calls.load(Ordering::SeqCst), 75);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_reply_across_machines() {
    let rpcs = LocalCluster::spawn(2, RpcConfig::local());
    let recorder = Arc::new(Recorder::default());
    rpcs[1].register("rec", &recorder);

    let replies = join_all((0..20u32).map(|i| {
        let rpc = rpcs[0].clone();
        async move {
            let reply = rpc.request(1, Message::new("rec.double", &i).unwrap()).await.unwrap();
            reply.decode::<(u32, ProcId)>().unwrap()
        }
    }))
    .await;

    for (i, (doubled, from)) in replies.into_iter().enumerate() {
        assert_eq!(doubled, 2 * i as u32);
        assert_eq!(from, 0);
    }
}

#[tokio::test]
async fn request_to_unknown_service_fails() {
    let rpcs = LocalCluster::spawn(1, RpcConfig::local());
    let err = rpcs[0]
        .request(0, Message::new("nobody.home", &1u32).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
}

#[tokio::test]
async fn call_to_missing_machine_is_rejected() {
    let rpcs = LocalCluster::spawn(2, RpcConfig::local());
    let err = rpcs[0].call(5, Message::new("rec.push", &1u32).unwrap()).unwrap_err();
    assert!(matches!(err, RpcError::UnknownMachine(5)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_reduce_and_gather() {
    let rpcs = LocalCluster::spawn(4, RpcConfig::local());
    let sums = join_all(
        rpcs.iter()
            .map(|r| async move { r.all_reduce_sum(r.procid() as u64 + 1).await.unwrap() }),
    )
    .await;
    assert_eq!(sums, vec![10, 10, 10, 10]);

    let gathered = join_all(
        rpcs.iter()
            .map(|r| async move { r.all_gather_value(&(r.procid() * 10)).await.unwrap() }),
    )
    .await;
    for g in gathered {
        assert_eq!(g, vec![0, 10, 20, 30]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counters_balance_and_skip_control_calls() {
    let rpcs = LocalCluster::spawn(2, RpcConfig::local());
    let recorders: Vec<Arc<Recorder>> = (0..2).map(|_| Arc::new(Recorder::default())).collect();
    for (rpc, rec) in rpcs.iter().zip(&recorders) {
        rpc.register("rec", rec);
    }

    rpcs[0].call(1, Message::new("rec.push", &1u32).unwrap()).unwrap();
    rpcs[1].call(0, Message::new("rec.push", &2u32).unwrap()).unwrap();
    rpcs[0].request(1, Message::new("rec.double", &3u32).unwrap()).await.unwrap();
    rpcs[0].control_call(1, Message::new("rec.push", &4u32).unwrap()).unwrap();
    barrier_all(&rpcs).await;

    let sent: u64 = rpcs.iter().map(Rpc::calls_sent).sum();
    let received: u64 = rpcs.iter().map(Rpc::calls_received).sum();
    // two calls, one request, one reply
    assert_eq!(sent, 4);
    assert_eq!(received, 4);
    assert_eq!(recorders[1].calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fast_track_switch_reports_previous() {
    let rpcs = LocalCluster::spawn(1, RpcConfig::local());
    assert!(!rpcs[0].set_fast_track(true));
    assert!(rpcs[0].fast_track());
    assert!(rpcs[0].set_fast_track(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_service_is_not_called() {
    let rpcs = LocalCluster::spawn(1, RpcConfig::local());
    {
        let recorder = Arc::new(Recorder::default());
        rpcs[0].register("rec", &recorder);
    }
    rpcs[0].call(0, Message::new("rec.push", &1u32).unwrap()).unwrap();
    rpcs[0].barrier().await.unwrap();
    assert_eq!(rpcs[0].calls_received(), 1);
    assert_eq!(rpcs[0].metrics()["rec.push"].total_messages, 1);
}
