//! Broker behaviour across aggregates, federation and subscriber failure.
//!
//! Federation tests run real brokers on ephemeral ports that find each
//! other through an in-process name service.

use async_trait::async_trait;
use remora_core::Value;
use remora_pubsub::{
    PubSub, PubSubConfig, PubSubError, PubSubResult, QueueSubscriber, SubscribeOptions,
    Subscriber,
};
use remora_rpc::{NameDirectory, NameService, ServerConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

fn chans(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn broker(name: &str) -> Arc<PubSub> {
    Arc::new(PubSub::new(name, PubSubConfig::default()))
}

async fn federated(name: &str, names: &Arc<NameService>) -> Arc<PubSub> {
    let directory: Arc<dyn NameDirectory> = names.clone();
    let config = PubSubConfig {
        update_interval: Duration::from_millis(200),
        remote_timeout: Duration::from_secs(2),
        ..PubSubConfig::default()
    };
    let broker = Arc::new(PubSub::new(name, config).with_directory(directory));
    broker
        .start_server(ServerConfig::new(name, "127.0.0.1", 0))
        .await
        .unwrap();
    broker
}

async fn dead_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

fn short_failure_limit() -> Arc<PubSub> {
    Arc::new(PubSub::new(
        "pubsub",
        PubSubConfig {
            failure_limit: Duration::from_millis(200),
            ..PubSubConfig::default()
        },
    ))
}

/// Subscriber whose deliveries fail while `healthy` is false.
struct Flaky {
    healthy: AtomicBool,
    delivered: AtomicUsize,
}

impl Flaky {
    fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            delivered: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Subscriber for Flaky {
    async fn remote_update(
        &self,
        _value: Value,
        _names: Vec<String>,
        _channels: Vec<String>,
    ) -> PubSubResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(PubSubError::Closed("flaky".to_string()))
        }
    }
}

#[tokio::test]
async fn test_aggregate_fan_out() {
    let ps = broker("pubsub");
    ps.add_channels(&chans(&["X", "Y"])).await;
    ps.aggregate("ALL", &chans(&["X", "Y"])).await;

    let (s1, mut rx1) = QueueSubscriber::channel("S1");
    let (s2, mut rx2) = QueueSubscriber::channel("S2");
    ps.subscribe_local("S1", Arc::new(s1), &chans(&["X"])).await;
    ps.subscribe_local("S2", Arc::new(s2), &chans(&["ALL"])).await;

    let (ids, memberships) = ps.get_subscribers(&chans(&["Y"])).await;
    assert_eq!(ids, vec!["S2"]);
    assert_eq!(memberships, vec!["ALL", "Y"]);

    assert_eq!(ps.notify(Value::from("v"), &chans(&["Y"])).await, 1);
    ps.wait_idle().await;
    let update = rx2.recv().await.unwrap();
    assert_eq!(update.channels, vec!["ALL", "Y"]);
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn test_cyclic_aggregates_terminate() {
    let ps = broker("pubsub");
    ps.aggregate("A", &chans(&["B"])).await;
    ps.aggregate("B", &chans(&["A", "C"])).await;

    let (sub, mut rx) = QueueSubscriber::channel("watcher");
    ps.subscribe_local("watcher", Arc::new(sub), &chans(&["A"])).await;

    assert_eq!(ps.get_constituents("A").await, vec!["A", "B", "C"]);
    assert_eq!(ps.notify(Value::Int(1), &chans(&["C"])).await, 1);
    ps.wait_idle().await;
    assert_eq!(rx.recv().await.unwrap().value, Value::Int(1));
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let ps = broker("pubsub");
    let (sub, _rx) = QueueSubscriber::channel("S");
    ps.subscribe_local("S", Arc::new(sub), &chans(&["X"])).await;

    ps.unsubscribe("S", &chans(&["X"])).await;
    ps.unsubscribe("S", &chans(&["X"])).await;
    ps.unsubscribe("S", &chans(&["NOPE"])).await;

    assert_eq!(ps.get_channels().await, vec!["X"]);
    assert_eq!(ps.notify(Value::Nil, &chans(&["X"])).await, 0);
}

#[tokio::test]
async fn test_recovered_subscriber_is_kept() {
    let ps = short_failure_limit();
    let flaky = Flaky::new(false);
    ps.subscribe_local("flaky", flaky.clone(), &chans(&["X"])).await;

    ps.notify(Value::Int(1), &chans(&["X"])).await;
    ps.wait_idle().await;
    sleep(Duration::from_millis(300)).await;

    flaky.healthy.store(true, Ordering::SeqCst);
    ps.notify(Value::Int(2), &chans(&["X"])).await;
    ps.wait_idle().await;
    assert_eq!(flaky.delivered.load(Ordering::SeqCst), 1);

    // A fresh run of failures starts a fresh clock.
    flaky.healthy.store(false, Ordering::SeqCst);
    ps.notify(Value::Int(3), &chans(&["X"])).await;
    ps.wait_idle().await;
    ps.notify(Value::Int(4), &chans(&["X"])).await;
    ps.wait_idle().await;
    assert!(ps.has_subscriber("flaky").await);
}

#[tokio::test]
async fn test_sustained_failure_evicts() {
    let ps = short_failure_limit();
    let flaky = Flaky::new(false);
    ps.subscribe_local("flaky", flaky, &chans(&["X"])).await;

    assert_eq!(ps.notify(Value::Int(1), &chans(&["X"])).await, 1);
    ps.wait_idle().await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(ps.notify(Value::Int(2), &chans(&["X"])).await, 1);
    ps.wait_idle().await;

    assert!(!ps.has_subscriber("flaky").await);
    assert_eq!(ps.notify(Value::Int(3), &chans(&["X"])).await, 0);
}

#[tokio::test]
async fn test_durable_subscribers_survive_failure_window() {
    let ps = short_failure_limit();
    let feed = dead_addr().await;
    let pinned = dead_addr().await;
    assert_ok!(ps.publish_to(&feed, &chans(&["X"]), &SubscribeOptions::new()).await);
    assert_ok!(
        ps.subscribe(&pinned, &chans(&["X"]), &SubscribeOptions::new().with_unsub(false))
            .await
    );

    assert_eq!(ps.notify(Value::Int(1), &chans(&["X"])).await, 2);
    ps.wait_idle().await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(ps.notify(Value::Int(2), &chans(&["X"])).await, 2);
    ps.wait_idle().await;

    assert!(ps.has_subscriber(&feed).await);
    assert!(ps.has_subscriber(&pinned).await);
    assert_eq!(ps.notify(Value::Int(3), &chans(&["X"])).await, 2);
    ps.wait_idle().await;
}

#[tokio::test]
async fn test_unsubscribe_local_keeps_handle() {
    let ps = broker("pubsub");
    let (sub, mut rx) = QueueSubscriber::channel("panel");
    ps.subscribe_local("panel", Arc::new(sub), &chans(&["X", "Y"])).await;

    ps.unsubscribe_local("panel", &chans(&["X"])).await;
    assert_eq!(ps.notify(Value::Int(1), &chans(&["X"])).await, 0);
    assert!(ps.has_subscriber("panel").await);

    assert_eq!(ps.notify(Value::Int(2), &chans(&["Y"])).await, 1);
    ps.wait_idle().await;
    assert_eq!(rx.recv().await.unwrap().value, Value::Int(2));

    assert!(ps.remove_subscriber("panel").await);
    assert!(!ps.has_subscriber("panel").await);
}

/// Subscriber that takes a while to accept each update.
struct Slow {
    done: AtomicUsize,
}

#[async_trait]
impl Subscriber for Slow {
    async fn remote_update(
        &self,
        _value: Value,
        _names: Vec<String>,
        _channels: Vec<String>,
    ) -> PubSubResult<()> {
        sleep(Duration::from_millis(300)).await;
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_stop_drains_scheduled_deliveries() {
    let ps = broker("pubsub");
    let slow = Arc::new(Slow {
        done: AtomicUsize::new(0),
    });
    ps.subscribe_local("slow", slow.clone(), &chans(&["X"])).await;
    ps.start();

    assert_eq!(ps.notify(Value::Int(1), &chans(&["X"])).await, 1);
    ps.stop().await;
    assert_eq!(slow.done.load(Ordering::SeqCst), 1);
    assert_eq!(ps.pool().status().busy, 0);
}

#[tokio::test]
async fn test_federated_cycle_delivers_once() {
    let names = Arc::new(NameService::default());
    let ps1 = federated("ps1", &names).await;
    let ps2 = federated("ps2", &names).await;

    // Each broker subscribes to the other on X.
    assert_ok!(ps1.subscribe("ps2", &chans(&["X"]), &SubscribeOptions::new()).await);
    assert_ok!(ps2.subscribe("ps1", &chans(&["X"]), &SubscribeOptions::new()).await);

    let (local1, mut rx1) = QueueSubscriber::channel("local1");
    let (local2, mut rx2) = QueueSubscriber::channel("local2");
    ps1.subscribe_local("local1", Arc::new(local1), &chans(&["X"])).await;
    ps2.subscribe_local("local2", Arc::new(local2), &chans(&["X"])).await;

    ps1.notify(Value::Int(42), &chans(&["X"])).await;

    let update = timeout(Duration::from_secs(5), rx2.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.value, Value::Int(42));
    assert_eq!(update.names, vec!["ps1", "ps2"]);
    assert_eq!(rx1.recv().await.unwrap().value, Value::Int(42));

    sleep(Duration::from_millis(300)).await;
    ps1.wait_idle().await;
    ps2.wait_idle().await;
    assert!(rx1.try_recv().is_err());
    assert!(rx2.try_recv().is_err());

    ps1.stop().await;
    ps2.stop().await;
}

#[tokio::test]
async fn test_remote_subscription_is_reasserted() {
    let names = Arc::new(NameService::default());
    let downstream = federated("downstream", &names).await;

    // The publisher does not exist yet; the subscription is kept anyway.
    let first = downstream
        .subscribe_remote("upstream", chans(&["STATUS"]), SubscribeOptions::new())
        .await;
    assert_err!(first);
    assert_eq!(downstream.remote_subscriptions().await.len(), 1);

    let upstream = federated("upstream", &names).await;
    assert_eq!(downstream.update_remote_subscriptions().await, 1);
    let (ids, _) = upstream.get_subscribers(&chans(&["STATUS"])).await;
    assert_eq!(ids, vec!["downstream"]);

    let (sink, mut rx) = QueueSubscriber::channel("sink");
    downstream
        .subscribe_local("sink", Arc::new(sink), &chans(&["STATUS"]))
        .await;
    upstream.notify(Value::from("ok"), &chans(&["STATUS"])).await;
    let update = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.value, Value::from("ok"));
    assert_eq!(update.names, vec!["upstream", "downstream"]);

    downstream.stop().await;
    upstream.stop().await;
}
