//! The publish/subscribe broker.
//!
//! A [`PubSub`] fans updates out to the subscribers of a channel and of
//! every aggregate containing it. Brokers federate by subscribing to each
//! other; the list of broker names an update has passed through travels
//! with it, so an update never returns to a broker it already visited.
//!
//! All bookkeeping sits behind one async mutex. Deliveries snapshot the
//! subscribers they need, release the lock and run as independent pool
//! tasks; a subscriber that keeps failing for longer than the failure
//! limit is dropped.

use crate::channel::ChannelTable;
use crate::error::{PubSubError, PubSubResult};
use crate::options::SubscribeOptions;
use crate::subscriber::{CallbackSubscriber, RemoteSubscriber, Subscriber, SubscriberRecord};
use remora_core::{Credentials, Value};
use remora_rpc::pool::DEFAULT_WORKERS;
use remora_rpc::{ClientConfig, NameDirectory, Server, ServerConfig, WorkerPool};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_FAILURE_LIMIT: Duration = Duration::from_secs(60);
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker settings.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Sustained failure after which an evictable subscriber is dropped.
    pub failure_limit: Duration,
    /// Interval between re-assertions of remote subscriptions.
    pub update_interval: Duration,
    /// Call timeout towards subscribers and publishers.
    pub remote_timeout: Duration,
    /// Worker pool size when the broker owns its pool.
    pub workers: usize,
    pub client: ClientConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            failure_limit: DEFAULT_FAILURE_LIMIT,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            workers: DEFAULT_WORKERS,
            client: ClientConfig::default(),
        }
    }
}

/// A subscription this broker holds at an upstream publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscription {
    pub publisher: String,
    pub channels: Vec<String>,
    pub options: SubscribeOptions,
}

struct BrokerState {
    table: ChannelTable,
    partners: HashMap<String, SubscriberRecord>,
    /// Remote handles by id, shared by subscribers and publishers.
    proxies: HashMap<String, Arc<RemoteSubscriber>>,
    remote_subs: BTreeMap<(String, Vec<String>), RemoteSubscription>,
}

impl BrokerState {
    fn evict(&mut self, id: &str) -> bool {
        let subscribed = self.table.remove_subscriber(id);
        let known = self.partners.remove(id).is_some();
        self.proxies.remove(id);
        subscribed || known
    }
}

/// Publish/subscribe broker.
///
/// Operations that spawn work take `self: &Arc<Self>`.
pub struct PubSub {
    name: String,
    config: PubSubConfig,
    state: Mutex<BrokerState>,
    pool: WorkerPool,
    directory: Option<Arc<dyn NameDirectory>>,
    run: std::sync::Mutex<Option<CancellationToken>>,
    server: Mutex<Option<Server>>,
}

impl PubSub {
    pub fn new(name: impl Into<String>, config: PubSubConfig) -> Self {
        let name = name.into();
        Self {
            state: Mutex::new(BrokerState {
                table: ChannelTable::new(name.clone()),
                partners: HashMap::new(),
                proxies: HashMap::new(),
                remote_subs: BTreeMap::new(),
            }),
            pool: WorkerPool::new(config.workers),
            name,
            config,
            directory: None,
            run: std::sync::Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    /// Resolve logical subscriber and publisher names through `directory`.
    pub fn with_directory(mut self, directory: Arc<dyn NameDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Share an existing pool instead of owning one.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Channels and aggregates
    // ------------------------------------------------------------------

    pub async fn add_channel(&self, name: &str) {
        self.state.lock().await.table.add_channel(name);
    }

    pub async fn add_channels(&self, names: &[String]) {
        self.state.lock().await.table.add_channels(names);
    }

    pub async fn get_channels(&self) -> Vec<String> {
        self.state.lock().await.table.channels()
    }

    pub async fn aggregate(&self, name: &str, constituents: &[String]) {
        debug!("Aggregating {:?} into '{}'", constituents, name);
        self.state.lock().await.table.aggregate(name, constituents);
    }

    /// Drop an aggregate definition; unknown names are ignored.
    pub async fn deaggregate(&self, name: &str) {
        self.state.lock().await.table.deaggregate(name);
    }

    pub async fn get_constituents(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .table
            .constituents(name)
            .into_iter()
            .collect()
    }

    /// Subscriber ids and channel memberships an update on `channels` reaches.
    pub async fn get_subscribers(&self, channels: &[String]) -> (Vec<String>, Vec<String>) {
        let (subscribers, memberships) = self.state.lock().await.table.resolve(channels);
        (
            subscribers.into_iter().collect(),
            memberships.into_iter().collect(),
        )
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    fn remote_handle(
        &self,
        state: &mut BrokerState,
        id: &str,
        auth: Option<Credentials>,
        secure: Option<bool>,
    ) -> PubSubResult<Arc<RemoteSubscriber>> {
        if let Some(handle) = state.proxies.get(id) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(RemoteSubscriber::new(
            id,
            auth,
            secure,
            self.config.remote_timeout,
            self.directory.clone(),
            self.config.client.clone(),
        )?);
        debug!("Created handle for '{}'", id);
        state.proxies.insert(id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Subscribe a remote subscriber to `channels`.
    ///
    /// The subscriber is called back by name (through the name service) or
    /// at `host:port`, using the `auth` and `secure` options.
    pub async fn subscribe(
        &self,
        id: &str,
        channels: &[String],
        options: &SubscribeOptions,
    ) -> PubSubResult<()> {
        debug!("Subscribing '{}' to {:?}", id, channels);
        let mut state = self.state.lock().await;
        let handle = self.remote_handle(&mut state, id, options.auth.clone(), options.secure)?;
        state.partners.insert(
            id.to_string(),
            SubscriberRecord::new(handle, options.can_unsubscribe()),
        );
        state.table.subscribe(id, channels);
        Ok(())
    }

    /// Remove `id` from `channels`. Not being subscribed is not an error.
    pub async fn unsubscribe(&self, id: &str, channels: &[String]) {
        debug!("Unsubscribing '{}' from {:?}", id, channels);
        self.state.lock().await.table.unsubscribe(id, channels);
    }

    /// Subscribe a durable feed target: never evicted unless the options
    /// explicitly allow it.
    pub async fn publish_to(
        &self,
        id: &str,
        channels: &[String],
        options: &SubscribeOptions,
    ) -> PubSubResult<()> {
        let mut options = options.clone();
        options.unsub.get_or_insert(false);
        self.subscribe(id, channels, &options).await
    }

    /// Subscribe an in-process handle under `id`.
    pub async fn subscribe_local(&self, id: &str, handle: Arc<dyn Subscriber>, channels: &[String]) {
        debug!("Subscribing local '{}' to {:?}", id, channels);
        let mut state = self.state.lock().await;
        state
            .partners
            .insert(id.to_string(), SubscriberRecord::new(handle, true));
        state.table.subscribe(id, channels);
    }

    /// Subscribe a closure under `id`.
    pub async fn subscribe_cb<F>(&self, id: &str, channels: &[String], callback: F)
    where
        F: Fn(Value, Vec<String>, Vec<String>) + Send + Sync + 'static,
    {
        self.subscribe_local(id, Arc::new(CallbackSubscriber::new(callback)), channels)
            .await;
    }

    /// Counterpart of [`subscribe_local`](Self::subscribe_local); the
    /// handle stays known until [`remove_subscriber`](Self::remove_subscriber).
    pub async fn unsubscribe_local(&self, id: &str, channels: &[String]) {
        self.unsubscribe(id, channels).await;
    }

    /// Drop `id` from every channel and forget its handle.
    pub async fn remove_subscriber(&self, id: &str) -> bool {
        self.state.lock().await.evict(id)
    }

    /// Whether `id` currently has a delivery handle.
    pub async fn has_subscriber(&self, id: &str) -> bool {
        self.state.lock().await.partners.contains_key(id)
    }

    // ------------------------------------------------------------------
    // Update propagation
    // ------------------------------------------------------------------

    /// Publish `value` on `channels` from this broker.
    ///
    /// Returns the number of deliveries scheduled.
    pub async fn notify(self: &Arc<Self>, value: Value, channels: &[String]) -> usize {
        self.named_update(value, vec![self.name.clone()], channels)
            .await
    }

    /// Accept an update forwarded by another broker.
    ///
    /// Updates that already passed through this broker are dropped.
    pub async fn remote_update(
        self: &Arc<Self>,
        value: Value,
        names: Vec<String>,
        channels: &[String],
    ) -> usize {
        if names.iter().any(|n| *n == self.name) {
            debug!("Dropping update that already visited '{}'", self.name);
            return 0;
        }
        self.named_update(value, names, channels).await
    }

    async fn named_update(
        self: &Arc<Self>,
        value: Value,
        mut names: Vec<String>,
        channels: &[String],
    ) -> usize {
        let (targets, memberships) = {
            let state = self.state.lock().await;
            let (subscribers, memberships) = state.table.resolve(channels);
            let targets: Vec<(String, Arc<dyn Subscriber>)> = subscribers
                .into_iter()
                .filter(|id| !names.contains(id))
                .filter_map(|id| {
                    let handle = state.partners.get(&id)?.handle.clone();
                    Some((id, handle))
                })
                .collect();
            (targets, memberships.into_iter().collect::<Vec<_>>())
        };

        if !names.contains(&self.name) {
            names.push(self.name.clone());
        }
        debug!(
            "Update on {:?} from {:?} goes to {} subscriber(s)",
            channels,
            names,
            targets.len()
        );

        let scheduled = targets.len();
        for (id, handle) in targets {
            let broker = self.clone();
            let value = value.clone();
            let names = names.clone();
            let memberships = memberships.clone();
            self.pool.spawn(async move {
                broker.deliver(id, handle, value, names, memberships).await;
            });
        }
        scheduled
    }

    async fn deliver(
        &self,
        id: String,
        handle: Arc<dyn Subscriber>,
        value: Value,
        names: Vec<String>,
        channels: Vec<String>,
    ) {
        let result = handle.remote_update(value, names, channels).await;

        let mut state = self.state.lock().await;
        let Some(record) = state.partners.get_mut(&id) else {
            return;
        };
        // Resubscribed meanwhile; the outcome belongs to a stale handle.
        if !Arc::ptr_eq(&record.handle, &handle) {
            return;
        }

        let evict = match result {
            Ok(()) => {
                if record.first_failure.take().is_some() {
                    info!("Subscriber '{}' recovered", id);
                }
                false
            }
            Err(e) => {
                error!("Cannot update subscriber '{}': {}", id, e);
                match record.first_failure {
                    None => {
                        record.first_failure = Some(Instant::now());
                        false
                    }
                    Some(since) => {
                        since.elapsed() > self.config.failure_limit && record.can_unsubscribe
                    }
                }
            }
        };

        if evict {
            warn!(
                "Removing subscriber '{}' after {:?} of failed deliveries",
                id, self.config.failure_limit
            );
            state.evict(&id);
        }
    }

    /// Wait until every scheduled delivery has finished.
    pub async fn wait_idle(&self) {
        self.pool.wait_idle().await;
    }

    // ------------------------------------------------------------------
    // Remote subscriptions
    // ------------------------------------------------------------------

    /// Subscribe this broker to `channels` of `publisher` and keep the
    /// subscription asserted.
    ///
    /// The subscription is recorded even if the publisher is unreachable
    /// now; the returned error reports the first attempt only.
    pub async fn subscribe_remote(
        &self,
        publisher: &str,
        channels: Vec<String>,
        options: SubscribeOptions,
    ) -> PubSubResult<()> {
        let subscription = RemoteSubscription {
            publisher: publisher.to_string(),
            channels: channels.clone(),
            options,
        };
        self.state
            .lock()
            .await
            .remote_subs
            .insert((publisher.to_string(), channels), subscription.clone());
        self.assert_remote("subscribe", &subscription).await
    }

    /// Withdraw a subscription made with [`subscribe_remote`](Self::subscribe_remote).
    pub async fn unsubscribe_remote(
        &self,
        publisher: &str,
        channels: Vec<String>,
        options: SubscribeOptions,
    ) -> PubSubResult<()> {
        self.state
            .lock()
            .await
            .remote_subs
            .remove(&(publisher.to_string(), channels.clone()));
        let subscription = RemoteSubscription {
            publisher: publisher.to_string(),
            channels,
            options,
        };
        self.assert_remote("unsubscribe", &subscription).await
    }

    pub async fn remote_subscriptions(&self) -> Vec<RemoteSubscription> {
        self.state.lock().await.remote_subs.values().cloned().collect()
    }

    async fn assert_remote(&self, method: &str, sub: &RemoteSubscription) -> PubSubResult<()> {
        let handle = {
            let mut state = self.state.lock().await;
            self.remote_handle(
                &mut state,
                &sub.publisher,
                sub.options.pubauth.clone(),
                sub.options.pubsecure,
            )?
        };
        let name = sub.options.name.clone().unwrap_or_else(|| self.name.clone());
        debug!("{} '{}' at '{}' for {:?}", method, name, sub.publisher, sub.channels);

        let result = handle
            .call(
                method,
                vec![
                    Value::from(name),
                    Value::from(sub.channels.clone()),
                    sub.options.to_value(),
                ],
            )
            .await;
        if let Err(e) = &result {
            error!(
                "{} via '{}' for {:?} failed: {}",
                method, sub.publisher, sub.channels, e
            );
        }
        result.map(|_| ()).map_err(PubSubError::from)
    }

    /// Re-assert every remote subscription once; returns how many succeeded.
    pub async fn update_remote_subscriptions(&self) -> usize {
        let subscriptions = self.remote_subscriptions().await;
        let mut asserted = 0;
        for sub in &subscriptions {
            if self.assert_remote("subscribe", sub).await.is_ok() {
                asserted += 1;
            }
        }
        debug!(
            "Re-asserted {}/{} remote subscription(s)",
            asserted,
            subscriptions.len()
        );
        asserted
    }

    async fn update_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.update_remote_subscriptions().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.update_interval) => {}
            }
        }
        debug!("Remote subscription loop of '{}' exited", self.name);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the remote subscription loop. Starting twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if run.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *run = Some(cancel.clone());
        self.pool.spawn_background(self.clone().update_loop(cancel));
        info!("PubSub '{}' background tasks started", self.name);
    }

    /// Serve the broker's methods and start background tasks.
    ///
    /// The server shares the broker's pool and registers with its
    /// directory, if any.
    pub async fn start_server(self: &Arc<Self>, config: ServerConfig) -> PubSubResult<SocketAddr> {
        let mut server = Server::new(config, self.methods()).with_pool(self.pool.clone());
        if let Some(directory) = &self.directory {
            server = server.with_directory(directory.clone());
        }
        let addr = server.start().await?;
        *self.server.lock().await = Some(server);
        self.start();
        Ok(addr)
    }

    /// Stop background tasks and the server, if one was started, then
    /// wait for deliveries already scheduled to finish.
    ///
    /// Deliveries are bounded by `remote_timeout`, so the drain is too.
    pub async fn stop(&self) {
        let cancel = self.run.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(server) = self.server.lock().await.take() {
            if let Err(e) = server.stop().await {
                warn!("Stopping server of '{}': {}", self.name, e);
            }
        }
        let pending = self.pool.status();
        if pending.busy + pending.queued > 0 {
            debug!(
                "Waiting for {} delivery task(s) of '{}'",
                pending.busy + pending.queued,
                self.name
            );
        }
        self.pool.wait_idle().await;
        info!("PubSub '{}' background tasks stopped", self.name);
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::QueueSubscriber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chans(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_notify_reaches_aggregate_subscribers() {
        let broker = Arc::new(PubSub::new("pubsub", PubSubConfig::default()));
        let (s1, mut rx1) = QueueSubscriber::channel("S1");
        let (s2, mut rx2) = QueueSubscriber::channel("S2");
        broker.subscribe_local("S1", Arc::new(s1), &chans(&["X"])).await;
        broker.aggregate("ALL", &chans(&["X", "Y"])).await;
        broker.subscribe_local("S2", Arc::new(s2), &chans(&["ALL"])).await;

        assert_eq!(broker.notify(Value::Int(7), &chans(&["Y"])).await, 1);
        broker.wait_idle().await;
        let update = rx2.recv().await.unwrap();
        assert_eq!(update.value, Value::Int(7));
        assert_eq!(update.names, vec!["pubsub"]);
        assert_eq!(update.channels, vec!["ALL", "Y"]);
        assert!(rx1.try_recv().is_err());

        assert_eq!(broker.notify(Value::Int(8), &chans(&["X"])).await, 2);
        broker.wait_idle().await;
        assert_eq!(rx1.recv().await.unwrap().value, Value::Int(8));
        assert_eq!(rx2.recv().await.unwrap().value, Value::Int(8));
    }

    #[tokio::test]
    async fn test_originators_are_skipped() {
        let broker = Arc::new(PubSub::new("pubsub", PubSubConfig::default()));
        let hits = Arc::new(AtomicUsize::new(0));
        for id in ["peer", "other"] {
            let hits = hits.clone();
            broker
                .subscribe_cb(id, &chans(&["X"]), move |_, _, _| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        let names = vec!["peer".to_string()];
        assert_eq!(broker.remote_update(Value::Nil, names, &chans(&["X"])).await, 1);

        let looped = vec!["peer".to_string(), "pubsub".to_string()];
        assert_eq!(broker.remote_update(Value::Nil, looped, &chans(&["X"])).await, 0);

        broker.wait_idle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_to_defaults_to_durable() {
        let broker = PubSub::new("pubsub", PubSubConfig::default());
        broker
            .publish_to("127.0.0.1:9", &chans(&["X"]), &SubscribeOptions::new())
            .await
            .unwrap();
        let state = broker.state.lock().await;
        assert!(!state.partners["127.0.0.1:9"].can_unsubscribe);
    }

    #[tokio::test]
    async fn test_unreachable_remote_subscriber_is_evicted() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let broker = Arc::new(PubSub::new(
            "pubsub",
            PubSubConfig {
                failure_limit: Duration::from_millis(200),
                ..PubSubConfig::default()
            },
        ));
        broker
            .subscribe(&dead, &chans(&["X"]), &SubscribeOptions::new())
            .await
            .unwrap();
        assert!(broker.state.lock().await.proxies.contains_key(&dead));

        assert_eq!(broker.notify(Value::Int(1), &chans(&["X"])).await, 1);
        broker.wait_idle().await;
        assert!(broker.state.lock().await.partners[&dead].first_failure.is_some());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(broker.notify(Value::Int(2), &chans(&["X"])).await, 1);
        broker.wait_idle().await;

        let state = broker.state.lock().await;
        assert!(!state.partners.contains_key(&dead));
        assert!(!state.proxies.contains_key(&dead));
        assert!(state.table.resolve(&chans(&["X"])).0.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_publisher_is_recorded() {
        let broker = PubSub::new("pubsub", PubSubConfig::default());
        let err = broker
            .subscribe_remote("upstream", chans(&["X"]), SubscribeOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::Unreachable { .. }));
        assert_eq!(broker.remote_subscriptions().await.len(), 1);

        broker
            .unsubscribe_remote("upstream", chans(&["X"]), SubscribeOptions::new())
            .await
            .ok();
        assert!(broker.remote_subscriptions().await.is_empty());
    }
}
