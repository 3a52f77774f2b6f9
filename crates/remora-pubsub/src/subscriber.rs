//! Delivery handles for subscribers.

use crate::error::{PubSubError, PubSubResult};
use async_trait::async_trait;
use remora_core::{CallResult, Endpoint, HostPort, Value};
use remora_rpc::{Client, ClientConfig, NameDirectory, RemoteObjectProxy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Receives updates from a broker.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Deliver `value`, published by the brokers in `names`, on `channels`.
    async fn remote_update(
        &self,
        value: Value,
        names: Vec<String>,
        channels: Vec<String>,
    ) -> PubSubResult<()>;
}

enum Target {
    Direct(Client),
    Named(RemoteObjectProxy),
}

/// Subscriber (or publisher) in another process.
///
/// Ids containing `':'` are `host:port` addresses called directly; any
/// other id is a logical name resolved through the name service.
pub struct RemoteSubscriber {
    id: String,
    target: Target,
}

impl RemoteSubscriber {
    pub fn new(
        id: &str,
        auth: Option<remora_core::Credentials>,
        secure: Option<bool>,
        timeout: Duration,
        directory: Option<Arc<dyn NameDirectory>>,
        config: ClientConfig,
    ) -> PubSubResult<Self> {
        let target = if id.contains(':') {
            let addr: HostPort = id.parse()?;
            let endpoint = Endpoint::from_addr(addr)
                .with_auth(auth)
                .with_secure(secure.unwrap_or(false))
                .with_timeout(timeout);
            Target::Direct(Client::with_config(endpoint, config))
        } else {
            let directory = directory.ok_or_else(|| PubSubError::Unreachable {
                id: id.to_string(),
                reason: "no name service configured".to_string(),
            })?;
            let mut proxy =
                RemoteObjectProxy::with_config(id, directory, config).with_timeout(timeout);
            if let Some(auth) = auth {
                proxy = proxy.with_auth(Some(auth));
            }
            if let Some(secure) = secure {
                proxy = proxy.with_secure(secure);
            }
            Target::Named(proxy)
        };
        Ok(Self {
            id: id.to_string(),
            target,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Call any method on the remote side.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> CallResult {
        match &self.target {
            Target::Direct(client) => client.call(method, args).await,
            Target::Named(proxy) => proxy.call(method, args).await,
        }
    }
}

#[async_trait]
impl Subscriber for RemoteSubscriber {
    async fn remote_update(
        &self,
        value: Value,
        names: Vec<String>,
        channels: Vec<String>,
    ) -> PubSubResult<()> {
        self.call(
            "remote_update",
            vec![value, Value::from(names), Value::from(channels)],
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for RemoteSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSubscriber").field("id", &self.id).finish()
    }
}

type Callback = dyn Fn(Value, Vec<String>, Vec<String>) + Send + Sync;

/// In-process subscriber backed by a closure.
pub struct CallbackSubscriber {
    callback: Box<Callback>,
}

impl CallbackSubscriber {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Value, Vec<String>, Vec<String>) + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Subscriber for CallbackSubscriber {
    async fn remote_update(
        &self,
        value: Value,
        names: Vec<String>,
        channels: Vec<String>,
    ) -> PubSubResult<()> {
        (self.callback)(value, names, channels);
        Ok(())
    }
}

/// One delivered update.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub value: Value,
    pub names: Vec<String>,
    pub channels: Vec<String>,
}

/// In-process subscriber that queues updates for a consumer task.
pub struct QueueSubscriber {
    id: String,
    tx: mpsc::UnboundedSender<Update>,
}

impl QueueSubscriber {
    /// A subscriber and the receiver its updates arrive on.
    pub fn channel(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Update>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }
}

#[async_trait]
impl Subscriber for QueueSubscriber {
    async fn remote_update(
        &self,
        value: Value,
        names: Vec<String>,
        channels: Vec<String>,
    ) -> PubSubResult<()> {
        self.tx
            .send(Update {
                value,
                names,
                channels,
            })
            .map_err(|_| PubSubError::Closed(self.id.clone()))
    }
}

/// Broker-side state of one subscriber.
#[derive(Clone)]
pub struct SubscriberRecord {
    pub handle: Arc<dyn Subscriber>,
    /// Start of the current run of failed deliveries.
    pub first_failure: Option<Instant>,
    pub can_unsubscribe: bool,
}

impl SubscriberRecord {
    pub fn new(handle: Arc<dyn Subscriber>, can_unsubscribe: bool) -> Self {
        Self {
            handle,
            first_failure: None,
            can_unsubscribe,
        }
    }
}

impl std::fmt::Debug for SubscriberRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRecord")
            .field("first_failure", &self.first_failure)
            .field("can_unsubscribe", &self.can_unsubscribe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_subscriber() {
        let (sub, mut rx) = QueueSubscriber::channel("q");
        sub.remote_update(Value::Int(1), vec!["ps".into()], vec!["X".into()])
            .await
            .unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.value, Value::Int(1));
        assert_eq!(update.channels, vec!["X"]);

        drop(rx);
        let err = sub
            .remote_update(Value::Nil, vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::Closed(_)));
    }

    #[test]
    fn test_named_subscriber_needs_directory() {
        let err = RemoteSubscriber::new(
            "monitor",
            None,
            None,
            Duration::from_secs(1),
            None,
            ClientConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PubSubError::Unreachable { .. }));

        assert!(RemoteSubscriber::new(
            "bad:port",
            None,
            None,
            Duration::from_secs(1),
            None,
            ClientConfig::default()
        )
        .is_err());
    }
}
