//! Declarative broker layout.
//!
//! A [`Topology`] lists the channels a broker should carry, the aggregates
//! defined over them and the upstream publishers it subscribes to. It is
//! usually read from the `[pubsub]` section of a configuration file.

use crate::broker::PubSub;
use crate::options::SubscribeOptions;
use remora_core::Credentials;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub name: String,
    pub channels: Vec<String>,
}

/// A subscription to an upstream publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSpec {
    /// Publisher name or `host:port`.
    pub publisher: String,
    pub channels: Vec<String>,
    /// Identity to subscribe under; defaults to the broker's name.
    #[serde(default)]
    pub name: Option<String>,
    /// `"user:secret"` presented to the publisher.
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
}

impl RemoteSpec {
    fn options(&self) -> Result<SubscribeOptions, remora_core::RemoraError> {
        let mut options = SubscribeOptions::new();
        if let Some(name) = &self.name {
            options = options.with_name(name);
        }
        if let Some(auth) = &self.auth {
            options = options.with_pubauth(Credentials::parse(auth)?);
        }
        if let Some(secure) = self.secure {
            options = options.with_pubsecure(secure);
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub aggregate: Vec<AggregateSpec>,
    #[serde(default)]
    pub remote: Vec<RemoteSpec>,
}

impl Topology {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.aggregate.is_empty() && self.remote.is_empty()
    }

    /// Create channels and aggregates, then record the upstream
    /// subscriptions.
    ///
    /// Unreachable publishers are only logged: the broker keeps
    /// re-asserting their subscriptions once started.
    pub async fn apply(&self, broker: &Arc<PubSub>) -> crate::PubSubResult<()> {
        broker.add_channels(&self.channels).await;
        for agg in &self.aggregate {
            broker.aggregate(&agg.name, &agg.channels).await;
        }
        for remote in &self.remote {
            let options = remote.options()?;
            if let Err(e) = broker
                .subscribe_remote(&remote.publisher, remote.channels.clone(), options)
                .await
            {
                warn!("Publisher '{}' not reachable yet: {}", remote.publisher, e);
            }
        }
        info!(
            "Applied topology: {} channel(s), {} aggregate(s), {} upstream",
            self.channels.len(),
            self.aggregate.len(),
            self.remote.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PubSubConfig;

    #[tokio::test]
    async fn test_apply_builds_channels_and_records_remotes() {
        let topology: Topology = serde_json::from_str(
            r#"{
                "channels": ["TCS", "DOME"],
                "aggregate": [{"name": "ALL", "channels": ["TCS", "DOME", "INS"]}],
                "remote": [{"publisher": "127.0.0.1:1", "channels": ["STATUS"], "auth": "ps:pw"}]
            }"#,
        )
        .unwrap();
        assert!(!topology.is_empty());

        let broker = Arc::new(PubSub::new("pubsub", PubSubConfig::default()));
        topology.apply(&broker).await.unwrap();

        assert_eq!(
            broker.get_channels().await,
            vec!["ALL", "DOME", "INS", "TCS"]
        );
        assert_eq!(
            broker.get_constituents("ALL").await,
            vec!["DOME", "INS", "TCS"]
        );
        let remotes = broker.remote_subscriptions().await;
        assert_eq!(remotes.len(), 1);
        assert_eq!(
            remotes[0].options.pubauth,
            Some(Credentials::new("ps", "pw"))
        );
    }

    #[tokio::test]
    async fn test_bad_credentials_are_rejected() {
        let topology = Topology {
            remote: vec![RemoteSpec {
                publisher: "upstream".into(),
                channels: vec!["X".into()],
                auth: Some("no-separator".into()),
                ..RemoteSpec::default()
            }],
            ..Topology::default()
        };
        let broker = Arc::new(PubSub::new("pubsub", PubSubConfig::default()));
        assert!(topology.apply(&broker).await.is_err());
    }
}
