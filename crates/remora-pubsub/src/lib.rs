//! # Remora PubSub
//!
//! A federated publish/subscribe broker. Publishers notify a broker on
//! named channels; the broker forwards each update to the subscribers of
//! those channels and of every aggregate channel that contains them.
//!
//! # Architecture
//!
//! - **ChannelTable**: channels, aggregates and the precomputed fan-out sets
//! - **Subscriber**: delivery handles, remote (by name or `host:port`) or local
//! - **PubSub**: the broker, asynchronous delivery and failure eviction
//! - **Service**: the broker's remote method table
//! - **Topology**: declarative channels, aggregates and upstream subscriptions
//!
//! Brokers federate by subscribing to each other. Every update carries the
//! names of the brokers it has passed through, so cycles terminate.
//!
//! # Example
//!
//! ```rust,ignore
//! use remora_pubsub::{PubSub, PubSubConfig};
//!
//! let broker = Arc::new(PubSub::new("pubsub", PubSubConfig::default()));
//! broker.aggregate("ALL", &["TCS".into(), "DOME".into()]).await;
//! broker.subscribe_cb("logger", &["ALL".into()], |value, _, channels| {
//!     println!("{:?} on {:?}", value, channels);
//! }).await;
//! broker.notify(42.into(), &["TCS".into()]).await;
//! ```

pub mod broker;
pub mod channel;
pub mod error;
pub mod options;
pub mod service;
pub mod subscriber;
pub mod topology;

pub use broker::{
    PubSub, PubSubConfig, RemoteSubscription, DEFAULT_FAILURE_LIMIT, DEFAULT_REMOTE_TIMEOUT,
    DEFAULT_UPDATE_INTERVAL,
};
pub use channel::{Channel, ChannelTable};
pub use error::{PubSubError, PubSubResult};
pub use options::SubscribeOptions;
pub use subscriber::{
    CallbackSubscriber, QueueSubscriber, RemoteSubscriber, Subscriber, SubscriberRecord, Update,
};
pub use topology::{AggregateSpec, RemoteSpec, Topology};
