//! Remote interface of the broker.

use crate::broker::PubSub;
use crate::options::SubscribeOptions;
use remora_core::{Fault, Value};
use remora_rpc::{Args, MethodTable};
use std::sync::Arc;

/// Status returned by mutating calls.
const OK: i64 = 0;

fn options(args: &Args, idx: usize) -> Result<SubscribeOptions, Fault> {
    let value = args.optional(idx).cloned().unwrap_or_default();
    Ok(SubscribeOptions::from_value(&value)?)
}

impl PubSub {
    /// The broker's operations as remote methods.
    ///
    /// Wherever a channel list is expected a single string is accepted too.
    pub fn methods(self: &Arc<Self>) -> MethodTable {
        let mut table = MethodTable::new();

        let broker = self.clone();
        table.register(
            "subscribe",
            &["subscriber", "channels", "options"],
            "Subscribe a broker or service (name or host:port) to channels.",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    broker
                        .subscribe(&args.str(0)?, &args.strings(1)?, &options(&args, 2)?)
                        .await?;
                    Ok(Value::Int(OK))
                }
            },
        );

        let broker = self.clone();
        table.register(
            "unsubscribe",
            &["subscriber", "channels", "options"],
            "Remove a subscriber from channels.",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    broker.unsubscribe(&args.str(0)?, &args.strings(1)?).await;
                    Ok(Value::Int(OK))
                }
            },
        );

        let broker = self.clone();
        table.register(
            "publish_to",
            &["subscriber", "channels", "options"],
            "Subscribe a feed target that is never evicted automatically.",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    broker
                        .publish_to(&args.str(0)?, &args.strings(1)?, &options(&args, 2)?)
                        .await?;
                    Ok(Value::Int(OK))
                }
            },
        );

        let broker = self.clone();
        table.register(
            "notify",
            &["value", "channels"],
            "Publish a value on channels.",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    let value = args.value(0)?.clone();
                    broker.notify(value, &args.strings(1)?).await;
                    Ok(Value::Int(OK))
                }
            },
        );

        let broker = self.clone();
        table.register(
            "remote_update",
            &["value", "names", "channels"],
            "Accept an update forwarded by the brokers in names.",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    let value = args.value(0)?.clone();
                    broker
                        .remote_update(value, args.strings(1)?, &args.strings(2)?)
                        .await;
                    Ok(Value::Int(OK))
                }
            },
        );

        let broker = self.clone();
        table.register(
            "aggregate",
            &["channel", "constituents"],
            "Define an aggregate channel over other channels.",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    broker.aggregate(&args.str(0)?, &args.strings(1)?).await;
                    Ok(Value::Int(OK))
                }
            },
        );

        let broker = self.clone();
        table.register(
            "deaggregate",
            &["channel"],
            "Delete an aggregate definition.",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    broker.deaggregate(&args.str(0)?).await;
                    Ok(Value::Int(OK))
                }
            },
        );

        let broker = self.clone();
        table.register(
            "get_subscribers",
            &["channels"],
            "Subscribers and aggregate memberships for channels, as [ids, channels].",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    let (ids, channels) = broker.get_subscribers(&args.strings(0)?).await;
                    Ok(Value::Array(vec![Value::from(ids), Value::from(channels)]))
                }
            },
        );

        let broker = self.clone();
        table.register(
            "get_constituents",
            &["channel"],
            "Transitive constituents of an aggregate channel.",
            move |_, args| {
                let broker = broker.clone();
                async move { Ok(Value::from(broker.get_constituents(&args.str(0)?).await)) }
            },
        );

        let broker = self.clone();
        table.register("add_channel", &["channel"], "Create a channel.", move |_, args| {
            let broker = broker.clone();
            async move {
                broker.add_channel(&args.str(0)?).await;
                Ok(Value::Int(OK))
            }
        });

        let broker = self.clone();
        table.register(
            "add_channels",
            &["channels"],
            "Create several channels.",
            move |_, args| {
                let broker = broker.clone();
                async move {
                    broker.add_channels(&args.strings(0)?).await;
                    Ok(Value::Int(OK))
                }
            },
        );

        let broker = self.clone();
        table.register("get_channels", &[], "All channel names.", move |_, _| {
            let broker = broker.clone();
            async move { Ok(Value::from(broker.get_channels().await)) }
        });

        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PubSubConfig;
    use crate::subscriber::QueueSubscriber;

    async fn invoke(table: &MethodTable, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        table.invoke(method, args).await
    }

    #[tokio::test]
    async fn test_channel_methods_accept_single_strings() {
        let broker = Arc::new(PubSub::new("pubsub", PubSubConfig::default()));
        let table = broker.methods();

        invoke(&table, "add_channel", vec!["X".into()]).await.unwrap();
        invoke(&table, "aggregate", vec!["ALL".into(), "X".into()])
            .await
            .unwrap();
        let constituents = invoke(&table, "get_constituents", vec!["ALL".into()])
            .await
            .unwrap();
        assert_eq!(constituents.as_string_list().unwrap(), vec!["X"]);

        let (sub, mut rx) = QueueSubscriber::channel("local");
        broker
            .subscribe_local("local", Arc::new(sub), &["ALL".to_string()])
            .await;

        let answer = invoke(&table, "get_subscribers", vec!["X".into()]).await.unwrap();
        let parts = answer.as_array().unwrap();
        assert_eq!(parts[0].as_string_list().unwrap(), vec!["local"]);
        assert_eq!(parts[1].as_string_list().unwrap(), vec!["ALL", "X"]);

        invoke(&table, "notify", vec![Value::Int(3), "X".into()])
            .await
            .unwrap();
        broker.wait_idle().await;
        assert_eq!(rx.recv().await.unwrap().value, Value::Int(3));
    }

    #[tokio::test]
    async fn test_bad_options_are_invalid_arguments() {
        let broker = Arc::new(PubSub::new("pubsub", PubSubConfig::default()));
        let table = broker.methods();
        let fault = invoke(
            &table,
            "subscribe",
            vec!["h:1".into(), "X".into(), Value::Int(5)],
        )
        .await
        .unwrap_err();
        assert_eq!(fault.code, Fault::INVALID_ARGUMENTS);
    }
}
