//! Run a pub/sub broker daemon.

use super::{client_config, name_service, shutdown_signal};
use crate::config::Config;
use crate::logging::ReloadableFilter;
use anyhow::{Context, Result};
use colored::Colorize;
use remora_pubsub::{PubSub, PubSubConfig};
use remora_rpc::{AuthPolicy, LogControl, NameDirectory, Server, ServerConfig};
use std::sync::Arc;
use tracing::info;

pub struct PubSubArgs {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ns: Option<String>,
}

pub fn run(config: &Config, args: PubSubArgs, log: Arc<ReloadableFilter>) -> Result<()> {
    let section = &config.pubsub;
    let name = args.name.unwrap_or_else(|| section.name.clone());
    let server_config = ServerConfig {
        auth: AuthPolicy::ServiceDefault,
        advertise_host: section.advertise_host.clone(),
        ..ServerConfig::new(
            name.clone(),
            args.host.unwrap_or_else(|| section.host.clone()),
            args.port.unwrap_or(section.port),
        )
    };
    let broker_config = PubSubConfig {
        client: client_config(config)?,
        ..section.broker_config()
    };
    let directory: Arc<dyn NameDirectory> = name_service(config, args.ns.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let broker = Arc::new(PubSub::new(name.clone(), broker_config).with_directory(directory.clone()));
        section
            .topology
            .apply(&broker)
            .await
            .context("Failed to apply pubsub topology")?;

        let log: Arc<dyn LogControl> = log;
        let server = Server::new(server_config, broker.methods())
            .with_pool(broker.pool().clone())
            .with_directory(directory)
            .with_log_control(log);
        let addr = server
            .start()
            .await
            .with_context(|| format!("Failed to start broker '{}'", name))?;
        broker.start();

        info!("Broker channels: {:?}", broker.get_channels().await);
        println!(
            "{} Broker '{}' listening on {}",
            "ready".green().bold(),
            name,
            addr
        );

        shutdown_signal().await?;
        println!("{} Shutting down", "stop".yellow().bold());
        let stopped = server.stop().await;
        broker.stop().await;
        broker.pool().shutdown().await;
        stopped.context("Failed to stop broker server")?;
        Ok(())
    })
}
