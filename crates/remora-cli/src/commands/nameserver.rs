//! Run the name service.

use super::shutdown_signal;
use crate::config::Config;
use anyhow::{Context, Result};
use colored::Colorize;
use remora_rpc::{AuthPolicy, NameService, ServerConfig, NAME_SERVICE};

pub fn run(config: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let section = &config.nameserver;
    let server_config = ServerConfig {
        auth: AuthPolicy::ServiceDefault,
        tls: section.tls.clone(),
        ..ServerConfig::new(
            NAME_SERVICE,
            host.unwrap_or_else(|| section.host.clone()),
            port.unwrap_or(section.port),
        )
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let service = NameService::new(section.service_config());
        let server = service
            .serve(server_config)
            .await
            .context("Failed to start name service")?;
        let addr = server.local_addr().await;
        println!(
            "{} Name service listening on {}",
            "ready".green().bold(),
            addr.map(|a| a.to_string()).unwrap_or_default()
        );

        shutdown_signal().await?;
        println!("{} Shutting down", "stop".yellow().bold());
        let stopped = server.stop().await;
        server.pool().shutdown().await;
        stopped.context("Failed to stop name service")?;
        Ok(())
    })
}
