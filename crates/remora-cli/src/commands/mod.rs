//! CLI command implementations.

pub mod call;
pub mod names;
pub mod nameserver;
pub mod ping;
pub mod pubsub;

use crate::config::Config;
use anyhow::{Context, Result};
use remora_core::{CallResult, Credentials, Endpoint, HostPort, Value};
use remora_rpc::{Client, ClientConfig, NameServiceClient, RemoteObjectProxy};
use std::sync::Arc;

/// Client settings from the `[client]` section.
pub fn client_config(config: &Config) -> Result<ClientConfig> {
    let mut client = ClientConfig::default();
    if let Some(tls) = &config.client.tls {
        client.tls = Some(tls.connector().context("Failed to load client TLS material")?);
    }
    Ok(client)
}

/// Name service client for `--ns`, falling back to the configured hosts.
pub fn name_service(config: &Config, ns: Option<&str>) -> Result<Arc<NameServiceClient>> {
    let hosts = ns.unwrap_or(&config.client.nameservice);
    let client = NameServiceClient::from_hosts(hosts)
        .with_context(|| format!("Invalid name service hosts '{}'", hosts))?;
    Ok(Arc::new(client))
}

/// A service addressed by logical name or `host:port`.
pub enum Target {
    Direct(Client),
    Named(RemoteObjectProxy),
}

impl Target {
    pub fn open(config: &Config, target: &str, ns: Option<&str>, secure: bool) -> Result<Self> {
        let auth = config
            .client
            .auth
            .as_deref()
            .map(Credentials::parse)
            .transpose()
            .context("Invalid [client] auth")?;
        let client_config = client_config(config)?;

        if target.contains(':') {
            let addr: HostPort = target
                .parse()
                .with_context(|| format!("Invalid address '{}'", target))?;
            let endpoint = Endpoint::from_addr(addr)
                .with_auth(auth)
                .with_secure(secure)
                .with_timeout(config.client.timeout());
            Ok(Target::Direct(Client::with_config(endpoint, client_config)))
        } else {
            let mut proxy =
                RemoteObjectProxy::with_config(target, name_service(config, ns)?, client_config)
                    .with_timeout(config.client.timeout());
            // Otherwise follow what each instance advertises.
            if secure {
                proxy = proxy.with_secure(true);
            }
            if let Some(auth) = auth {
                proxy = proxy.with_auth(Some(auth));
            }
            Ok(Target::Named(proxy))
        }
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> CallResult {
        match self {
            Target::Direct(client) => client.call(method, args).await,
            Target::Named(proxy) => proxy.call(method, args).await,
        }
    }
}

/// Interpret a command-line argument as a JSON literal, else as a string.
pub fn parse_arg(arg: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(arg)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(arg))
}

/// Block until Ctrl-C.
pub async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), Value::Int(42));
        assert_eq!(parse_arg("true"), Value::Bool(true));
        assert_eq!(parse_arg("\"quoted\""), Value::from("quoted"));
        assert_eq!(parse_arg("bare"), Value::from("bare"));
        assert_eq!(
            parse_arg("[1, \"x\"]"),
            Value::Array(vec![Value::Int(1), Value::from("x")])
        );
    }

    #[test]
    fn test_target_kinds() {
        let config = Config::default();
        assert!(matches!(
            Target::open(&config, "127.0.0.1:7080", None, false).unwrap(),
            Target::Direct(_)
        ));
        assert!(matches!(
            Target::open(&config, "archiver", Some("127.0.0.1"), false).unwrap(),
            Target::Named(_)
        ));
        assert!(Target::open(&config, "host:notaport", None, false).is_err());
    }
}
