//! The name service: a [`NameRegistry`] exposed as a remote object.

use super::{NameDirectory, NameRegistry, RegisterOptions, ServiceRecord, NAME_SERVICE};
use crate::methods::MethodTable;
use crate::server::{Server, ServerConfig};
use async_trait::async_trait;
use remora_core::{CallError, HostPort, RemoraResult, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default interval of the purge loop.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct NameServiceConfig {
    /// Registrations silent for longer than this are purged.
    pub purge_delta: Duration,
    pub purge_interval: Duration,
}

impl Default for NameServiceConfig {
    fn default() -> Self {
        Self {
            purge_delta: super::DEFAULT_PURGE_DELTA,
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }
}

/// Shared registry plus its RPC surface.
#[derive(Clone)]
pub struct NameService {
    registry: Arc<Mutex<NameRegistry>>,
    config: NameServiceConfig,
}

impl Default for NameService {
    fn default() -> Self {
        Self::new(NameServiceConfig::default())
    }
}

fn flag(b: bool) -> Value {
    Value::Int(i64::from(b))
}

fn records(records: Vec<ServiceRecord>) -> Value {
    Value::Array(records.iter().map(ServiceRecord::to_value).collect())
}

impl NameService {
    pub fn new(config: NameServiceConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(NameRegistry::with_purge_delta(
                config.purge_delta,
            ))),
            config,
        }
    }

    /// Lock the registry. A poisoned lock is recovered; every registry
    /// operation leaves the table consistent.
    pub fn registry(&self) -> MutexGuard<'_, NameRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The registry operations as remote methods.
    pub fn methods(&self) -> MethodTable {
        let mut table = MethodTable::new();

        let svc = self.clone();
        table.register(
            "register",
            &["name", "host", "port", "options"],
            "Register a service instance. Returns 1 if it was not known before.",
            move |_, args| {
                let svc = svc.clone();
                async move {
                    let options = RegisterOptions::from_value(&args.struct_or_empty(3)?);
                    let is_new =
                        svc.registry()
                            .register(&args.str(0)?, &args.str(1)?, args.port(2)?, options);
                    Ok(flag(is_new))
                }
            },
        );

        let svc = self.clone();
        table.register(
            "ping",
            &["name", "host", "port", "options", "hosttime"],
            "Keep a registration alive, registering it if unknown.",
            move |_, args| {
                let svc = svc.clone();
                async move {
                    let options = RegisterOptions::from_value(&args.struct_or_empty(3)?);
                    let host_time = args.optional(4).and_then(Value::as_f64);
                    let is_new = svc.registry().ping(
                        &args.str(0)?,
                        &args.str(1)?,
                        args.port(2)?,
                        options,
                        host_time,
                    );
                    Ok(flag(is_new))
                }
            },
        );

        let svc = self.clone();
        table.register(
            "unregister",
            &["name", "host", "port"],
            "Remove one registration. Returns 1 if it existed.",
            move |_, args| {
                let svc = svc.clone();
                async move {
                    let removed =
                        svc.registry()
                            .unregister(&args.str(0)?, &args.str(1)?, args.port(2)?);
                    Ok(flag(removed))
                }
            },
        );

        let svc = self.clone();
        table.register(
            "clearName",
            &["name"],
            "Remove every registration of a name.",
            move |_, args| {
                let svc = svc.clone();
                async move { Ok(flag(svc.registry().clear_name(&args.str(0)?))) }
            },
        );

        let svc = self.clone();
        table.register(
            "clearAll",
            &[],
            "Remove every registration except the name service itself.",
            move |_, _| {
                let svc = svc.clone();
                async move {
                    svc.registry().clear_all();
                    Ok(flag(true))
                }
            },
        );

        let svc = self.clone();
        table.register("getNames", &[], "All registered names.", move |_, _| {
            let svc = svc.clone();
            async move { Ok(Value::from(svc.registry().names())) }
        });

        let svc = self.clone();
        table.register(
            "getNamesSorted",
            &[],
            "All registered names, sorted.",
            move |_, _| {
                let svc = svc.clone();
                async move { Ok(Value::from(svc.registry().names_sorted())) }
            },
        );

        let svc = self.clone();
        table.register(
            "getHosts",
            &["name"],
            "List of [host, port] pairs registered under a name.",
            move |_, args| {
                let svc = svc.clone();
                async move {
                    let hosts = svc.registry().hosts(&args.str(0)?);
                    Ok(Value::Array(
                        hosts
                            .into_iter()
                            .map(|hp| Value::Array(vec![Value::from(hp.host), Value::from(hp.port)]))
                            .collect(),
                    ))
                }
            },
        );

        let svc = self.clone();
        table.register(
            "getInfo",
            &["name"],
            "Full registration records of a name.",
            move |_, args| {
                let svc = svc.clone();
                async move { Ok(records(svc.registry().info(&args.str(0)?))) }
            },
        );

        let svc = self.clone();
        table.register(
            "getInfoHost",
            &["host"],
            "Registration records of every service on a host.",
            move |_, args| {
                let svc = svc.clone();
                async move { Ok(records(svc.registry().info_host(&args.str(0)?))) }
            },
        );

        let svc = self.clone();
        table.register(
            "getNamesHost",
            &["host"],
            "Names of the services running on a host.",
            move |_, args| {
                let svc = svc.clone();
                async move { Ok(Value::from(svc.registry().names_host(&args.str(0)?))) }
            },
        );

        let svc = self.clone();
        table.register(
            "purgeDead",
            &["name"],
            "Drop silent instances of a name. Returns the number dropped.",
            move |_, args| {
                let svc = svc.clone();
                async move { Ok(Value::from(svc.registry().purge_dead(&args.str(0)?).len())) }
            },
        );

        let svc = self.clone();
        table.register(
            "purgeAll",
            &[],
            "Drop every silent registration. Returns the number dropped.",
            move |_, _| {
                let svc = svc.clone();
                async move { Ok(Value::from(svc.registry().purge_all())) }
            },
        );

        table
    }

    /// Start serving the registry.
    ///
    /// The name service records its own advertised address, then purges
    /// silent registrations every `purge_interval` until the server stops.
    pub async fn serve(&self, config: ServerConfig) -> RemoraResult<Server> {
        let advertise = config
            .advertise_host
            .clone()
            .unwrap_or_else(|| config.host.clone());
        let secure = config.tls.is_some();

        let server = Server::new(config, self.methods());
        let addr = server.start().await?;
        self.registry().set_own_record(&advertise, addr.port(), secure);
        info!("Name service running on {}:{}", advertise, addr.port());

        if let Some(cancel) = server.shutdown_token().await {
            server
                .pool()
                .spawn_background(self.clone().purge_loop(cancel));
        }
        Ok(server)
    }

    async fn purge_loop(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.purge_interval) => {}
            }
            let purged = self.registry().purge_all();
            if purged > 0 {
                info!("Purged {} silent registration(s)", purged);
            } else {
                debug!("Purge pass found nothing to drop");
            }
        }
    }
}

#[async_trait]
impl NameDirectory for NameService {
    async fn register(
        &self,
        name: &str,
        addr: &HostPort,
        options: RegisterOptions,
    ) -> Result<(), CallError> {
        self.registry().register(name, &addr.host, addr.port, options);
        Ok(())
    }

    async fn ping(
        &self,
        name: &str,
        addr: &HostPort,
        options: RegisterOptions,
    ) -> Result<(), CallError> {
        self.registry()
            .ping(name, &addr.host, addr.port, options, None);
        Ok(())
    }

    async fn unregister(&self, name: &str, addr: &HostPort) -> Result<(), CallError> {
        self.registry().unregister(name, &addr.host, addr.port);
        Ok(())
    }

    async fn lookup(&self, name: &str) -> Result<Vec<ServiceRecord>, CallError> {
        Ok(self.registry().info(name))
    }
}

impl std::fmt::Debug for NameService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameService")
            .field("service", &NAME_SERVICE)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn invoke(svc: &NameService, method: &str, args: Vec<Value>) -> Value {
        svc.methods().invoke(method, args).await.unwrap()
    }

    #[tokio::test]
    async fn test_register_and_query_methods() {
        let svc = NameService::default();
        let options = RegisterOptions::secure(true).to_value();

        let first = invoke(
            &svc,
            "register",
            vec!["archiver".into(), "h1".into(), Value::Int(9001), options.clone()],
        )
        .await;
        assert_eq!(first, Value::Int(1));

        let again = invoke(
            &svc,
            "ping",
            vec!["archiver".into(), "h1".into(), Value::Int(9001), options, Value::Double(0.0)],
        )
        .await;
        assert_eq!(again, Value::Int(0));

        let hosts = invoke(&svc, "getHosts", vec!["archiver".into()]).await;
        assert_eq!(
            hosts,
            Value::Array(vec![Value::Array(vec!["h1".into(), Value::Int(9001)])])
        );

        let info = invoke(&svc, "getInfo", vec!["archiver".into()]).await;
        let record = ServiceRecord::from_value(&info.as_array().unwrap()[0]).unwrap();
        assert!(record.secure);

        let names = invoke(&svc, "getNamesHost", vec!["h1".into()]).await;
        assert_eq!(names.as_string_list().unwrap(), vec!["archiver"]);

        let removed = invoke(
            &svc,
            "unregister",
            vec!["archiver".into(), "h1".into(), Value::Int(9001)],
        )
        .await;
        assert_eq!(removed, Value::Int(1));
        assert_eq!(invoke(&svc, "getNames", vec![]).await, Value::Array(vec![]));
    }

    #[tokio::test]
    async fn test_bad_port_is_invalid_arguments() {
        let svc = NameService::default();
        let args = vec!["x".into(), "h".into(), Value::Int(-1)];
        let fault = svc.methods().invoke("register", args).await.unwrap_err();
        assert_eq!(fault.code, remora_core::Fault::INVALID_ARGUMENTS);
    }

    #[tokio::test]
    async fn test_in_process_directory() {
        let svc = NameService::default();
        let addr = HostPort::new("h1", 9001);
        svc.register("archiver", &addr, RegisterOptions::default())
            .await
            .unwrap();
        assert_eq!(svc.lookup("archiver").await.unwrap().len(), 1);

        NameDirectory::unregister(&svc, "archiver", &addr).await.unwrap();
        assert!(svc.lookup("archiver").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_serve_registers_itself() {
        let svc = NameService::default();
        let server = svc.serve(ServerConfig::new(NAME_SERVICE, "127.0.0.1", 0)).await.unwrap();
        let port = server.local_addr().await.unwrap().port();

        assert_eq!(svc.registry().hosts(NAME_SERVICE), vec![HostPort::new("127.0.0.1", port)]);
        svc.registry().clear_all();
        assert_eq!(svc.registry().names(), vec![NAME_SERVICE]);
        server.stop().await.unwrap();
    }
}
