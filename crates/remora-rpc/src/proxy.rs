//! Proxies for logical service names.

use crate::client::ClientConfig;
use crate::names::NameDirectory;
use crate::pack::{EndpointTemplate, ServicePack};
use remora_core::{CallError, CallResult, Credentials, HostPort, RemoraResult, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Calls a service by name, resolving instances through a directory.
///
/// The first call resolves the name. When the current instance fails
/// with a retryable error the cached resolution is dropped, the name is
/// resolved again and the call fails over across the fresh instance list.
pub struct RemoteObjectProxy {
    name: String,
    directory: Arc<dyn NameDirectory>,
    pack: ServicePack,
    template: EndpointTemplate,
    resolved: AtomicBool,
}

impl RemoteObjectProxy {
    /// Proxy for `name` using the service's default credentials.
    pub fn new(name: impl Into<String>, directory: Arc<dyn NameDirectory>) -> Self {
        Self::with_config(name, directory, ClientConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        directory: Arc<dyn NameDirectory>,
        config: ClientConfig,
    ) -> Self {
        let name = name.into();
        let template = EndpointTemplate {
            auth: Some(Credentials::for_service(&name)),
            ..EndpointTemplate::default()
        };
        Self {
            pack: ServicePack::with_config(name.clone(), config),
            name,
            directory,
            template,
            resolved: AtomicBool::new(false),
        }
    }

    /// Replace the credentials; `None` sends none.
    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.template.auth = auth;
        self
    }

    /// Credentials from a `"user:secret"` string.
    pub fn with_auth_str(self, auth: &str) -> RemoraResult<Self> {
        Ok(self.with_auth(Some(Credentials::parse(auth)?)))
    }

    /// Force TLS on or off regardless of what instances advertise.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.template.secure = Some(secure);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.template.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently known instances.
    pub async fn hosts(&self) -> Vec<HostPort> {
        self.pack.hosts().await
    }

    /// Forget the resolution; the next call resolves again.
    pub fn reset(&self) {
        self.resolved.store(false, Ordering::SeqCst);
        self.directory.invalidate(&self.name);
    }

    /// Look the name up and rebuild the pack.
    ///
    /// A name service outage stays retryable; only a name nobody answers
    /// for is a resolution error.
    async fn resolve(&self) -> Result<(), CallError> {
        let records = self.directory.lookup(&self.name).await.map_err(|e| {
            if e.is_retryable() {
                e
            } else {
                CallError::Resolution {
                    service: self.name.clone(),
                    reason: e.to_string(),
                }
            }
        })?;
        if records.is_empty() {
            return Err(CallError::Resolution {
                service: self.name.clone(),
                reason: "no registered instances".to_string(),
            });
        }

        self.pack.sync_from(&records, &self.template, true).await;
        self.pack.reset_cursor().await;
        self.resolved.store(true, Ordering::SeqCst);
        debug!("Proxy '{}' resolved to {:?}", self.name, self.pack.hosts().await);
        Ok(())
    }

    async fn ensure_resolved(&self) -> Result<(), CallError> {
        if self.resolved.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.resolve().await
    }

    /// Call `method` on the service.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> CallResult {
        self.ensure_resolved().await?;
        let Some(client) = self.pack.current_client().await else {
            return Err(CallError::EmptyPack {
                service: self.name.clone(),
            });
        };

        match client.call(method, args.clone()).await {
            Err(err) if err.is_retryable() => {
                warn!(
                    "Service '{}' at {} unavailable, re-resolving: {}",
                    self.name,
                    client.endpoint().addr(),
                    err
                );
                self.reset();
                self.resolve().await?;
                self.pack.call_failover(method, args).await
            }
            other => other,
        }
    }

    /// Call `method` on every instance.
    pub async fn call_all(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<BTreeMap<HostPort, CallResult>, CallError> {
        self.ensure_resolved().await?;
        Ok(self.pack.call_all(method, args).await)
    }
}

impl std::fmt::Debug for RemoteObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObjectProxy")
            .field("name", &self.name)
            .field("resolved", &self.resolved.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::{NameService, NameServiceClient, RegisterOptions};
    use remora_core::{Endpoint, Outcome};

    #[tokio::test]
    async fn test_unknown_name_is_resolution_error() {
        let names = Arc::new(NameService::default());
        let proxy = RemoteObjectProxy::new("ghost", names);

        let err = proxy.call("ro_echo", vec![]).await.unwrap_err();
        assert!(matches!(err, CallError::Resolution { .. }));
        assert_eq!(err.outcome(), Outcome::Fatal);
    }

    #[tokio::test]
    async fn test_name_service_outage_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let names = Arc::new(NameServiceClient::new(vec![Endpoint::new("127.0.0.1", port)]));
        let proxy = RemoteObjectProxy::new("archiver", names);

        let err = proxy.call("ro_echo", vec![]).await.unwrap_err();
        assert!(!matches!(err, CallError::Resolution { .. }));
        assert_eq!(err.outcome(), Outcome::Retryable);
        assert!(!proxy.resolved.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_reresolve_leaves_proxy_unresolved() {
        let names = Arc::new(NameService::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        names
            .registry()
            .register("archiver", "127.0.0.1", port, RegisterOptions::default());

        let proxy = RemoteObjectProxy::new("archiver", names.clone()).with_auth(None);
        proxy.ensure_resolved().await.unwrap();
        names.registry().clear_all();

        let err = proxy.call("ro_echo", vec![]).await.unwrap_err();
        assert!(matches!(err, CallError::Resolution { .. }));
        assert!(!proxy.resolved.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dead_instances_exhaust_after_reresolve() {
        let names = Arc::new(NameService::default());
        for _ in 0..2 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);
            names
                .registry()
                .register("archiver", "127.0.0.1", port, RegisterOptions::default());
        }

        let proxy = RemoteObjectProxy::new("archiver", names).with_auth(None);
        let err = proxy.call("ro_echo", vec![]).await.unwrap_err();
        assert!(matches!(err, CallError::Exhausted { attempts: 2, .. }));
        assert_eq!(proxy.hosts().await.len(), 2);
    }

    #[test]
    fn test_auth_string() {
        let names = Arc::new(NameService::default());
        assert!(RemoteObjectProxy::new("x", names.clone())
            .with_auth_str("user:pw")
            .is_ok());
        assert!(RemoteObjectProxy::new("x", names).with_auth_str("nocolon").is_err());
    }
}
