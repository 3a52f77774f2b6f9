//! Service packs: all known endpoints of one logical service.
//!
//! A [`ServicePack`] owns one [`Client`] per `(host, port)` and a selection
//! cursor. Membership changes and cursor moves happen under a single
//! pack-wide lock; the lock is never held while a call is in flight.

use crate::client::{Client, ClientConfig};
use crate::names::ServiceRecord;
use futures::future::join_all;
use remora_core::{CallError, CallResult, Credentials, Endpoint, HostPort, Value, DEFAULT_CALL_TIMEOUT};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How a pack picks the client for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Stick with the current client; move on only after a retryable error.
    #[default]
    Failover,
    /// Move the cursor after every call, successful or not.
    RoundRobin,
}

/// Settings applied to endpoints created from name service records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTemplate {
    pub auth: Option<Credentials>,
    /// Overrides the secure flag advertised by the registration.
    pub secure: Option<bool>,
    pub timeout: Duration,
}

impl Default for EndpointTemplate {
    fn default() -> Self {
        Self {
            auth: None,
            secure: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl EndpointTemplate {
    /// Build the endpoint for one registration.
    pub fn endpoint_for(&self, record: &ServiceRecord) -> Endpoint {
        Endpoint::new(record.host.clone(), record.port)
            .with_auth(self.auth.clone())
            .with_secure(self.secure.unwrap_or(record.secure))
            .with_timeout(self.timeout)
    }
}

#[derive(Default)]
struct PackState {
    clients: BTreeMap<HostPort, Arc<Client>>,
    cursor: usize,
}

impl PackState {
    fn client_at_cursor(&self) -> Option<(usize, Arc<Client>)> {
        let len = self.clients.len();
        if len == 0 {
            return None;
        }
        let idx = self.cursor % len;
        self.clients.values().nth(idx).map(|c| (idx, c.clone()))
    }
}

/// Unordered collection of clients serving one logical name.
///
/// Members are kept in address order; a cursor marks the client the next
/// failover or round-robin call starts from.
///
/// # Example
///
/// ```rust,ignore
/// use remora_core::Endpoint;
/// use remora_rpc::{ClientConfig, ServicePack, Strategy};
///
/// let pack = ServicePack::from_endpoints(
///     "archiver",
///     ClientConfig::default(),
///     vec![Endpoint::new("10.0.0.1", 9001), Endpoint::new("10.0.0.2", 9001)],
/// );
/// let value = pack.call(Strategy::Failover, "status", vec![]).await?;
/// ```
pub struct ServicePack {
    name: String,
    config: ClientConfig,
    state: Mutex<PackState>,
}

impl ServicePack {
    /// Create an empty pack.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, ClientConfig::default())
    }

    /// Create an empty pack whose clients use `config`.
    pub fn with_config(name: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(PackState::default()),
        }
    }

    /// Create a pack already holding a client per endpoint.
    ///
    /// # Arguments
    ///
    /// * `name` - Logical service name, used in errors and logs
    /// * `config` - Connection settings shared by every client
    /// * `endpoints` - Initial members; duplicates collapse to one client
    pub fn from_endpoints(
        name: impl Into<String>,
        config: ClientConfig,
        endpoints: impl IntoIterator<Item = Endpoint>,
    ) -> Self {
        let clients = endpoints
            .into_iter()
            .map(|endpoint| {
                let key = endpoint.addr().clone();
                (key, Arc::new(Client::with_config(endpoint, config.clone())))
            })
            .collect();
        Self {
            name: name.into(),
            config,
            state: Mutex::new(PackState { clients, cursor: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a client for `endpoint`.
    ///
    /// An existing client for the same address is kept unless `replace`
    /// is set.
    pub async fn add_host(&self, endpoint: Endpoint, replace: bool) {
        let key = endpoint.addr().clone();
        let mut state = self.state.lock().await;
        if state.clients.contains_key(&key) && !replace {
            return;
        }
        debug!("Adding {} to service pack '{}'", key, self.name);
        let client = Arc::new(Client::with_config(endpoint, self.config.clone()));
        state.clients.insert(key, client);
    }

    /// Remove the client for `addr`; returns whether one was present.
    pub async fn del_host(&self, addr: &HostPort) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.clients.remove(addr).is_some();
        if removed {
            debug!("Removed {} from service pack '{}'", addr, self.name);
        }
        removed
    }

    /// Make membership match a name service answer.
    ///
    /// New registrations get a client built from `template`. With
    /// `delete_orphans`, clients whose address is not in `records` are
    /// dropped. Existing clients keep their connection.
    pub async fn sync_from(
        &self,
        records: &[ServiceRecord],
        template: &EndpointTemplate,
        delete_orphans: bool,
    ) {
        let wanted: BTreeSet<HostPort> = records.iter().map(ServiceRecord::addr).collect();

        let mut state = self.state.lock().await;
        for record in records {
            let key = record.addr();
            if !state.clients.contains_key(&key) {
                debug!("Adding {} to service pack '{}'", key, self.name);
                let client = Client::with_config(template.endpoint_for(record), self.config.clone());
                state.clients.insert(key, Arc::new(client));
            }
        }

        if delete_orphans {
            let before = state.clients.len();
            state.clients.retain(|key, _| wanted.contains(key));
            let dropped = before - state.clients.len();
            if dropped > 0 {
                info!(
                    "Dropped {} stale endpoint(s) from service pack '{}'",
                    dropped, self.name
                );
            }
        }
    }

    /// Snapshot of the clients in address order.
    pub async fn clients(&self) -> Vec<Arc<Client>> {
        self.state.lock().await.clients.values().cloned().collect()
    }

    /// Addresses of all members.
    pub async fn hosts(&self) -> Vec<HostPort> {
        self.state.lock().await.clients.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Point the cursor back at the first client.
    pub async fn reset_cursor(&self) {
        self.state.lock().await.cursor = 0;
    }

    /// Address of the client the cursor points at.
    pub async fn current(&self) -> Option<HostPort> {
        self.state
            .lock()
            .await
            .client_at_cursor()
            .map(|(_, c)| c.endpoint().addr().clone())
    }

    /// The client the cursor points at.
    pub async fn current_client(&self) -> Option<Arc<Client>> {
        self.state.lock().await.client_at_cursor().map(|(_, c)| c)
    }

    /// Call using `strategy`.
    ///
    /// # Errors
    ///
    /// [`CallError::EmptyPack`] when there are no members, a fatal error
    /// from the first client that raised one, or [`CallError::Exhausted`]
    /// when every member failed with a retryable error.
    pub async fn call(&self, strategy: Strategy, method: &str, args: Vec<Value>) -> CallResult {
        match strategy {
            Strategy::Failover => self.call_failover(method, args).await,
            Strategy::RoundRobin => self.call_round_robin(method, args).await,
        }
    }

    /// Call the current client, advancing on retryable errors.
    ///
    /// Each client is tried at most once. A fatal error stops the loop at
    /// once. If every client fails with a retryable error a single
    /// [`CallError::Exhausted`] carrying the last error is returned.
    pub async fn call_failover(&self, method: &str, args: Vec<Value>) -> CallResult {
        self.call_with(method, args, false).await
    }

    /// Like [`call_failover`](Self::call_failover) but the cursor moves
    /// after every call, spreading load across the pack.
    pub async fn call_round_robin(&self, method: &str, args: Vec<Value>) -> CallResult {
        self.call_with(method, args, true).await
    }

    async fn call_with(&self, method: &str, args: Vec<Value>, always_advance: bool) -> CallResult {
        let attempts = self.len().await;
        if attempts == 0 {
            return Err(CallError::EmptyPack {
                service: self.name.clone(),
            });
        }

        let mut last_error = None;
        for _ in 0..attempts {
            let (idx, client) = {
                let mut state = self.state.lock().await;
                let Some((idx, client)) = state.client_at_cursor() else {
                    break;
                };
                if always_advance {
                    state.cursor = idx + 1;
                }
                (idx, client)
            };

            match client.call(method, args.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    warn!(
                        "Service '{}' at {} failed, trying next: {}",
                        self.name,
                        client.endpoint().addr(),
                        err
                    );
                    if !always_advance {
                        let mut state = self.state.lock().await;
                        if state.cursor % state.clients.len().max(1) == idx {
                            state.cursor = idx + 1;
                        }
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let last = last_error.unwrap_or_else(|| CallError::EmptyPack {
            service: self.name.clone(),
        });
        Err(CallError::Exhausted {
            service: self.name.clone(),
            attempts,
            last: Box::new(last),
        })
    }

    /// Call every client concurrently and collect each result.
    ///
    /// Individual failures never abort the broadcast; each shows up under
    /// its address in the returned map. An empty pack yields an empty map.
    pub async fn call_all(&self, method: &str, args: Vec<Value>) -> BTreeMap<HostPort, CallResult> {
        let clients = self.clients().await;
        let calls = clients.iter().map(|client| {
            let args = args.clone();
            async move {
                let result = client.call(method, args).await;
                (client.endpoint().addr().clone(), result)
            }
        });
        join_all(calls).await.into_iter().collect()
    }

    /// First client answering an `ro_echo` probe.
    pub async fn choose_client(&self) -> Option<Arc<Client>> {
        for client in self.clients().await {
            if client.echo(Value::Nil).await.is_ok() {
                return Some(client);
            }
        }
        None
    }

    /// Clients that do not answer an `ro_echo` probe.
    pub async fn losers(&self) -> Vec<HostPort> {
        let results = self.call_all("ro_echo", vec![Value::Nil]).await;
        results
            .into_iter()
            .filter(|(_, result)| result.is_err())
            .map(|(addr, _)| addr)
            .collect()
    }

    /// Drop every client that does not answer a probe; returns what was dropped.
    pub async fn purge(&self) -> Vec<HostPort> {
        let losers = self.losers().await;
        for addr in &losers {
            self.del_host(addr).await;
        }
        losers
    }
}

impl std::fmt::Debug for ServicePack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePack").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host: &str, port: u16) -> ServiceRecord {
        ServiceRecord::new("archiver", host, port, false)
    }

    #[tokio::test]
    async fn test_sync_from_deletes_orphans() {
        let pack = ServicePack::new("archiver");
        pack.add_host(Endpoint::new("h1", 9001), false).await;
        pack.add_host(Endpoint::new("h2", 9002), false).await;

        let template = EndpointTemplate::default();
        pack.sync_from(&[record("h2", 9002), record("h3", 9003)], &template, true)
            .await;

        assert_eq!(
            pack.hosts().await,
            vec![HostPort::new("h2", 9002), HostPort::new("h3", 9003)]
        );

        pack.sync_from(&[record("h4", 9004)], &template, false).await;
        assert_eq!(pack.len().await, 3);
    }

    #[tokio::test]
    async fn test_add_host_replace_flag() {
        let pack = ServicePack::new("archiver");
        pack.add_host(Endpoint::new("h1", 9001), false).await;
        pack.add_host(Endpoint::new("h1", 9001).with_secure(true), false)
            .await;
        assert!(!pack.clients().await[0].endpoint().is_secure());

        pack.add_host(Endpoint::new("h1", 9001).with_secure(true), true)
            .await;
        assert!(pack.clients().await[0].endpoint().is_secure());
        assert_eq!(pack.len().await, 1);

        assert!(pack.del_host(&HostPort::new("h1", 9001)).await);
        assert!(!pack.del_host(&HostPort::new("h1", 9001)).await);
        assert!(pack.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_pack_is_fatal() {
        let pack = ServicePack::new("nobody");
        let err = pack.call_failover("ro_echo", vec![]).await.unwrap_err();
        assert!(matches!(err, CallError::EmptyPack { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_template_overrides_secure_flag() {
        let rec = ServiceRecord::new("archiver", "h1", 9001, true);
        let plain = EndpointTemplate {
            secure: Some(false),
            ..EndpointTemplate::default()
        };
        assert!(!plain.endpoint_for(&rec).is_secure());
        assert!(EndpointTemplate::default().endpoint_for(&rec).is_secure());
    }
}
