//! Remote name service client.

use super::{
    now_secs, NameDirectory, RegisterOptions, ServiceRecord, NAME_SERVICE, NAME_SERVICE_PORT,
};
use crate::client::ClientConfig;
use crate::pack::ServicePack;
use async_trait::async_trait;
use remora_core::{
    split_host, CallError, CallResult, Credentials, Endpoint, HostPort, RemoraError, RemoraResult,
    Value,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a lookup answer is reused.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Talks to one or more name servers with failover between them.
///
/// Lookups are cached briefly; the cache is dropped whenever a name server
/// fails over and per name on [`invalidate`](NameDirectory::invalidate).
pub struct NameServiceClient {
    pack: ServicePack,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, Vec<ServiceRecord>)>>,
}

impl NameServiceClient {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self::with_config(endpoints, ClientConfig::default())
    }

    pub fn with_config(endpoints: Vec<Endpoint>, config: ClientConfig) -> Self {
        Self {
            pack: ServicePack::from_endpoints(NAME_SERVICE, config, endpoints),
            ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a comma separated `"[user@]host[:port]"` list.
    ///
    /// Missing ports default to the name service port. Without a user the
    /// name service's default credentials are sent.
    pub fn from_hosts(spec: &str) -> RemoraResult<Self> {
        Ok(Self::new(Self::parse_hosts(spec)?))
    }

    pub(crate) fn parse_hosts(spec: &str) -> RemoraResult<Vec<Endpoint>> {
        let endpoints = spec
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let (user, addr) = split_host(part, NAME_SERVICE_PORT)?;
                let auth = match user {
                    Some(user) => Credentials::new(user.clone(), user),
                    None => Credentials::for_service(NAME_SERVICE),
                };
                Ok(Endpoint::from_addr(addr).with_auth(Some(auth)))
            })
            .collect::<RemoraResult<Vec<_>>>()?;

        if endpoints.is_empty() {
            return Err(RemoraError::InvalidAddress(spec.to_string()));
        }
        Ok(endpoints)
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Name server addresses in failover order.
    pub async fn hosts(&self) -> Vec<HostPort> {
        self.pack.hosts().await
    }

    /// Call a name service method with failover.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> CallResult {
        let result = self.pack.call_failover(method, args).await;
        if matches!(&result, Err(e) if e.is_retryable()) {
            self.clear_cache();
        }
        result
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Result<Vec<String>, CallError> {
        let value = self.call("getNamesSorted", vec![]).await?;
        Ok(value.as_string_list().unwrap_or_default())
    }

    /// Records of `name`, bypassing the cache.
    pub async fn info(&self, name: &str) -> Result<Vec<ServiceRecord>, CallError> {
        let value = self.call("getInfo", vec![Value::from(name)]).await?;
        Ok(decode_records(&value))
    }

    /// Records of every registered service.
    pub async fn all_info(&self) -> Result<Vec<ServiceRecord>, CallError> {
        let mut all = Vec::new();
        for name in self.names().await? {
            all.extend(self.info(&name).await?);
        }
        Ok(all)
    }

    fn cached(&self, name: &str) -> Option<Vec<ServiceRecord>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(name)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, records)| records.clone())
    }

    fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    async fn send(
        &self,
        method: &str,
        name: &str,
        addr: &HostPort,
        extra: Vec<Value>,
    ) -> Result<(), CallError> {
        let mut args = vec![
            Value::from(name),
            Value::from(addr.host.as_str()),
            Value::from(addr.port),
        ];
        args.extend(extra);
        self.call(method, args).await.map(|_| ())
    }
}

fn decode_records(value: &Value) -> Vec<ServiceRecord> {
    value
        .as_array()
        .unwrap_or_default()
        .iter()
        .filter_map(ServiceRecord::from_value)
        .collect()
}

#[async_trait]
impl NameDirectory for NameServiceClient {
    async fn register(
        &self,
        name: &str,
        addr: &HostPort,
        options: RegisterOptions,
    ) -> Result<(), CallError> {
        self.send("register", name, addr, vec![options.to_value()])
            .await
    }

    async fn ping(
        &self,
        name: &str,
        addr: &HostPort,
        options: RegisterOptions,
    ) -> Result<(), CallError> {
        self.send(
            "ping",
            name,
            addr,
            vec![options.to_value(), Value::Double(now_secs())],
        )
        .await
    }

    async fn unregister(&self, name: &str, addr: &HostPort) -> Result<(), CallError> {
        self.send("unregister", name, addr, vec![]).await
    }

    async fn lookup(&self, name: &str) -> Result<Vec<ServiceRecord>, CallError> {
        if let Some(records) = self.cached(name) {
            return Ok(records);
        }
        let records = self.info(name).await?;
        debug!("Resolved '{}' to {} instance(s)", name, records.len());
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), (Instant::now(), records.clone()));
        Ok(records)
    }

    fn invalidate(&self, name: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

impl std::fmt::Debug for NameServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameServiceClient")
            .field("ttl", &self.ttl)
            .finish()
    }
}
