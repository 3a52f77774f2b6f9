//! Single-endpoint client.
//!
//! A [`Client`] is bound to one [`Endpoint`] for its whole life. It keeps a
//! lazily built tarpc connection that is discarded whenever a transport
//! error occurs, so the next call reconnects from scratch.

use crate::protocol::{CallRequest, RemoteObjectClient};
use crate::transport;
use remora_core::{CallError, CallResult, Endpoint, Value};
use std::time::Duration;
use tarpc::context;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Default connection timeout in milliseconds.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default maximum of in-flight requests per connection.
const DEFAULT_MAX_PENDING_REQUESTS: usize = 100;

/// Configuration for client connections.
#[derive(Clone)]
pub struct ClientConfig {
    /// Connection (and TLS handshake) timeout.
    pub connect_timeout: Duration,
    /// Maximum pending requests per connection.
    pub max_pending_requests: usize,
    /// Connector used for endpoints flagged secure.
    pub tls: Option<TlsConnector>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            tls: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("max_pending_requests", &self.max_pending_requests)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Caller bound to one endpoint.
///
/// The connection is opened on the first call and shared by concurrent
/// callers. Any transport failure drops it; the next call reconnects.
///
/// # Example
///
/// ```rust,ignore
/// use remora_core::{Endpoint, Value};
/// use remora_rpc::Client;
///
/// let client = Client::new(Endpoint::new("127.0.0.1", 9001));
/// let sum = client.call("add", vec![Value::Int(40), Value::Int(2)]).await?;
/// ```
pub struct Client {
    endpoint: Endpoint,
    config: ClientConfig,
    connection: Mutex<Option<RemoteObjectClient>>,
}

impl Client {
    /// Create a client with default connection settings.
    ///
    /// No connection is made until the first call.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Address, credentials, TLS flag and call timeout
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_config(endpoint, ClientConfig::default())
    }

    /// Create a client with custom connection settings.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Address, credentials, TLS flag and call timeout
    /// * `config` - Connect timeout, request limit and TLS connector
    pub fn with_config(endpoint: Endpoint, config: ClientConfig) -> Self {
        Self {
            endpoint,
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Execute one round trip.
    ///
    /// # Arguments
    ///
    /// * `method` - Remote method name
    /// * `args` - Positional arguments
    ///
    /// # Errors
    ///
    /// Transport failures, including the endpoint's call timeout, come back
    /// as [`CallError::Transport`] (retryable) and drop the connection. A
    /// fault answered by the server comes back as [`CallError::Fault`]
    /// (fatal) and keeps it.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// match client.call("status", vec![]).await {
    ///     Ok(value) => println!("{}", value),
    ///     Err(e) if e.is_retryable() => println!("try another instance: {}", e),
    ///     Err(e) => return Err(e.into()),
    /// }
    /// ```
    pub async fn call(&self, method: &str, args: Vec<Value>) -> CallResult {
        let client = self.connection().await?;
        let request = CallRequest::new(method, args).with_auth(self.endpoint.auth().cloned());
        let addr = self.endpoint.addr();

        debug!("Calling {} on {}", method, addr);
        let response = tokio::time::timeout(
            self.endpoint.timeout(),
            client.invoke(context::current(), request),
        )
        .await;

        match response {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(fault))) => {
                debug!("{} on {} raised {}", method, addr, fault);
                Err(CallError::Fault {
                    endpoint: addr.clone(),
                    fault,
                })
            }
            Ok(Err(rpc_error)) => {
                warn!("RPC to {} failed: {}", addr, rpc_error);
                self.reset().await;
                Err(CallError::transport(addr, rpc_error))
            }
            Err(_) => {
                warn!("Call to {} timed out after {:?}", addr, self.endpoint.timeout());
                self.reset().await;
                Err(CallError::transport(addr, "call timeout"))
            }
        }
    }

    /// Liveness probe via `ro_echo`.
    ///
    /// # Errors
    ///
    /// Same classification as [`call`](Self::call).
    pub async fn echo(&self, value: Value) -> CallResult {
        self.call("ro_echo", vec![value]).await
    }

    /// Drop the cached connection; the next call reconnects.
    pub async fn reset(&self) {
        self.connection.lock().await.take();
    }

    async fn connection(&self) -> Result<RemoteObjectClient, CallError> {
        let mut guard = self.connection.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let client = transport::connect(
            &self.endpoint,
            self.config.connect_timeout,
            self.config.max_pending_requests,
            self.config.tls.as_ref(),
        )
        .await
        .map_err(|reason| {
            debug!("Cannot connect to {}: {}", self.endpoint, reason);
            CallError::transport(self.endpoint.addr(), reason)
        })?;

        debug!("Connected to {}", self.endpoint);
        *guard = Some(client.clone());
        Ok(client)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
