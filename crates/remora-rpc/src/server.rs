//! Remote object server.
//!
//! A [`Server`] accepts connections (plain TCP or TLS), authenticates every
//! call against its [`AuthPolicy`], and dispatches by name through a
//! [`MethodTable`]. Handlers run on the [`WorkerPool`]; a handler that
//! panics produces a fault instead of taking the connection down.
//!
//! When a [`NameDirectory`] is attached the server registers itself on
//! start, keeps the registration alive with periodic pings, and
//! unregisters on stop.

use crate::log_control::LogControl;
use crate::methods::{Args, CallContext, MethodTable};
use crate::names::{NameDirectory, RegisterOptions};
use crate::pool::WorkerPool;
use crate::protocol::{CallRequest, RemoteObject};
use crate::tls::TlsConfig;
use crate::transport;
use remora_core::{Credentials, Fault, HostPort, RemoraError, RemoraResult, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tarpc::context::Context;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default interval between name service pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before answering a failed authentication.
pub const DEFAULT_AUTH_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Methods every server answers in addition to its own table.
const BUILTINS: &[(&str, &[&str], &str)] = &[
    ("ro_echo", &["arg"], "Return the argument unchanged; used as a liveness probe."),
    ("ro_list", &[], "List the methods this server allows."),
    ("ro_help", &["method"], "Describe one method: signature and documentation."),
    ("ro_help_all", &[], "Describe every allowed method."),
    ("ro_setLogLevel", &["level"], "Change the process log filter."),
    ("ro_workerStatus", &[], "Report worker pool usage."),
];

/// Lifecycle of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Who may call the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthPolicy {
    /// No credentials are checked.
    #[default]
    None,
    /// Only `(service name, service name)` is accepted.
    ServiceDefault,
    /// Explicit user to secret table.
    Table(HashMap<String, String>),
}

impl AuthPolicy {
    fn resolve(&self, service: &str) -> Option<HashMap<String, String>> {
        match self {
            AuthPolicy::None => None,
            AuthPolicy::ServiceDefault => {
                Some(HashMap::from([(service.to_string(), service.to_string())]))
            }
            AuthPolicy::Table(table) => Some(table.clone()),
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Logical service name registered with the name service.
    pub name: String,
    /// Address to bind.
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Host advertised to the name service; defaults to `host`.
    pub advertise_host: Option<String>,
    pub auth: AuthPolicy,
    pub auth_delay: Duration,
    /// Serve over TLS using this material.
    pub tls: Option<TlsConfig>,
    pub ping_interval: Duration,
    /// Fail `start` when name service registration fails.
    pub strict_registration: bool,
    /// Upper bound on how long the accept loop waits per poll.
    pub poll_interval: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "remora".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            advertise_host: None,
            auth: AuthPolicy::None,
            auth_delay: DEFAULT_AUTH_DELAY,
            tls: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            strict_registration: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Defaults for a named service bound to `host:port`.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }
}

struct DispatchInner {
    name: String,
    methods: MethodTable,
    auth: Option<HashMap<String, String>>,
    auth_delay: Duration,
    pool: WorkerPool,
    log_control: Option<Arc<dyn LogControl>>,
}

/// tarpc service implementation shared by all connections of a server.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<DispatchInner>,
    peer: Option<SocketAddr>,
}

impl Dispatcher {
    fn for_peer(&self, peer: SocketAddr) -> Self {
        Self {
            inner: self.inner.clone(),
            peer: Some(peer),
        }
    }

    async fn authenticate(&self, auth: Option<&Credentials>) -> Result<Option<String>, Fault> {
        let Some(table) = &self.inner.auth else {
            return Ok(auth.map(|c| c.user.clone()));
        };

        match auth {
            Some(creds) if table.get(&creds.user) == Some(&creds.secret) => {
                Ok(Some(creds.user.clone()))
            }
            Some(creds) => {
                warn!(
                    "Authentication failed for user '{}' from {:?}",
                    creds.user, self.peer
                );
                tokio::time::sleep(self.inner.auth_delay).await;
                Err(Fault::authentication(Some(creds.user.as_str())))
            }
            None => {
                warn!("Call without credentials from {:?}", self.peer);
                tokio::time::sleep(self.inner.auth_delay).await;
                Err(Fault::authentication(None))
            }
        }
    }

    fn allowed(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTINS.iter().map(|(n, _, _)| n.to_string()).collect();
        names.extend(self.inner.methods.names());
        names.sort();
        names.dedup();
        names
    }

    fn help(&self, method: &str) -> String {
        if let Some((name, params, doc)) = BUILTINS.iter().find(|(n, _, _)| *n == method) {
            return format!("{}({})\n{}", name, params.join(", "), doc);
        }
        self.inner
            .methods
            .get(method)
            .map(|m| m.help())
            .unwrap_or_default()
    }

    async fn dispatch(&self, ctx: CallContext, args: Args) -> Result<Value, Fault> {
        match ctx.method.as_str() {
            "ro_echo" => return Ok(args.optional(0).cloned().unwrap_or_default()),
            "ro_list" => return Ok(Value::from(self.allowed())),
            "ro_help" => return Ok(Value::from(self.help(&args.str(0)?))),
            "ro_help_all" => {
                let all: Vec<String> = self.allowed().iter().map(|m| self.help(m)).collect();
                return Ok(Value::from(all.join("\n===\n")));
            }
            "ro_setLogLevel" => {
                let level = args.str(0)?;
                let control = self
                    .inner
                    .log_control
                    .as_ref()
                    .ok_or_else(|| Fault::application("log level control is not configured"))?;
                control.set_level(&level).map_err(Fault::application)?;
                info!("Log level set to '{}'", level);
                return Ok(Value::Bool(true));
            }
            "ro_workerStatus" => return Ok(self.inner.pool.status().to_value()),
            _ => {}
        }

        let method = self
            .inner
            .methods
            .get(&ctx.method)
            .ok_or_else(|| Fault::unsupported_method(&ctx.method))?;
        let handler = method.handler();
        let name = ctx.method.clone();

        match self.inner.pool.spawn(handler(ctx, args)).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                let text = panic_text(join_error.into_panic());
                error!("Method '{}' of '{}' panicked: {}", name, self.inner.name, text);
                Err(
                    Fault::new(Fault::PANIC, format!("method '{}' panicked: {}", name, text))
                        .with_trace(format!(
                            "panic in handler '{}' of service '{}' (peer {:?}): {}",
                            name, self.inner.name, self.peer, text
                        )),
                )
            }
            Err(_) => Err(Fault::application(format!(
                "method '{}' was cancelled",
                name
            ))),
        }
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl RemoteObject for Dispatcher {
    #[instrument(skip(self, _ctx, request), fields(service = %self.inner.name, method = %request.method))]
    async fn invoke(self, _ctx: Context, request: CallRequest) -> Result<Value, Fault> {
        let user = self.authenticate(request.auth.as_ref()).await?;
        debug!("Dispatching with {} argument(s)", request.args.len());
        let ctx = CallContext {
            method: request.method,
            user,
            peer: self.peer,
        };
        self.dispatch(ctx, Args::new(request.args)).await
    }
}

struct RunHandle {
    cancel: CancellationToken,
    stopped: oneshot::Receiver<()>,
    local_addr: SocketAddr,
    registration: Option<HostPort>,
}

/// Remote object server.
///
/// # Example
///
/// ```rust,ignore
/// let mut methods = MethodTable::new();
/// methods.register("add", &["a", "b"], "Add two integers.", |_, args| async move {
///     Ok(Value::Int(args.i64(0)? + args.i64(1)?))
/// });
///
/// let server = Server::new(ServerConfig::new("adder", "127.0.0.1", 9001), methods)
///     .with_directory(names);
/// server.start().await?;
/// ```
pub struct Server {
    config: ServerConfig,
    methods: MethodTable,
    pool: WorkerPool,
    /// Whether `stop` drains the pool; a shared pool is drained by its owner.
    owns_pool: bool,
    directory: Option<Arc<dyn NameDirectory>>,
    log_control: Option<Arc<dyn LogControl>>,
    state: Arc<watch::Sender<ServerState>>,
    run: Mutex<Option<RunHandle>>,
}

impl Server {
    /// Create a stopped server.
    ///
    /// The server owns a default-sized pool unless one is supplied with
    /// [`with_pool`](Self::with_pool).
    ///
    /// # Arguments
    ///
    /// * `config` - Name, bind address, auth policy, TLS and timeouts
    /// * `methods` - Application methods; the `ro_*` built-ins are added
    pub fn new(config: ServerConfig, methods: MethodTable) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        let state = Arc::new(state);
        Self {
            config,
            methods,
            pool: WorkerPool::default(),
            owns_pool: true,
            directory: None,
            log_control: None,
            state,
            run: Mutex::new(None),
        }
    }

    /// Run connections and handlers on an externally owned pool.
    ///
    /// [`stop`](Self::stop) then leaves draining the pool to its owner.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self.owns_pool = false;
        self
    }

    /// Register with (and keep pinging) this directory.
    pub fn with_directory(mut self, directory: Arc<dyn NameDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_log_control(mut self, control: Arc<dyn LogControl>) -> Self {
        self.log_control = Some(control);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.run.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Token cancelled when the current run stops.
    pub async fn shutdown_token(&self) -> Option<CancellationToken> {
        self.run.lock().await.as_ref().map(|r| r.cancel.clone())
    }

    /// Bind, start accepting and register with the name service.
    ///
    /// Blocks until the accept loop confirms it is running or
    /// `start_timeout` elapses. Returns the bound address, which carries
    /// the real port when the configured port is 0.
    ///
    /// # Errors
    ///
    /// * [`RemoraError::InvalidState`] if the server is not stopped
    /// * I/O and TLS errors from binding or loading certificates
    /// * [`RemoraError::Timeout`] if the accept loop does not come up
    /// * [`RemoraError::Registration`] if registration fails and
    ///   `strict_registration` is set
    pub async fn start(&self) -> RemoraResult<SocketAddr> {
        let mut run = self.run.lock().await;
        let current = self.state();
        if run.is_some() || current != ServerState::Stopped {
            return Err(self.invalid_state(current, "start"));
        }
        self.state.send_replace(ServerState::Starting);

        match self.launch().await {
            Ok(handle) => {
                let addr = handle.local_addr;
                *run = Some(handle);
                Ok(addr)
            }
            Err(e) => {
                self.state.send_replace(ServerState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> RemoraResult<RunHandle> {
        let tls = self.config.tls.as_ref().map(TlsConfig::acceptor).transpose()?;
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;

        let dispatcher = Dispatcher {
            inner: Arc::new(DispatchInner {
                name: self.config.name.clone(),
                methods: self.methods.clone(),
                auth: self.config.auth.resolve(&self.config.name),
                auth_delay: self.config.auth_delay,
                pool: self.pool.clone(),
                log_control: self.log_control.clone(),
            }),
            peer: None,
        };

        let cancel = CancellationToken::new();
        let (started_tx, started_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();

        self.pool.spawn_background(accept_loop(AcceptLoop {
            name: self.config.name.clone(),
            listener,
            tls,
            dispatcher,
            pool: self.pool.clone(),
            cancel: cancel.clone(),
            poll_interval: self.config.poll_interval,
            state: self.state.clone(),
            started: started_tx,
            stopped: stopped_tx,
        }));

        if tokio::time::timeout(self.config.start_timeout, started_rx)
            .await
            .map_err(|_| ())
            .and_then(|r| r.map_err(|_| ()))
            .is_err()
        {
            cancel.cancel();
            return Err(RemoraError::Timeout(format!(
                "server '{}' to start",
                self.config.name
            )));
        }
        info!("Server '{}' listening on {}", self.config.name, local_addr);

        let registration = match &self.directory {
            Some(directory) => {
                let addr = HostPort::new(
                    self.config
                        .advertise_host
                        .clone()
                        .unwrap_or_else(|| self.config.host.clone()),
                    local_addr.port(),
                );
                let options = RegisterOptions::secure(self.config.tls.is_some());
                if let Err(e) = directory.register(&self.config.name, &addr, options).await {
                    if self.config.strict_registration {
                        cancel.cancel();
                        return Err(RemoraError::Registration {
                            name: self.config.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        "Could not register '{}' with the name service: {}",
                        self.config.name, e
                    );
                }
                self.pool.spawn_background(ping_loop(
                    directory.clone(),
                    self.config.name.clone(),
                    addr.clone(),
                    options,
                    self.config.ping_interval,
                    cancel.clone(),
                ));
                Some(addr)
            }
            None => None,
        };

        Ok(RunHandle {
            cancel,
            stopped: stopped_rx,
            local_addr,
            registration,
        })
    }

    /// Stop accepting, close connections and unregister.
    ///
    /// Handlers already running are allowed to finish (up to
    /// `stop_timeout`) when the server owns its pool. Stopping a stopped
    /// server is a no-op. Unregistration failures are ignored; the entry
    /// expires on its own.
    ///
    /// # Errors
    ///
    /// [`RemoraError::Timeout`] when the accept loop or the in-flight
    /// handlers do not finish within `stop_timeout`. The server is stopped
    /// either way.
    pub async fn stop(&self) -> RemoraResult<()> {
        let Some(handle) = self.run.lock().await.take() else {
            return Ok(());
        };
        self.state.send_replace(ServerState::Stopping);
        handle.cancel.cancel();

        let mut confirmed = tokio::time::timeout(self.config.stop_timeout, handle.stopped)
            .await
            .is_ok();
        if self.owns_pool {
            let drained = tokio::time::timeout(self.config.stop_timeout, self.pool.wait_idle())
                .await
                .is_ok();
            if !drained {
                warn!(
                    "Server '{}' stopped with {} handler(s) still running",
                    self.config.name,
                    self.pool.status().busy
                );
            }
            confirmed &= drained;
        }

        if let (Some(directory), Some(addr)) = (&self.directory, &handle.registration) {
            if let Err(e) = directory.unregister(&self.config.name, addr).await {
                debug!("Ignoring unregister failure for '{}': {}", self.config.name, e);
            }
        }

        self.state.send_replace(ServerState::Stopped);
        info!("Server '{}' stopped", self.config.name);

        if confirmed {
            Ok(())
        } else {
            Err(RemoraError::Timeout(format!(
                "server '{}' to stop",
                self.config.name
            )))
        }
    }

    fn invalid_state(&self, state: ServerState, action: &'static str) -> RemoraError {
        RemoraError::InvalidState {
            name: self.config.name.clone(),
            state: state.to_string(),
            action,
        }
    }
}

struct AcceptLoop {
    name: String,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    dispatcher: Dispatcher,
    pool: WorkerPool,
    cancel: CancellationToken,
    poll_interval: Duration,
    state: Arc<watch::Sender<ServerState>>,
    started: oneshot::Sender<()>,
    stopped: oneshot::Sender<()>,
}

async fn accept_loop(ctx: AcceptLoop) {
    let AcceptLoop {
        name,
        listener,
        tls,
        dispatcher,
        pool,
        cancel,
        poll_interval,
        state,
        started,
        stopped,
    } = ctx;

    state.send_replace(ServerState::Running);
    let _ = started.send(());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = tokio::time::timeout(poll_interval, listener.accept()) => {
                let (stream, peer) = match accepted {
                    Err(_) => continue,
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        warn!("Accept failed on '{}': {}", name, e);
                        continue;
                    }
                };
                debug!("Connection to '{}' from {}", name, peer);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Cannot set TCP_NODELAY for {}: {}", peer, e);
                }

                let service = dispatcher.for_peer(peer);
                let cancel = cancel.clone();
                match tls.clone() {
                    None => {
                        pool.spawn_background(transport::serve_connection(stream, service, cancel));
                    }
                    Some(acceptor) => {
                        pool.spawn_background(async move {
                            match acceptor.accept(stream).await {
                                Ok(stream) => transport::serve_connection(stream, service, cancel).await,
                                Err(e) => warn!("TLS handshake with {} failed: {}", peer, e),
                            }
                        });
                    }
                }
            }
        }
    }

    drop(listener);
    debug!("Accept loop of '{}' exited", name);
    let _ = stopped.send(());
}

async fn ping_loop(
    directory: Arc<dyn NameDirectory>,
    name: String,
    addr: HostPort,
    options: RegisterOptions,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match directory.ping(&name, &addr, options).await {
            Ok(()) => debug!("Pinged name service for '{}'", name),
            Err(e) => warn!("Name service ping for '{}' failed: {}", name, e),
        }
    }
}
