//! # Remora RPC
//!
//! The remote object system: name-service-backed endpoint discovery,
//! service packs with failover and round-robin selection, and an
//! authenticated tarpc server with introspection.
//!
//! # Architecture
//!
//! - **Protocol**: a single `invoke(method, args, auth)` tarpc service
//! - **Client**: one endpoint, lazy connection, OK / RETRYABLE / FATAL outcomes
//! - **ServicePack**: a keyed set of clients with call strategies
//! - **Names**: the name service registry, its RPC surface and directory clients
//! - **RemoteObjectProxy**: resolves a logical name and fails over transparently
//! - **Server**: accept loop, authentication, method table dispatch
//!
//! # Example: calling a named service
//!
//! ```rust,ignore
//! use remora_rpc::{NameServiceClient, RemoteObjectProxy};
//!
//! let names = Arc::new(NameServiceClient::from_hosts("gen2")?);
//! let archiver = RemoteObjectProxy::new("archiver", names);
//! let answer = archiver.call("ro_echo", vec![42.into()]).await?;
//! ```

pub mod client;
pub mod log_control;
pub mod methods;
pub mod names;
pub mod pack;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod tls;
mod transport;

pub use client::{Client, ClientConfig};
pub use log_control::LogControl;
pub use methods::{Args, CallContext, Method, MethodTable};
pub use names::{
    NameDirectory, NameRegistry, NameService, NameServiceClient, NameServiceConfig,
    RegisterOptions, ServiceRecord, NAME_SERVICE, NAME_SERVICE_PORT,
};
pub use pack::{EndpointTemplate, ServicePack, Strategy};
pub use pool::{PoolStatus, WorkerPool};
pub use protocol::{CallRequest, RemoteObject, RemoteObjectClient};
pub use proxy::RemoteObjectProxy;
pub use server::{AuthPolicy, Server, ServerConfig, ServerState};
pub use tls::TlsConfig;
