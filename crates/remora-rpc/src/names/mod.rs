//! Name service: where logical service names are resolved to endpoints.

mod directory;
mod record;
mod registry;
mod service;

pub use directory::{NameServiceClient, DEFAULT_CACHE_TTL};
pub use record::{now_secs, ServiceRecord};
pub use registry::{NameRegistry, RegisterOptions, DEFAULT_PURGE_DELTA};
pub use service::{NameService, NameServiceConfig, DEFAULT_PURGE_INTERVAL};

use async_trait::async_trait;
use remora_core::{CallError, HostPort};

/// Name under which the name service registers itself.
pub const NAME_SERVICE: &str = "names";

/// Default name service port.
pub const NAME_SERVICE_PORT: u16 = 7075;

/// Source of service registrations.
///
/// Servers use it to announce themselves, proxies to resolve names.
#[async_trait]
pub trait NameDirectory: Send + Sync {
    async fn register(
        &self,
        name: &str,
        addr: &HostPort,
        options: RegisterOptions,
    ) -> Result<(), CallError>;

    /// Keep-alive for an existing registration.
    async fn ping(
        &self,
        name: &str,
        addr: &HostPort,
        options: RegisterOptions,
    ) -> Result<(), CallError>;

    async fn unregister(&self, name: &str, addr: &HostPort) -> Result<(), CallError>;

    /// Every live registration of `name`; empty when unknown.
    async fn lookup(&self, name: &str) -> Result<Vec<ServiceRecord>, CallError>;

    /// Forget anything cached about `name`.
    fn invalidate(&self, _name: &str) {}
}
