//! In-memory table of service registrations.
//!
//! Services register on start and ping periodically afterwards. Entries
//! not heard from within the purge delta are dropped by
//! [`NameRegistry::purge_all`], except the name service's own entry and
//! entries registered with `keep`.

use super::record::{now_secs, ServiceRecord};
use super::NAME_SERVICE;
use remora_core::{HostPort, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Default age after which a silent registration is purged.
pub const DEFAULT_PURGE_DELTA: Duration = Duration::from_secs(30);

/// Options accompanying a registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// The instance expects TLS.
    pub secure: bool,
    /// Never purge this entry for silence.
    pub keep: bool,
}

impl RegisterOptions {
    pub fn secure(secure: bool) -> Self {
        Self {
            secure,
            keep: false,
        }
    }

    pub fn to_value(self) -> Value {
        Value::from_pairs([("secure", self.secure), ("keep", self.keep)])
    }

    /// Decode from a struct; missing members default to `false`.
    pub fn from_value(value: &Value) -> Self {
        let flag = |key| value.get(key).and_then(Value::as_bool).unwrap_or(false);
        Self {
            secure: flag("secure"),
            keep: flag("keep"),
        }
    }
}

#[derive(Debug, Clone)]
struct RegisteredService {
    record: ServiceRecord,
    keep: bool,
}

/// Registry of live service instances keyed by name, then address.
#[derive(Debug)]
pub struct NameRegistry {
    services: BTreeMap<String, BTreeMap<HostPort, RegisteredService>>,
    purge_delta: Duration,
    own_record: Option<ServiceRecord>,
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NameRegistry {
    /// Create an empty registry with the default purge delta.
    pub fn new() -> Self {
        Self::with_purge_delta(DEFAULT_PURGE_DELTA)
    }

    /// Create a registry with a custom purge delta.
    pub fn with_purge_delta(purge_delta: Duration) -> Self {
        Self {
            services: BTreeMap::new(),
            purge_delta,
            own_record: None,
        }
    }

    pub fn purge_delta(&self) -> Duration {
        self.purge_delta
    }

    /// Record the name service's own registration.
    ///
    /// It is registered immediately and restored by [`clear_all`](Self::clear_all).
    pub fn set_own_record(&mut self, host: &str, port: u16, secure: bool) {
        let options = RegisterOptions {
            secure,
            keep: true,
        };
        self.register(NAME_SERVICE, host, port, options);
        self.own_record = Some(ServiceRecord::new(NAME_SERVICE, host, port, secure));
    }

    /// Register (or refresh) `name` at `host:port`.
    ///
    /// Returns `true` when the registration is new.
    pub fn register(&mut self, name: &str, host: &str, port: u16, options: RegisterOptions) -> bool {
        let addr = HostPort::new(host, port);
        let entry = RegisteredService {
            record: ServiceRecord::new(name, host, port, options.secure),
            keep: options.keep,
        };
        let is_new = self
            .services
            .entry(name.to_string())
            .or_default()
            .insert(addr.clone(), entry)
            .is_none();
        if is_new {
            info!("Registered service '{}' at {}", name, addr);
        }
        is_new
    }

    /// Keep-alive from a service; registers it if unknown.
    ///
    /// `host_time` is the sender's clock and only used to report skew.
    pub fn ping(
        &mut self,
        name: &str,
        host: &str,
        port: u16,
        options: RegisterOptions,
        host_time: Option<f64>,
    ) -> bool {
        if let Some(sent) = host_time {
            debug!(
                "Ping from '{}' ({}:{}) skew {:.4}s",
                name,
                host,
                port,
                now_secs() - sent
            );
        }
        self.register(name, host, port, options)
    }

    /// Remove one registration; returns whether it existed.
    pub fn unregister(&mut self, name: &str, host: &str, port: u16) -> bool {
        let addr = HostPort::new(host, port);
        let Some(hosts) = self.services.get_mut(name) else {
            return false;
        };
        let removed = hosts.remove(&addr).is_some();
        if hosts.is_empty() {
            self.services.remove(name);
        }
        if removed {
            info!("Unregistered service '{}' at {}", name, addr);
        }
        removed
    }

    /// Remove every registration of `name`.
    pub fn clear_name(&mut self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    /// Remove every registration, then restore the name service's own entry.
    pub fn clear_all(&mut self) {
        self.services.clear();
        if let Some(own) = self.own_record.clone() {
            self.register(
                &own.name,
                &own.host,
                own.port,
                RegisterOptions {
                    secure: own.secure,
                    keep: true,
                },
            );
        }
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Registered names, sorted without regard to case.
    pub fn names_sorted(&self) -> Vec<String> {
        let mut names = self.names();
        names.sort_by_key(|n| n.to_lowercase());
        names
    }

    /// Addresses registered under `name`.
    pub fn hosts(&self, name: &str) -> Vec<HostPort> {
        self.services
            .get(name)
            .map(|hosts| hosts.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Full records registered under `name`.
    pub fn info(&self, name: &str) -> Vec<ServiceRecord> {
        self.services
            .get(name)
            .map(|hosts| hosts.values().map(|s| s.record.clone()).collect())
            .unwrap_or_default()
    }

    /// Every record of any service running on `host`.
    pub fn info_host(&self, host: &str) -> Vec<ServiceRecord> {
        self.services
            .values()
            .flat_map(|hosts| hosts.values())
            .filter(|s| s.record.host == host)
            .map(|s| s.record.clone())
            .collect()
    }

    /// Names of services running on `host`.
    pub fn names_host(&self, host: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .info_host(host)
            .into_iter()
            .map(|record| record.name)
            .collect();
        names.dedup();
        names
    }

    /// Drop instances of `name` silent for longer than the purge delta.
    pub fn purge_dead(&mut self, name: &str) -> Vec<HostPort> {
        if name == NAME_SERVICE {
            return Vec::new();
        }
        let max_age = self.purge_delta.as_secs_f64();
        let Some(hosts) = self.services.get_mut(name) else {
            return Vec::new();
        };

        let dead: Vec<HostPort> = hosts
            .iter()
            .filter(|(_, s)| !s.keep && s.record.age() > max_age)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &dead {
            hosts.remove(addr);
            info!("Purged silent service '{}' at {}", name, addr);
        }
        if hosts.is_empty() {
            self.services.remove(name);
        }
        dead
    }

    /// Purge every name; returns the number of entries dropped.
    pub fn purge_all(&mut self) -> usize {
        self.names()
            .iter()
            .map(|name| self.purge_dead(name).len())
            .sum()
    }

    /// Backdate a registration's ping time.
    #[cfg(test)]
    pub(crate) fn age_entry(&mut self, name: &str, addr: &HostPort, secs: f64) {
        if let Some(entry) = self.services.get_mut(name).and_then(|h| h.get_mut(addr)) {
            entry.record.ping_time -= secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = NameRegistry::new();
        assert!(registry.register("archiver", "h1", 9001, RegisterOptions::default()));
        assert!(!registry.register("archiver", "h1", 9001, RegisterOptions::default()));
        registry.register("archiver", "h2", 9002, RegisterOptions::secure(true));
        registry.register("status", "h1", 9100, RegisterOptions::default());

        assert_eq!(registry.names(), vec!["archiver", "status"]);
        assert_eq!(registry.hosts("archiver").len(), 2);
        assert!(registry.info("archiver")[1].secure);
        assert_eq!(registry.names_host("h1"), vec!["archiver", "status"]);
        assert_eq!(registry.info_host("h2").len(), 1);
        assert!(registry.info("unknown").is_empty());
    }

    #[test]
    fn test_unregister_removes_empty_names() {
        let mut registry = NameRegistry::new();
        registry.register("archiver", "h1", 9001, RegisterOptions::default());

        assert!(registry.unregister("archiver", "h1", 9001));
        assert!(!registry.unregister("archiver", "h1", 9001));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_purge_skips_keep_and_self() {
        let mut registry = NameRegistry::with_purge_delta(Duration::from_secs(30));
        registry.set_own_record("gen2", 7075, false);
        registry.register("archiver", "h1", 9001, RegisterOptions::default());
        registry.register(
            "archiver",
            "h2",
            9002,
            RegisterOptions {
                secure: false,
                keep: true,
            },
        );
        registry.register("status", "h3", 9003, RegisterOptions::default());

        for addr in [HostPort::new("h1", 9001), HostPort::new("h2", 9002)] {
            registry.age_entry("archiver", &addr, 60.0);
        }
        registry.age_entry(NAME_SERVICE, &HostPort::new("gen2", 7075), 60.0);

        assert_eq!(registry.purge_all(), 1);
        assert_eq!(registry.hosts("archiver"), vec![HostPort::new("h2", 9002)]);
        assert_eq!(registry.hosts("status").len(), 1);
        assert_eq!(registry.hosts(NAME_SERVICE).len(), 1);
    }

    #[test]
    fn test_clear_all_restores_own_entry() {
        let mut registry = NameRegistry::new();
        registry.set_own_record("gen2", 7075, false);
        registry.register("archiver", "h1", 9001, RegisterOptions::default());

        registry.clear_all();
        assert_eq!(registry.names(), vec![NAME_SERVICE]);

        assert!(registry.clear_name(NAME_SERVICE));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_ping_registers_unknown_service() {
        let mut registry = NameRegistry::new();
        assert!(registry.ping("archiver", "h1", 9001, RegisterOptions::default(), Some(now_secs())));
        assert!(!registry.ping("archiver", "h1", 9001, RegisterOptions::default(), None));
    }
}
