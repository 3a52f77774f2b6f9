//! Configuration management for the remora CLI.

use anyhow::{bail, Context, Result};
use remora_pubsub::{PubSubConfig, Topology};
use remora_rpc::{NameServiceConfig, TlsConfig, NAME_SERVICE_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "remora.toml";

/// Contents of `remora.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub nameserver: NameServerSection,
    #[serde(default)]
    pub pubsub: PubSubSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG` and `--log-level`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// How CLI commands and daemons reach other services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Name service hosts, `"[user@]host[:port]"` separated by commas.
    #[serde(default = "default_ns_hosts")]
    pub nameservice: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// `"user:secret"` sent by `remora call`; defaults to the service name.
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServerSection {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_ns_port")]
    pub port: u16,
    #[serde(default = "default_purge_delta")]
    pub purge_delta_secs: u64,
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubSection {
    #[serde(default = "default_pubsub_name")]
    pub name: String,
    #[serde(default = "default_bind_host")]
    pub host: String,
    /// Address registered with the name service, if not `host`.
    #[serde(default)]
    pub advertise_host: Option<String>,
    /// Zero binds an ephemeral port.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_failure_limit")]
    pub failure_limit_secs: u64,
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub remote_timeout_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(flatten)]
    pub topology: Topology,
}

fn default_log_level() -> String { "info".to_string() }
fn default_ns_hosts() -> String { format!("localhost:{}", NAME_SERVICE_PORT) }
fn default_timeout_secs() -> u64 { 10 }
fn default_bind_host() -> String { "0.0.0.0".to_string() }
fn default_ns_port() -> u16 { NAME_SERVICE_PORT }
fn default_purge_delta() -> u64 { 30 }
fn default_purge_interval() -> u64 { 60 }
fn default_pubsub_name() -> String { "pubsub".to_string() }
fn default_failure_limit() -> u64 { 60 }
fn default_update_interval() -> u64 { 10 }
fn default_workers() -> usize { 20 }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            nameservice: default_ns_hosts(),
            timeout_secs: default_timeout_secs(),
            auth: None,
            tls: None,
        }
    }
}

impl Default for NameServerSection {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_ns_port(),
            purge_delta_secs: default_purge_delta(),
            purge_interval_secs: default_purge_interval(),
            tls: None,
        }
    }
}

impl Default for PubSubSection {
    fn default() -> Self {
        Self {
            name: default_pubsub_name(),
            host: default_bind_host(),
            advertise_host: None,
            port: 0,
            failure_limit_secs: default_failure_limit(),
            update_interval_secs: default_update_interval(),
            remote_timeout_secs: default_timeout_secs(),
            workers: default_workers(),
            topology: Topology::default(),
        }
    }
}

impl ClientSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl NameServerSection {
    pub fn service_config(&self) -> NameServiceConfig {
        NameServiceConfig {
            purge_delta: Duration::from_secs(self.purge_delta_secs),
            purge_interval: Duration::from_secs(self.purge_interval_secs),
        }
    }
}

impl PubSubSection {
    pub fn broker_config(&self) -> PubSubConfig {
        PubSubConfig {
            failure_limit: Duration::from_secs(self.failure_limit_secs),
            update_interval: Duration::from_secs(self.update_interval_secs),
            remote_timeout: Duration::from_secs(self.remote_timeout_secs),
            workers: self.workers,
            ..PubSubConfig::default()
        }
    }
}

impl Config {
    /// Load `explicit` if given, else the user's `remora/remora.toml`,
    /// else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                Self::from_file(path)
            }
            None => match user_config_file() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Config::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Default config as a TOML string.
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Config::default()).context("Failed to serialize config")
    }
}

/// `$XDG_CONFIG_HOME/remora/remora.toml` or the platform equivalent.
pub fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("remora").join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config = toml::from_str("[pubsub]\nname = \"ps-summit\"\n").unwrap();
        assert_eq!(config.pubsub.name, "ps-summit");
        assert_eq!(config.pubsub.failure_limit_secs, 60);
        assert_eq!(config.nameserver.port, NAME_SERVICE_PORT);
        assert_eq!(config.log.level, "info");
        assert!(config.pubsub.topology.is_empty());
    }

    #[test]
    fn test_load_topology_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[client]
nameservice = "ns1,ns2:7076"

[pubsub]
port = 7080
channels = ["TCS", "DOME"]

[[pubsub.aggregate]]
name = "ALL"
channels = ["TCS", "DOME"]

[[pubsub.remote]]
publisher = "pubsub-summit"
channels = ["STATUS"]
auth = "ps:secret"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.client.nameservice, "ns1,ns2:7076");
        assert_eq!(config.pubsub.port, 7080);
        let topology = &config.pubsub.topology;
        assert_eq!(topology.channels, vec!["TCS", "DOME"]);
        assert_eq!(topology.aggregate[0].name, "ALL");
        assert_eq!(topology.remote[0].auth.as_deref(), Some("ps:secret"));
        assert_eq!(
            config.pubsub.broker_config().failure_limit,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/remora.toml"))).is_err());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let text = Config::default_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.nameserver.purge_delta_secs, 30);
    }
}
