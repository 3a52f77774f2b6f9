//! Addressing a single service instance.
//!
//! An [`Endpoint`] is the immutable description a client is bound to:
//! where the service lives, which credentials to present, whether the
//! connection is wrapped in TLS, and how long a single call may take.

use crate::error::RemoraError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Host and port of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort {
    /// Host address (IP or hostname).
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = RemoraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RemoraError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(RemoraError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| RemoraError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for HostPort {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Basic credentials presented with every call.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }

    /// Default credentials for a logical service: the name is both user and secret.
    pub fn for_service(name: &str) -> Self {
        Self::new(name, name)
    }

    /// Parse a `"user:secret"` string.
    pub fn parse(s: &str) -> Result<Self, RemoraError> {
        let (user, secret) = s
            .split_once(':')
            .ok_or_else(|| RemoraError::InvalidCredentials(s.to_string()))?;
        Ok(Self::new(user, secret))
    }
}

// Keep secrets out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"***")
            .finish()
    }
}

/// One reachable service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    addr: HostPort,
    auth: Option<Credentials>,
    secure: bool,
    timeout: Duration,
}

impl Endpoint {
    /// Create a plain endpoint without credentials.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_addr(HostPort::new(host, port))
    }

    pub fn from_addr(addr: HostPort) -> Self {
        Self {
            addr,
            auth: None,
            secure: false,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &HostPort {
        &self.addr
    }

    pub fn host(&self) -> &str {
        &self.addr.host
    }

    pub fn port(&self) -> u16 {
        self.addr.port
    }

    pub fn auth(&self) -> Option<&Credentials> {
        self.auth.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.secure {
            write!(f, "tls://{}", self.addr)
        } else {
            write!(f, "{}", self.addr)
        }
    }
}

/// Split a `"[user@]host[:port]"` string.
///
/// The port falls back to `default_port` when absent.
pub fn split_host(spec: &str, default_port: u16) -> Result<(Option<String>, HostPort), RemoraError> {
    let (user, rest) = match spec.split_once('@') {
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, spec),
    };
    let addr = if rest.contains(':') {
        rest.parse::<HostPort>()?
    } else if rest.is_empty() {
        return Err(RemoraError::InvalidAddress(spec.to_string()));
    } else {
        HostPort::new(rest, default_port)
    };
    Ok((user, addr))
}
