//! Service registration records.

use remora_core::{HostPort, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// One registered instance of a logical service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Whether the instance expects TLS.
    pub secure: bool,
    /// Last time the instance was heard from, seconds since the Unix epoch.
    pub ping_time: f64,
}

impl ServiceRecord {
    /// Create a record stamped with the current time.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            secure,
            ping_time: now_secs(),
        }
    }

    pub fn addr(&self) -> HostPort {
        HostPort::new(self.host.clone(), self.port)
    }

    /// Seconds elapsed since the last ping.
    pub fn age(&self) -> f64 {
        (now_secs() - self.ping_time).max(0.0)
    }

    /// Encode as a struct value `{name, host, port, secure, pingtime}`.
    pub fn to_value(&self) -> Value {
        Value::from_pairs([
            ("name", Value::from(self.name.as_str())),
            ("host", Value::from(self.host.as_str())),
            ("port", Value::from(self.port)),
            ("secure", Value::Bool(self.secure)),
            ("pingtime", Value::Double(self.ping_time)),
        ])
    }

    /// Decode a struct value produced by [`to_value`](Self::to_value).
    pub fn from_value(value: &Value) -> Option<Self> {
        let port = value.get("port")?.as_i64()?;
        Some(Self {
            name: value.get("name")?.as_str()?.to_string(),
            host: value.get("host")?.as_str()?.to_string(),
            port: u16::try_from(port).ok()?,
            secure: value.get("secure").and_then(Value::as_bool).unwrap_or(false),
            ping_time: value.get("pingtime").and_then(Value::as_f64).unwrap_or(0.0),
        })
    }
}

/// Current wall clock time in fractional seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_encoding() {
        let record = ServiceRecord::new("archiver", "h1", 9001, true);
        let decoded = ServiceRecord::from_value(&record.to_value()).unwrap();
        assert_eq!(decoded, record);

        assert!(ServiceRecord::from_value(&Value::from("junk")).is_none());
        let bad_port = Value::from_pairs([
            ("name", Value::from("x")),
            ("host", Value::from("h")),
            ("port", Value::Int(70000)),
        ]);
        assert!(ServiceRecord::from_value(&bad_port).is_none());
    }
}
