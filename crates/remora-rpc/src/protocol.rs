//! tarpc service definition.
//!
//! Remote objects expose an open-ended, name-dispatched method set, so the
//! wire service has a single operation carrying the method name, positional
//! arguments and the caller's credentials.

use remora_core::{Credentials, Fault, Value};
use serde::{Deserialize, Serialize};

/// A single remote method invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    /// Method name, checked against the server's allow-list.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Basic credentials, checked against the server's auth table.
    pub auth: Option<Credentials>,
}

impl CallRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.auth = auth;
        self
    }
}

/// Service exposed by every remote object server.
#[tarpc::service]
pub trait RemoteObject {
    /// Invoke `request.method` with `request.args`.
    ///
    /// Returns the method's value, or a fault for unknown methods,
    /// failed authentication, bad arguments, handler errors and panics.
    async fn invoke(request: CallRequest) -> Result<Value, Fault>;
}
