//! Structured faults returned by remote servers.

use serde::{Deserialize, Serialize};

/// A fault raised on the server side of a call.
///
/// Faults always travel back as a well-formed response; a client treats
/// every fault as fatal and never retries it on another endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Numeric fault code (see the associated constants).
    pub code: i32,
    /// Human readable message.
    pub message: String,
    /// Best-effort trace text captured where the fault was raised.
    pub trace: Option<String>,
}

impl Fault {
    /// Method is not in the server's allow-list.
    pub const UNSUPPORTED_METHOD: i32 = 1;
    /// Credentials missing or rejected.
    pub const AUTHENTICATION: i32 = 2;
    /// Arguments do not match the method's parameters.
    pub const INVALID_ARGUMENTS: i32 = 3;
    /// Error raised by the handler itself.
    pub const APPLICATION: i32 = 4;
    /// Handler panicked.
    pub const PANIC: i32 = 5;
    /// Named entity (service, channel) is unknown.
    pub const NOT_FOUND: i32 = 6;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            trace: None,
        }
    }

    /// Attach trace text to the fault.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn unsupported_method(method: &str) -> Self {
        Self::new(
            Self::UNSUPPORTED_METHOD,
            format!("unsupported method '{}'", method),
        )
    }

    pub fn authentication(user: Option<&str>) -> Self {
        match user {
            Some(user) => Self::new(
                Self::AUTHENTICATION,
                format!("authentication failed for user '{}'", user),
            ),
            None => Self::new(Self::AUTHENTICATION, "authentication required"),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_ARGUMENTS, message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(Self::APPLICATION, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, message)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fault {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Fault {}
