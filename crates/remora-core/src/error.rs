//! Infrastructure errors.

use thiserror::Error;

/// Result type for remora infrastructure operations.
pub type RemoraResult<T> = Result<T, RemoraError>;

/// Errors raised while setting up or tearing down remora components.
///
/// Failures of individual remote calls are reported through
/// [`CallError`](crate::CallError) instead.
#[derive(Debug, Error)]
pub enum RemoraError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid credentials string: expected 'user:secret', got '{0}'")]
    InvalidCredentials(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Server '{name}' is {state}, cannot {action}")]
    InvalidState {
        name: String,
        state: String,
        action: &'static str,
    },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Name service registration failed for '{name}': {reason}")]
    Registration { name: String, reason: String },
}
