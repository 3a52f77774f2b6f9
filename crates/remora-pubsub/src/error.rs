//! Broker errors.

use remora_core::{CallError, Fault, RemoraError};
use thiserror::Error;

pub type PubSubResult<T> = Result<T, PubSubError>;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Invalid subscription options: {0}")]
    InvalidOptions(String),

    /// A subscriber or publisher id that cannot be turned into a handle.
    #[error("Cannot reach '{id}': {reason}")]
    Unreachable { id: String, reason: String },

    /// A local subscriber whose receiving end has gone away.
    #[error("Subscriber '{0}' is closed")]
    Closed(String),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Remora(#[from] RemoraError),
}

impl From<PubSubError> for Fault {
    fn from(err: PubSubError) -> Self {
        match err {
            PubSubError::Call(CallError::Fault { fault, .. }) => fault,
            PubSubError::InvalidOptions(_) | PubSubError::Unreachable { .. } => {
                Fault::invalid_arguments(err.to_string())
            }
            other => Fault::application(other.to_string()),
        }
    }
}
