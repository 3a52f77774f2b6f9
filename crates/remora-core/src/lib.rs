//! # Remora Core
//!
//! Shared data model for the remora remote-object layer and the
//! publish/subscribe broker built on top of it.
//!
//! - [`Value`]: the dynamically typed payload carried by every call
//! - [`Fault`]: a structured application/protocol fault (code + message + trace)
//! - [`Outcome`] and [`CallError`]: the OK / RETRYABLE / FATAL classification
//!   that drives failover
//! - [`Endpoint`], [`HostPort`], [`Credentials`]: addressing a service instance

pub mod endpoint;
pub mod error;
pub mod fault;
pub mod outcome;
pub mod value;

pub use endpoint::{split_host, Credentials, Endpoint, HostPort, DEFAULT_CALL_TIMEOUT};
pub use error::{RemoraError, RemoraResult};
pub use fault::Fault;
pub use outcome::{outcome_of, CallError, CallResult, Outcome};
pub use value::Value;
