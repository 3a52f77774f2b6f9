//! Call outcome classification.
//!
//! Every remote call ends in one of three outcomes. The distinction between
//! [`Outcome::Retryable`] and [`Outcome::Fatal`] is what failover logic
//! branches on: a transport failure means another endpoint may succeed, a
//! fault returned by the server means it will not.

use crate::endpoint::HostPort;
use crate::fault::Fault;
use crate::value::Value;
use thiserror::Error;

/// Result of a remote call.
pub type CallResult = Result<Value, CallError>;

/// Classification of a call result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Ok,
    /// Transport-level failure; another endpoint might succeed.
    Retryable,
    /// Protocol or application failure; surfaced to the caller as is.
    Fatal,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Ok => write!(f, "OK"),
            Outcome::Retryable => write!(f, "RETRYABLE"),
            Outcome::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Why a remote call did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Connection refused, reset, timed out or otherwise lost.
    #[error("transport error talking to {endpoint}: {reason}")]
    Transport { endpoint: HostPort, reason: String },

    /// The server answered with a fault.
    #[error("{endpoint} returned {fault}")]
    Fault { endpoint: HostPort, fault: Fault },

    /// Every client of a service pack failed with a transport error.
    #[error("all {attempts} endpoints of '{service}' failed; last error: {last}")]
    Exhausted {
        service: String,
        attempts: usize,
        last: Box<CallError>,
    },

    /// The logical service name could not be resolved.
    #[error("cannot resolve service '{service}': {reason}")]
    Resolution { service: String, reason: String },

    /// The service pack has no clients to call.
    #[error("service pack '{service}' is empty")]
    EmptyPack { service: String },
}

impl CallError {
    pub fn transport(endpoint: &HostPort, reason: impl ToString) -> Self {
        CallError::Transport {
            endpoint: endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    /// Classify this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            CallError::Transport { .. } | CallError::Exhausted { .. } => Outcome::Retryable,
            CallError::Fault { .. } | CallError::Resolution { .. } | CallError::EmptyPack { .. } => {
                Outcome::Fatal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.outcome() == Outcome::Retryable
    }

    /// The server fault, if this error carries one.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            CallError::Fault { fault, .. } => Some(fault),
            CallError::Exhausted { last, .. } => last.fault(),
            _ => None,
        }
    }
}

/// Classify a call result.
pub fn outcome_of(result: &CallResult) -> Outcome {
    match result {
        Ok(_) => Outcome::Ok,
        Err(e) => e.outcome(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_is_fatal_transport_is_retryable() {
        let ep = HostPort::new("h1", 9001);
        let transport = CallError::transport(&ep, "connection refused");
        let fault = CallError::Fault {
            endpoint: ep.clone(),
            fault: Fault::application("boom"),
        };

        assert_eq!(transport.outcome(), Outcome::Retryable);
        assert_eq!(fault.outcome(), Outcome::Fatal);
        assert_eq!(outcome_of(&Ok(Value::Nil)), Outcome::Ok);
        assert_eq!(fault.fault().map(|f| f.code), Some(Fault::APPLICATION));
    }

    #[test]
    fn test_exhausted_keeps_last_error() {
        let ep = HostPort::new("h2", 9002);
        let err = CallError::Exhausted {
            service: "archiver".into(),
            attempts: 2,
            last: Box::new(CallError::transport(&ep, "reset")),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("h2:9002"));
    }
}
