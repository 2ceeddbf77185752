//! Benchmark error taxonomy
//!
//! Per-agent failures are isolated and recorded as failed samples; only
//! configuration errors abort a run before any agent starts.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the benchmark core.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Server unreachable or session establishment failed. Fatal to the
    /// owning agent's run, never to the orchestration as a whole.
    #[error("connection to {endpoint} failed: {reason}")]
    Connection {
        /// Logical endpoint the client was addressing
        endpoint: String,
        /// Refusal reason reported by the server model
        reason: String,
    },

    /// No response within the per-call ceiling. Hard stop, never retried.
    #[error("no response within {ceiling:?}")]
    Timeout {
        /// The ceiling that expired
        ceiling: Duration,
    },

    /// Simulated packet loss exhausted the retry budget. Surfaced only when
    /// a degraded return is impossible; the shim itself reports a failed
    /// sample instead of raising.
    #[error("transfer dropped after {attempts} attempts")]
    RetriesExhausted {
        /// Physical transmissions performed before giving up
        attempts: u32,
    },

    /// Invalid run configuration, rejected before any agent starts.
    #[error("invalid config: {0}")]
    Config(String),

    /// The orchestrator's global deadline expired while work was in flight.
    #[error("cancelled by run deadline")]
    Cancelled,
}

impl BenchError {
    /// Whether the error ends the owning agent's run rather than degrading
    /// a single sample.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BenchError::Connection { .. })
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_is_fatal() {
        let err = BenchError::Connection {
            endpoint: "session".into(),
            reason: "refused".into(),
        };
        assert!(err.is_fatal());
        assert!(!BenchError::Cancelled.is_fatal());
        assert!(!BenchError::Timeout { ceiling: Duration::from_secs(1) }.is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = BenchError::Config("concurrency must be >= 1".into());
        assert_eq!(err.to_string(), "invalid config: concurrency must be >= 1");

        let err = BenchError::RetriesExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "transfer dropped after 3 attempts");
    }
}
