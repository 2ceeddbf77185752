//! protobench - stateless vs stateful protocol benchmark harness
//!
//! This crate quantifies the performance difference between a stateless
//! request/response protocol (full context resent on every call) and a
//! stateful, event-driven protocol (session-held context, server push) under
//! controllable network impairment and concurrent load.
//!
//! The harness drives both interaction models through one measurement
//! contract, injects reproducible delay/bandwidth/loss between client and
//! server, and reduces per-call samples from many concurrent simulated
//! agents into comparable statistics.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod netsim;
pub mod metrics;
pub mod server;
pub mod client;
pub mod scenario;
pub mod runner;
pub mod report;

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

pub use config::{Bandwidth, NetworkProfile, OverheadPolicy, ScenarioConfig};
pub use error::BenchError;
pub use metrics::{CallKind, ResultRecord, Sample};
pub use runner::run;

/// Harness version reported in generated artifacts.
pub const HARNESS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol variants under comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Stateless request/response: every call carries the full accumulated
    /// context, long tasks are observed by polling.
    Rest,
    /// Stateful session: the server holds prior turns, clients send deltas
    /// over a persistent connection and receive pushed events.
    Mcp,
}

impl Protocol {
    /// Both variants, in reporting order.
    pub const ALL: [Protocol; 2] = [Protocol::Rest, Protocol::Mcp];

    /// Label used in samples and report rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rest => "REST",
            Protocol::Mcp => "MCP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five fixed benchmark scenario shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScenarioId {
    /// Multi-turn chat with accumulating context
    ContextScaling,
    /// Long-running task observed by polling or push
    LongTask,
    /// Fixed-window ticker subscription vs repeated polling
    Ticker,
    /// Three sequential tool calls, each output feeding the next input
    ToolChain,
    /// Context scaling and long task re-run under an adverse profile
    NetworkStress,
}

impl ScenarioId {
    /// All scenarios, in reporting order.
    pub const ALL: [ScenarioId; 5] = [
        ScenarioId::ContextScaling,
        ScenarioId::LongTask,
        ScenarioId::Ticker,
        ScenarioId::ToolChain,
        ScenarioId::NetworkStress,
    ];

    /// Label used in samples and report rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioId::ContextScaling => "context_scaling",
            ScenarioId::LongTask => "long_task",
            ScenarioId::Ticker => "ticker",
            ScenarioId::ToolChain => "tool_chain",
            ScenarioId::NetworkStress => "network_stress",
        }
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioId {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context_scaling" => Ok(ScenarioId::ContextScaling),
            "long_task" => Ok(ScenarioId::LongTask),
            "ticker" => Ok(ScenarioId::Ticker),
            "tool_chain" => Ok(ScenarioId::ToolChain),
            "network_stress" => Ok(ScenarioId::NetworkStress),
            other => Err(BenchError::Config(format!("unknown scenario: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_labels_round_trip() {
        for scenario in ScenarioId::ALL {
            assert_eq!(scenario.as_str().parse::<ScenarioId>().unwrap(), scenario);
        }
        assert!("bogus".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_protocol_labels() {
        assert_eq!(Protocol::Rest.to_string(), "REST");
        assert_eq!(Protocol::Mcp.to_string(), "MCP");
    }
}
