//! Benchmark run configuration
//!
//! Provides the network impairment profile and per-scenario parameters.
//! Both are constructed once per run and shared read-only by every agent.

use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::error::{BenchError, Result};

/// Bandwidth ceiling of a simulated link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// No transfer-time charge
    Unlimited,
    /// Ceiling in megabits per second (must be positive)
    Mbps(f64),
}

impl Bandwidth {
    /// Transfer time for `bytes` at this ceiling: `bytes * 8 / (mbps * 1e6)`.
    pub fn transfer_time(&self, bytes: u64) -> Duration {
        match *self {
            Bandwidth::Unlimited => Duration::ZERO,
            Bandwidth::Mbps(mbps) => {
                Duration::from_secs_f64(bytes as f64 * 8.0 / (mbps * 1_000_000.0))
            }
        }
    }

    /// Megabits per second, if bounded.
    pub fn mbps(&self) -> Option<f64> {
        match *self {
            Bandwidth::Unlimited => None,
            Bandwidth::Mbps(mbps) => Some(mbps),
        }
    }
}

/// Fixed-parameter network impairment applied uniformly to one run.
///
/// Delay is one-way and charged symmetrically on send and receive; loss is
/// drawn once per physical transmission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkProfile {
    /// One-way delay in milliseconds
    pub latency_ms: f64,
    /// Bandwidth ceiling used to charge transfer time per leg
    pub bandwidth: Bandwidth,
    /// Probability (0-100) that a physical transmission is dropped
    pub packet_loss_pct: f64,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self::ideal()
    }
}

impl NetworkProfile {
    /// Unimpaired link: zero delay, unlimited bandwidth, no loss.
    pub fn ideal() -> Self {
        Self {
            latency_ms: 0.0,
            bandwidth: Bandwidth::Unlimited,
            packet_loss_pct: 0.0,
        }
    }

    /// Mobile-broadband-like link: 50ms one-way delay, 5 Mbps ceiling.
    pub fn broadband() -> Self {
        Self {
            latency_ms: 50.0,
            bandwidth: Bandwidth::Mbps(5.0),
            packet_loss_pct: 0.0,
        }
    }

    /// Congested link: 100ms one-way delay, 10% loss.
    pub fn unstable() -> Self {
        Self {
            latency_ms: 100.0,
            bandwidth: Bandwidth::Unlimited,
            packet_loss_pct: 10.0,
        }
    }

    /// One-way propagation delay.
    pub fn one_way_delay(&self) -> Duration {
        Duration::from_secs_f64(self.latency_ms / 1000.0)
    }

    /// Whether the profile adds any impairment at all.
    pub fn is_ideal(&self) -> bool {
        self.latency_ms == 0.0
            && self.packet_loss_pct == 0.0
            && self.bandwidth == Bandwidth::Unlimited
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(BenchError::Config(format!(
                "latency_ms must be a non-negative finite number, got {}",
                self.latency_ms
            )));
        }
        if let Bandwidth::Mbps(mbps) = self.bandwidth {
            if !mbps.is_finite() || mbps <= 0.0 {
                return Err(BenchError::Config(format!(
                    "bandwidth_mbps must be positive, got {mbps}"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.packet_loss_pct) {
            return Err(BenchError::Config(format!(
                "packet_loss_pct must be within 0-100, got {}",
                self.packet_loss_pct
            )));
        }
        Ok(())
    }
}

/// Which status/ticker polls count as overhead.
///
/// The threshold is policy, not mechanism: by default every poll issued
/// before the terminal status counts, but a reasonable alternative excludes
/// the last poll before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverheadPolicy {
    /// Every poll before the terminal status is overhead
    #[default]
    AllPreTerminal,
    /// The final pre-completion poll is excused, one per completing agent
    ExcludeFinalPoll,
}

/// Parameters of one benchmark run, shared read-only by all agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Number of conversational turns for turn-bounded scenarios. Zero yields
    /// an empty result record, not an error.
    pub turns: u32,
    /// Wall-clock window for the subscription scenario
    pub duration: Duration,
    /// Number of simulated agents run in parallel
    pub concurrency: usize,
    /// Fixed interval between status/ticker polls
    pub poll_interval: Duration,
    /// Server-side duration of the long-running task
    pub task_duration: Duration,
    /// Interval at which the ticker topic produces a new value
    pub ticker_interval: Duration,
    /// Per-call response ceiling; expiry is a hard stop, never retried
    pub call_timeout: Duration,
    /// Optional global deadline for the whole orchestrated run
    pub deadline: Option<Duration>,
    /// Network impairment applied to every client call
    pub network: NetworkProfile,
    /// Overhead classification applied by the aggregator
    pub overhead_policy: OverheadPolicy,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            turns: 10,
            duration: Duration::from_secs(5),
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            task_duration: Duration::from_secs(5),
            ticker_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
            deadline: None,
            network: NetworkProfile::ideal(),
            overhead_policy: OverheadPolicy::AllPreTerminal,
        }
    }
}

impl ScenarioConfig {
    /// Reject invalid parameter combinations before any agent starts.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(BenchError::Config(format!(
                "concurrency must be >= 1, got {}",
                self.concurrency
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(BenchError::Config("poll_interval must be positive".into()));
        }
        // Guarantees at least one poll lands before the task deadline.
        if self.poll_interval > self.task_duration {
            return Err(BenchError::Config(format!(
                "poll_interval ({:?}) must not exceed task_duration ({:?})",
                self.poll_interval, self.task_duration
            )));
        }
        if self.ticker_interval.is_zero() {
            return Err(BenchError::Config("ticker_interval must be positive".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(BenchError::Config("call_timeout must be positive".into()));
        }
        self.network.validate()
    }

    /// Same run parameters with a different impairment profile.
    pub fn with_network(mut self, network: NetworkProfile) -> Self {
        self.network = network;
        self
    }
}
