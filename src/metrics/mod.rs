//! Sample collection and aggregation
//!
//! Every logical client call yields exactly one [`Sample`]. Agents append
//! to one concurrent-safe sink with no cross-agent ordering requirement
//! (sample identity is self-contained); after all agents complete the
//! orchestrator drains the sink and reduces it into a single
//! [`ResultRecord`] per (scenario, protocol, configuration) run.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use tokio::time::Instant;

use crate::config::{NetworkProfile, OverheadPolicy, ScenarioConfig};
use crate::netsim::LinkOutcome;
use crate::{Protocol, ScenarioId};

/// What a logical call was doing, for overhead classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// One conversational turn
    Turn,
    /// Request that starts a long-running task
    TaskStart,
    /// Status poll; `done` marks the poll that observed the terminal status
    TaskPoll {
        /// Whether this poll observed the terminal status
        done: bool,
    },
    /// Terminal completion observation, poll-observed or push-delivered
    TaskComplete,
    /// Subscription establishment
    Subscribe,
    /// Ticker poll; `fresh` marks polls that returned a new value
    TickerPoll {
        /// Whether the poll returned a value not seen before
        fresh: bool,
    },
    /// Pushed ticker update, no client-initiated call
    TickerEvent,
    /// One hop of a tool workflow
    Tool,
    /// Session or connection establishment that failed
    Connect,
    /// Work abandoned by the orchestrator's global deadline
    Cancelled,
}

impl CallKind {
    /// Polls that consumed resources without advancing anything.
    fn is_empty_poll(&self) -> bool {
        matches!(
            self,
            CallKind::TaskPoll { done: false } | CallKind::TickerPoll { fresh: false }
        )
    }
}

/// One timing/size observation for one logical call.
///
/// Offsets are measured from the run epoch on the tokio clock, so sample
/// timing stays meaningful under paused-clock tests; the epoch's wall-clock
/// timestamp lives on the [`ResultRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Protocol variant that produced the call
    pub protocol: Protocol,
    /// Scenario the call belongs to
    pub scenario: ScenarioId,
    /// Agent that issued the call
    pub agent_id: u32,
    /// Per-agent call sequence number
    pub call_index: u32,
    /// Offset from the run epoch at which the call was issued
    pub sent_at: Duration,
    /// Offset from the run epoch at which the call resolved
    pub completed_at: Duration,
    /// Bytes offered to the link across all physical attempts
    pub bytes_sent: u64,
    /// Bytes delivered back across all physical attempts
    pub bytes_received: u64,
    /// Whether the call resolved with a delivered response
    pub succeeded: bool,
    /// Physical transmissions beyond the first
    pub retries: u32,
    /// What the call was doing
    pub kind: CallKind,
}

impl Sample {
    /// Issue-to-resolution latency.
    pub fn latency(&self) -> Duration {
        self.completed_at.saturating_sub(self.sent_at)
    }
}

/// Concurrent-safe append sink shared by all agents of one run.
#[derive(Debug, Clone, Default)]
pub struct SampleSink {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl SampleSink {
    /// Empty sink for a new run.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, sample: Sample) {
        self.samples.lock().push(sample);
    }

    /// Number of samples collected so far.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Whether no samples were collected.
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Take everything collected so far.
    pub fn drain(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.samples.lock())
    }
}

/// Per-agent sample producer.
///
/// Clones share the agent's call-index counter, so helpers running on the
/// agent's behalf (e.g. a subscription poll loop) keep indices unique.
#[derive(Debug, Clone)]
pub struct Recorder {
    sink: SampleSink,
    protocol: Protocol,
    scenario: ScenarioId,
    agent_id: u32,
    epoch: Instant,
    next_index: Arc<AtomicU32>,
}

impl Recorder {
    /// Recorder for one agent, stamping offsets against `epoch`.
    pub fn new(
        sink: SampleSink,
        protocol: Protocol,
        scenario: ScenarioId,
        agent_id: u32,
        epoch: Instant,
    ) -> Self {
        Self {
            sink,
            protocol,
            scenario,
            agent_id,
            epoch,
            next_index: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Record a fully-specified observation.
    pub fn record_span(
        &self,
        kind: CallKind,
        started: Instant,
        completed: Instant,
        bytes_sent: u64,
        bytes_received: u64,
        succeeded: bool,
        retries: u32,
    ) {
        let sample = Sample {
            protocol: self.protocol,
            scenario: self.scenario,
            agent_id: self.agent_id,
            call_index: self.next_index.fetch_add(1, Ordering::Relaxed),
            sent_at: started.saturating_duration_since(self.epoch),
            completed_at: completed.saturating_duration_since(self.epoch),
            bytes_sent,
            bytes_received,
            succeeded,
            retries,
            kind,
        };
        self.sink.push(sample);
    }

    /// Record the outcome of one call through the impairment shim.
    pub fn record_call(&self, kind: CallKind, outcome: &LinkOutcome) {
        self.record_span(
            kind,
            outcome.started,
            outcome.completed,
            outcome.bytes_sent(),
            outcome.bytes_received(),
            outcome.delivered,
            outcome.retries(),
        );
    }

    /// Record a push-delivered event (no client-initiated transmission).
    pub fn record_event(&self, kind: CallKind, started: Instant, bytes_received: u64) {
        self.record_span(kind, started, Instant::now(), 0, bytes_received, true, 0);
    }

    /// Record an operation that failed without a delivered response.
    pub fn record_failure(&self, kind: CallKind, started: Instant) {
        self.record_span(kind, started, Instant::now(), 0, 0, false, 0);
    }
}

/// Latency distribution with percentile extraction.
#[derive(Debug, Default)]
struct LatencyTracker {
    samples: Vec<u64>, // Microseconds
    sum: u64,
}

impl LatencyTracker {
    fn record(&mut self, latency_us: u64) {
        self.samples.push(latency_us);
        self.sum += latency_us;
    }

    fn average(&self) -> u64 {
        if self.samples.is_empty() {
            0
        } else {
            self.sum / self.samples.len() as u64
        }
    }

    fn percentile(&mut self, p: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.sort_unstable();
        let idx = ((self.samples.len() as f64 - 1.0) * p / 100.0) as usize;
        self.samples[idx]
    }
}

/// Aggregated statistics for one (scenario, protocol, configuration) run.
///
/// Derived once at run end, never mutated afterwards; the sole artifact
/// crossing the core/reporting boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Scenario this record aggregates
    pub scenario: ScenarioId,
    /// Protocol variant this record aggregates
    pub protocol: Protocol,
    /// Wall-clock timestamp of the run epoch
    pub generated_at: DateTime<Utc>,
    /// Total samples collected, failed ones included
    pub sample_count: u64,
    /// Samples that resolved with a delivered response
    pub succeeded: u64,
    /// Samples that did not
    pub failed: u64,
    /// failed / sample_count
    pub failure_rate: f64,
    /// Mean latency over succeeded samples, milliseconds
    pub latency_mean_ms: f64,
    /// Median latency over succeeded samples, milliseconds
    pub latency_p50_ms: f64,
    /// 95th percentile latency, milliseconds
    pub latency_p95_ms: f64,
    /// 99th percentile latency, milliseconds
    pub latency_p99_ms: f64,
    /// Bytes offered to the link, dropped transmissions included
    pub total_bytes_sent: u64,
    /// Bytes delivered back to clients
    pub total_bytes_received: u64,
    /// Elapsed wall clock for the whole orchestrated run
    pub wall_clock: Duration,
    /// Completed logical calls per wall-clock second
    pub rps: f64,
    /// Calls that produced no forward progress
    pub overhead_calls: u64,
    /// Number of agents that produced the samples
    pub concurrency: usize,
    /// Impairment profile the run was executed under
    pub network: NetworkProfile,
}

impl ResultRecord {
    /// Sent plus received bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes_sent + self.total_bytes_received
    }
}

/// Reduce the full sample set of one run into its result record.
///
/// Percentiles cover succeeded samples only; failed samples are reported
/// through the failure rate so degraded timings cannot distort the tail.
pub fn aggregate(
    scenario: ScenarioId,
    protocol: Protocol,
    config: &ScenarioConfig,
    samples: &[Sample],
    wall_clock: Duration,
) -> ResultRecord {
    let mut latencies = LatencyTracker::default();
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    let mut total_bytes_sent = 0u64;
    let mut total_bytes_received = 0u64;

    for sample in samples {
        total_bytes_sent += sample.bytes_sent;
        total_bytes_received += sample.bytes_received;
        if sample.succeeded {
            succeeded += 1;
            latencies.record(sample.latency().as_micros() as u64);
        } else {
            failed += 1;
        }
    }

    let sample_count = samples.len() as u64;
    let failure_rate = if sample_count > 0 {
        failed as f64 / sample_count as f64
    } else {
        0.0
    };
    let rps = if wall_clock.is_zero() {
        0.0
    } else {
        succeeded as f64 / wall_clock.as_secs_f64()
    };

    ResultRecord {
        scenario,
        protocol,
        generated_at: Utc::now(),
        sample_count,
        succeeded,
        failed,
        failure_rate,
        latency_mean_ms: latencies.average() as f64 / 1000.0,
        latency_p50_ms: latencies.percentile(50.0) as f64 / 1000.0,
        latency_p95_ms: latencies.percentile(95.0) as f64 / 1000.0,
        latency_p99_ms: latencies.percentile(99.0) as f64 / 1000.0,
        total_bytes_sent,
        total_bytes_received,
        wall_clock,
        rps,
        overhead_calls: count_overhead(samples, config.overhead_policy),
        concurrency: config.concurrency,
        network: config.network,
    }
}

/// Overhead = empty polls plus retransmissions beyond the first attempt.
fn count_overhead(samples: &[Sample], policy: OverheadPolicy) -> u64 {
    let retransmissions: u64 = samples.iter().map(|s| s.retries as u64).sum();
    let empty_polls = samples.iter().filter(|s| s.kind.is_empty_poll()).count() as u64;
    let mut overhead = retransmissions + empty_polls;

    if policy == OverheadPolicy::ExcludeFinalPoll {
        // Excuse one pre-completion status poll per agent that completed.
        let mut per_agent: HashMap<u32, (u64, bool)> = HashMap::new();
        for sample in samples {
            let entry = per_agent.entry(sample.agent_id).or_default();
            match sample.kind {
                CallKind::TaskPoll { done: false } => entry.0 += 1,
                CallKind::TaskComplete if sample.succeeded => entry.1 = true,
                _ => {}
            }
        }
        let excused = per_agent
            .values()
            .filter(|(polls, completed)| *completed && *polls > 0)
            .count() as u64;
        overhead = overhead.saturating_sub(excused);
    }

    overhead
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: CallKind, agent_id: u32, succeeded: bool, latency_ms: u64) -> Sample {
        Sample {
            protocol: Protocol::Rest,
            scenario: ScenarioId::LongTask,
            agent_id,
            call_index: 0,
            sent_at: Duration::ZERO,
            completed_at: Duration::from_millis(latency_ms),
            bytes_sent: 100,
            bytes_received: 50,
            succeeded,
            retries: 0,
            kind,
        }
    }

    #[test]
    fn test_percentiles_over_succeeded_only() {
        let mut samples: Vec<Sample> = (1..=100)
            .map(|i| sample(CallKind::Turn, 0, true, i))
            .collect();
        // A slow failure must not distort the tail.
        samples.push(sample(CallKind::Turn, 0, false, 60_000));

        let record = aggregate(
            ScenarioId::ContextScaling,
            Protocol::Rest,
            &ScenarioConfig::default(),
            &samples,
            Duration::from_secs(1),
        );
        assert_eq!(record.sample_count, 101);
        assert_eq!(record.succeeded, 100);
        assert_eq!(record.failed, 1);
        assert!(record.latency_p99_ms < 101.0);
        assert!((record.latency_p50_ms - 50.0).abs() <= 1.0);
        assert!((record.failure_rate - 1.0 / 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_run_yields_zero_record() {
        let record = aggregate(
            ScenarioId::ContextScaling,
            Protocol::Mcp,
            &ScenarioConfig::default(),
            &[],
            Duration::from_millis(1),
        );
        assert_eq!(record.sample_count, 0);
        assert_eq!(record.latency_p99_ms, 0.0);
        assert_eq!(record.failure_rate, 0.0);
        assert_eq!(record.rps, 0.0);
    }

    #[test]
    fn test_overhead_counts_empty_polls_and_retries() {
        let mut samples = vec![
            sample(CallKind::TaskPoll { done: false }, 0, true, 1),
            sample(CallKind::TaskPoll { done: false }, 0, true, 1),
            sample(CallKind::TaskPoll { done: true }, 0, true, 1),
            sample(CallKind::TaskComplete, 0, true, 1),
        ];
        samples[3].retries = 2;

        let config = ScenarioConfig::default();
        let record = aggregate(
            ScenarioId::LongTask,
            Protocol::Rest,
            &config,
            &samples,
            Duration::from_secs(1),
        );
        // Two empty polls plus two retransmissions.
        assert_eq!(record.overhead_calls, 4);

        let lenient = ScenarioConfig {
            overhead_policy: OverheadPolicy::ExcludeFinalPoll,
            ..config
        };
        let record = aggregate(
            ScenarioId::LongTask,
            Protocol::Rest,
            &lenient,
            &samples,
            Duration::from_secs(1),
        );
        assert_eq!(record.overhead_calls, 3);
    }

    #[test]
    fn test_bandwidth_totals_include_failed_samples() {
        let samples = vec![
            sample(CallKind::Turn, 0, true, 5),
            sample(CallKind::Turn, 0, false, 5),
        ];
        let record = aggregate(
            ScenarioId::ContextScaling,
            Protocol::Rest,
            &ScenarioConfig::default(),
            &samples,
            Duration::from_secs(1),
        );
        assert_eq!(record.total_bytes_sent, 200);
        assert_eq!(record.total_bytes_received, 100);
        assert_eq!(record.total_bytes(), 300);
    }

    #[test]
    fn test_recorder_indices_stay_unique_across_clones() {
        let sink = SampleSink::new();
        let recorder = Recorder::new(
            sink.clone(),
            Protocol::Mcp,
            ScenarioId::Ticker,
            7,
            Instant::now(),
        );
        let clone = recorder.clone();
        let now = Instant::now();
        recorder.record_span(CallKind::Subscribe, now, now, 10, 10, true, 0);
        clone.record_event(CallKind::TickerEvent, now, 42);
        recorder.record_failure(CallKind::TickerPoll { fresh: false }, now);

        let mut indices: Vec<u32> = sink.drain().iter().map(|s| s.call_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
