//! Concurrency orchestrator
//!
//! Runs `concurrency` independent agents, each executing one full scenario
//! instance, then fans their samples into the run's result record. Agents
//! share the network profile (read-only) and nothing else: no shared
//! session, no shared connection, no shared mutable state. One agent's
//! failure never halts or corrupts the others' results.

use std::sync::Arc;

use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ProtocolClient, SessionClient, StatelessClient};
use crate::config::ScenarioConfig;
use crate::error::Result;
use crate::metrics::{self, CallKind, Recorder, ResultRecord, SampleSink};
use crate::netsim::ImpairedLink;
use crate::scenario;
use crate::server::ModelServer;
use crate::{Protocol, ScenarioId};

/// Execute one (scenario, protocol, configuration) run to completion.
///
/// Synchronous from the caller's perspective: the future resolves only when
/// every agent has finished or been cut off by the global deadline. Always
/// yields a result record — possibly with zero samples or a non-zero
/// failure rate — and raises only for invalid configuration.
pub async fn run(
    scenario_id: ScenarioId,
    protocol: Protocol,
    config: &ScenarioConfig,
) -> Result<ResultRecord> {
    config.validate()?;
    info!(
        scenario = %scenario_id,
        %protocol,
        concurrency = config.concurrency,
        latency_ms = config.network.latency_ms,
        loss_pct = config.network.packet_loss_pct,
        "starting run"
    );

    let server = Arc::new(ModelServer::new(config.ticker_interval));
    let sink = SampleSink::new();
    let barrier = Arc::new(Barrier::new(config.concurrency));
    let epoch = Instant::now();

    let mut agents = JoinSet::new();
    for agent_id in 0..config.concurrency as u32 {
        let recorder = Recorder::new(sink.clone(), protocol, scenario_id, agent_id, epoch);
        let server = server.clone();
        let config = config.clone();
        let barrier = barrier.clone();
        agents.spawn(async move {
            run_agent(scenario_id, protocol, agent_id, server, config, barrier, recorder).await;
        });
    }

    while let Some(joined) = agents.join_next().await {
        if let Err(err) = joined {
            // A panicked agent loses its remaining samples but nothing else.
            warn!(%err, "agent task aborted");
        }
    }

    let wall_clock = epoch.elapsed();
    let samples = sink.drain();
    let record = metrics::aggregate(scenario_id, protocol, config, &samples, wall_clock);
    info!(
        scenario = %scenario_id,
        %protocol,
        samples = record.sample_count,
        failed = record.failed,
        overhead = record.overhead_calls,
        "run complete"
    );
    Ok(record)
}

async fn run_agent(
    scenario_id: ScenarioId,
    protocol: Protocol,
    agent_id: u32,
    server: Arc<ModelServer>,
    config: ScenarioConfig,
    barrier: Arc<Barrier>,
    recorder: Recorder,
) {
    let link = ImpairedLink::new(config.network, config.call_timeout);

    // Clients are built ahead of the start barrier so session establishment
    // never skews the simultaneous start.
    let client: Result<Box<dyn ProtocolClient>> = match protocol {
        Protocol::Rest => Ok(Box::new(StatelessClient::new(
            server,
            link,
            recorder.clone(),
            config.poll_interval,
        ))),
        Protocol::Mcp => SessionClient::connect(server, link, recorder.clone())
            .map(|client| Box::new(client) as Box<dyn ProtocolClient>),
    };

    barrier.wait().await;

    let mut client = match client {
        Ok(client) => client,
        Err(err) => {
            debug!(agent_id, %err, "client construction failed");
            recorder.record_failure(CallKind::Connect, Instant::now());
            return;
        }
    };

    let result = match config.deadline {
        Some(deadline) => {
            match tokio::time::timeout(
                deadline,
                scenario::drive(scenario_id, client.as_mut(), &config),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    // In-flight work is abandoned, not awaited past the
                    // deadline.
                    recorder.record_failure(CallKind::Cancelled, Instant::now());
                    client.close().await;
                    return;
                }
            }
        }
        None => scenario::drive(scenario_id, client.as_mut(), &config).await,
    };

    if let Err(err) = result {
        debug!(agent_id, %err, "agent run ended early");
    }
    client.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::config::NetworkProfile;

    fn quick_config() -> ScenarioConfig {
        ScenarioConfig {
            turns: 4,
            task_duration: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            ticker_interval: Duration::from_millis(100),
            duration: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_config_error_rejected_before_any_agent_starts() {
        let config = ScenarioConfig { concurrency: 0, ..Default::default() };
        let err = run(ScenarioId::ContextScaling, Protocol::Rest, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::BenchError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_turns_yields_empty_record_for_both_protocols() {
        let config = ScenarioConfig { turns: 0, ..quick_config() };
        for protocol in Protocol::ALL {
            let record = run(ScenarioId::ContextScaling, protocol, &config)
                .await
                .unwrap();
            assert_eq!(record.sample_count, 0, "{protocol}");
            assert_eq!(record.failed, 0, "{protocol}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_agents_produce_exactly_n_times_the_samples() {
        let config = ScenarioConfig { concurrency: 50, ..quick_config() };
        for protocol in Protocol::ALL {
            let record = run(ScenarioId::ContextScaling, protocol, &config)
                .await
                .unwrap();
            // One turn sample per turn per agent, no failures expected.
            assert_eq!(record.sample_count, 50 * 4, "{protocol}");
            assert_eq!(record.failed, 0, "{protocol}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unimpaired_runs_are_repeatable() {
        let config = quick_config();
        let first = run(ScenarioId::ContextScaling, Protocol::Rest, &config)
            .await
            .unwrap();
        let second = run(ScenarioId::ContextScaling, Protocol::Rest, &config)
            .await
            .unwrap();
        assert_eq!(first.sample_count, second.sample_count);
        assert!((first.latency_p50_ms - second.latency_p50_ms).abs() < 1.0);
        assert!((first.latency_p99_ms - second.latency_p99_ms).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_agents_off_without_hanging_the_run() {
        let config = ScenarioConfig {
            deadline: Some(Duration::from_millis(200)),
            task_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let record = run(ScenarioId::LongTask, Protocol::Rest, &config)
            .await
            .unwrap();
        assert!(record.failed >= 1);
        assert!(record.wall_clock >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lossy_run_still_yields_a_record() {
        let config = ScenarioConfig {
            network: NetworkProfile {
                latency_ms: 5.0,
                bandwidth: crate::Bandwidth::Unlimited,
                packet_loss_pct: 60.0,
            },
            ..quick_config()
        };
        let record = run(ScenarioId::ContextScaling, Protocol::Rest, &config)
            .await
            .unwrap();
        assert_eq!(record.sample_count, 4);
        assert!(record.failure_rate <= 1.0);
    }
}
