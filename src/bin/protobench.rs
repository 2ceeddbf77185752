//! Benchmark runner CLI
//!
//! Thin entry point around the harness core: parses scenario selection,
//! run parameters, and the network profile, executes every selected
//! (scenario, protocol) pair, and hands the records to the report writers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use protobench::{
    report, run, Bandwidth, NetworkProfile, Protocol, ScenarioConfig, ScenarioId,
};

#[derive(Debug, Parser)]
#[command(
    name = "protobench",
    version,
    about = "Benchmark stateless request/response vs stateful session protocols"
)]
struct Args {
    /// Comma-separated scenarios to run (default: all).
    /// One of: context_scaling, long_task, ticker, tool_chain, network_stress
    #[arg(long, value_delimiter = ',')]
    scenarios: Vec<String>,

    /// Conversational turns for turn-bounded scenarios
    #[arg(long, default_value_t = 10)]
    turns: u32,

    /// Simulated agents per run
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Subscription window in seconds
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,

    /// Status/ticker poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    /// Long task duration in milliseconds
    #[arg(long, default_value_t = 5000)]
    task_duration_ms: u64,

    /// One-way link delay in milliseconds
    #[arg(long, default_value_t = 0.0)]
    latency_ms: f64,

    /// Bandwidth ceiling in Mbps (0 = unlimited)
    #[arg(long, default_value_t = 0.0)]
    bandwidth_mbps: f64,

    /// Packet loss percentage, 0-100
    #[arg(long, default_value_t = 0.0)]
    packet_loss_pct: f64,

    /// Optional global deadline per run, in seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Directory for the generated reports
    #[arg(long, default_value = "reports")]
    output: PathBuf,
}

impl Args {
    fn network(&self) -> NetworkProfile {
        let bandwidth = if self.bandwidth_mbps > 0.0 {
            Bandwidth::Mbps(self.bandwidth_mbps)
        } else {
            Bandwidth::Unlimited
        };
        NetworkProfile {
            latency_ms: self.latency_ms,
            bandwidth,
            packet_loss_pct: self.packet_loss_pct,
        }
    }

    fn config(&self) -> ScenarioConfig {
        ScenarioConfig {
            turns: self.turns,
            duration: Duration::from_secs(self.duration_secs),
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            task_duration: Duration::from_millis(self.task_duration_ms),
            deadline: self.deadline_secs.map(Duration::from_secs),
            network: self.network(),
            ..Default::default()
        }
    }

    fn scenarios(&self) -> Result<Vec<ScenarioId>> {
        if self.scenarios.is_empty() {
            return Ok(ScenarioId::ALL.to_vec());
        }
        self.scenarios
            .iter()
            .map(|name| name.parse().map_err(anyhow::Error::from))
            .collect()
    }
}

/// Adverse profile used by the stress scenario when the user did not ask
/// for impairment explicitly.
fn stress_profile() -> NetworkProfile {
    NetworkProfile {
        latency_ms: 100.0,
        bandwidth: Bandwidth::Mbps(5.0),
        packet_loss_pct: 10.0,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let base_config = args.config();
    let scenarios = args.scenarios()?;

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;

    let mut records = Vec::new();
    for scenario in scenarios {
        let config = if scenario == ScenarioId::NetworkStress && base_config.network.is_ideal() {
            base_config.clone().with_network(stress_profile())
        } else {
            base_config.clone()
        };
        for protocol in Protocol::ALL {
            let record = run(scenario, protocol, &config).await?;
            info!(
                scenario = %record.scenario,
                protocol = %record.protocol,
                p95_ms = record.latency_p95_ms,
                bytes_sent = record.total_bytes_sent,
                overhead = record.overhead_calls,
                "run finished"
            );
            records.push(record);
        }
    }

    report::write_csv(&records, &args.output.join("benchmark_results.csv"))?;
    report::write_json(&records, &args.output.join("benchmark_results.json"))?;
    report::write_markdown(&records, &args.output.join("benchmark_report.md"))?;

    info!(runs = records.len(), output = %args.output.display(), "benchmark complete");
    Ok(())
}
