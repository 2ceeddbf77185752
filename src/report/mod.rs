//! Result record writers
//!
//! Consume aggregated result records and serialize them for external
//! reporting: CSV rows (one per scenario x protocol x configuration run),
//! a JSON document, and a Markdown comparison report. Nothing here feeds
//! back into the core.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::info;

use crate::metrics::ResultRecord;
use crate::{Protocol, ScenarioId, HARNESS_VERSION};

/// Column order of the CSV report.
pub const CSV_HEADER: &str = "scenario,protocol,sample_count,succeeded,failed,failure_rate,\
latency_p50_ms,latency_p95_ms,latency_p99_ms,total_bytes_sent,total_bytes_received,rps,\
overhead_calls,concurrency,latency_ms,bandwidth_mbps,packet_loss_pct";

/// Write one CSV row per record.
pub fn write_csv(records: &[ResultRecord], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{CSV_HEADER}")?;
    for record in records {
        let bandwidth = record
            .network
            .bandwidth
            .mbps()
            .map(|mbps| mbps.to_string())
            .unwrap_or_else(|| "unlimited".into());
        writeln!(
            out,
            "{},{},{},{},{},{:.4},{:.3},{:.3},{:.3},{},{},{:.2},{},{},{},{},{}",
            record.scenario,
            record.protocol,
            record.sample_count,
            record.succeeded,
            record.failed,
            record.failure_rate,
            record.latency_p50_ms,
            record.latency_p95_ms,
            record.latency_p99_ms,
            record.total_bytes_sent,
            record.total_bytes_received,
            record.rps,
            record.overhead_calls,
            record.concurrency,
            record.network.latency_ms,
            bandwidth,
            record.network.packet_loss_pct,
        )?;
    }
    out.flush()?;
    info!(path = %path.display(), rows = records.len(), "CSV report written");
    Ok(())
}

/// Envelope stored in the JSON report.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportDocument {
    /// Harness version that produced the records
    pub harness_version: String,
    /// When the document was written
    pub generated_at: DateTime<Utc>,
    /// All run records, in execution order
    pub records: Vec<ResultRecord>,
}

/// Write all records as one JSON document.
pub fn write_json(records: &[ResultRecord], path: &Path) -> Result<()> {
    let document = ReportDocument {
        harness_version: HARNESS_VERSION.to_string(),
        generated_at: Utc::now(),
        records: records.to_vec(),
    };
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &document)
        .with_context(|| format!("serializing {}", path.display()))?;
    info!(path = %path.display(), "JSON report written");
    Ok(())
}

/// Read a previously written JSON document back.
pub fn load_json(path: &Path) -> Result<ReportDocument> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}

/// Write the Markdown comparison report.
pub fn write_markdown(records: &[ResultRecord], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "# Stateless vs Stateful Protocol Benchmark")?;
    writeln!(out)?;
    writeln!(out, "**Generated:** {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(out)?;
    writeln!(out, "## Results")?;
    writeln!(out)?;
    writeln!(
        out,
        "| Scenario | Protocol | Samples | p50 (ms) | p95 (ms) | Bytes sent | RPS | Overhead | Failure rate |"
    )?;
    writeln!(out, "|---|---|---|---|---|---|---|---|---|")?;
    for record in records {
        writeln!(
            out,
            "| {} | {} | {} | {:.2} | {:.2} | {} | {:.1} | {} | {:.1}% |",
            record.scenario,
            record.protocol,
            record.sample_count,
            record.latency_p50_ms,
            record.latency_p95_ms,
            record.total_bytes_sent,
            record.rps,
            record.overhead_calls,
            record.failure_rate * 100.0,
        )?;
    }
    writeln!(out)?;

    writeln!(out, "## Comparison")?;
    writeln!(out)?;
    for scenario in ScenarioId::ALL {
        let rest = find(records, scenario, Protocol::Rest);
        let mcp = find(records, scenario, Protocol::Mcp);
        let (Some(rest), Some(mcp)) = (rest, mcp) else { continue };
        writeln!(out, "### {scenario}")?;
        writeln!(out)?;
        for line in verdict_lines(scenario, rest, mcp) {
            writeln!(out, "- {line}")?;
        }
        writeln!(out)?;
    }

    out.flush()?;
    info!(path = %path.display(), "Markdown report written");
    Ok(())
}

fn find(records: &[ResultRecord], scenario: ScenarioId, protocol: Protocol) -> Option<&ResultRecord> {
    records
        .iter()
        .find(|r| r.scenario == scenario && r.protocol == protocol)
}

fn verdict_lines(scenario: ScenarioId, rest: &ResultRecord, mcp: &ResultRecord) -> Vec<String> {
    let mut lines = Vec::new();

    let bytes_winner = if mcp.total_bytes_sent < rest.total_bytes_sent { mcp } else { rest };
    lines.push(format!(
        "Bandwidth: {} sent fewer bytes ({} vs {})",
        bytes_winner.protocol,
        mcp.total_bytes_sent.min(rest.total_bytes_sent),
        mcp.total_bytes_sent.max(rest.total_bytes_sent),
    ));

    let latency_winner = if mcp.latency_p95_ms < rest.latency_p95_ms { mcp } else { rest };
    lines.push(format!(
        "Latency: {} had the lower p95 ({:.2} ms vs {:.2} ms)",
        latency_winner.protocol,
        mcp.latency_p95_ms.min(rest.latency_p95_ms),
        mcp.latency_p95_ms.max(rest.latency_p95_ms),
    ));

    if matches!(scenario, ScenarioId::LongTask | ScenarioId::Ticker) {
        let overhead_winner = if mcp.overhead_calls < rest.overhead_calls { mcp } else { rest };
        lines.push(format!(
            "Overhead: {} issued fewer wasted calls ({} vs {})",
            overhead_winner.protocol,
            mcp.overhead_calls.min(rest.overhead_calls),
            mcp.overhead_calls.max(rest.overhead_calls),
        ));
    }

    if rest.failed + mcp.failed > 0 {
        lines.push(format!(
            "Failures: REST {:.1}%, MCP {:.1}%",
            rest.failure_rate * 100.0,
            mcp.failure_rate * 100.0,
        ));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::config::{NetworkProfile, ScenarioConfig};
    use crate::metrics::aggregate;

    fn record(scenario: ScenarioId, protocol: Protocol) -> ResultRecord {
        aggregate(
            scenario,
            protocol,
            &ScenarioConfig {
                network: NetworkProfile::broadband(),
                ..Default::default()
            },
            &[],
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_csv_has_one_row_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let records = vec![
            record(ScenarioId::ContextScaling, Protocol::Rest),
            record(ScenarioId::ContextScaling, Protocol::Mcp),
        ];
        write_csv(&records, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("context_scaling,REST,"));
        assert!(lines[1].contains(",5,")); // broadband bandwidth column
    }

    #[test]
    fn test_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let records = vec![record(ScenarioId::Ticker, Protocol::Mcp)];
        write_json(&records, &path).unwrap();

        let document = load_json(&path).unwrap();
        assert_eq!(document.harness_version, HARNESS_VERSION);
        assert_eq!(document.records.len(), 1);
        assert_eq!(document.records[0].scenario, ScenarioId::Ticker);
    }

    #[test]
    fn test_markdown_compares_protocol_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        let records = vec![
            record(ScenarioId::LongTask, Protocol::Rest),
            record(ScenarioId::LongTask, Protocol::Mcp),
            // Unpaired record must not produce a comparison section.
            record(ScenarioId::Ticker, Protocol::Rest),
        ];
        write_markdown(&records, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("### long_task"));
        assert!(!contents.contains("### ticker"));
        assert!(contents.contains("| long_task | REST |"));
    }
}
