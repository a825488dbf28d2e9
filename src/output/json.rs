//! JSON report output
//!
//! One document per run: test metadata, then every round with its merged
//! statistics, latency percentiles and per-worker breakdown.

use super::RoundSummary;
use crate::stats::TxStats;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Test information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTestInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub generated_at: String,
}

/// Latency statistics in seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonLatency {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p75: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonWorker {
    pub worker: usize,
    pub succ: u64,
    pub fail: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonRoundStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRound {
    pub label: String,
    pub round_idx: usize,
    pub status: JsonRoundStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub succ: u64,
    pub fail: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_rate: Option<f64>,
    pub latency: JsonLatency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
    pub workers: Vec<JsonWorker>,
}

/// Complete JSON report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    pub test_info: JsonTestInfo,
    pub rounds: Vec<JsonRound>,
}

impl JsonReport {
    pub fn new(name: &str, description: Option<&str>, rounds: &[RoundSummary]) -> Self {
        let hostname = hostname::get().ok().and_then(|h| h.into_string().ok());
        Self {
            test_info: JsonTestInfo {
                name: name.to_string(),
                description: description.map(str::to_string),
                hostname,
                generated_at: chrono::Utc::now().to_rfc3339(),
            },
            rounds: rounds.iter().map(round_to_json).collect(),
        }
    }
}

fn latency(summary: &RoundSummary) -> JsonLatency {
    let stats = &summary.stats;
    let Some(delay) = stats.delay.as_ref() else {
        return JsonLatency::default();
    };
    JsonLatency {
        min: Some(delay.min),
        max: Some(delay.max),
        avg: stats.avg_delay(),
        p50: summary.latency_percentile(50.0),
        p75: summary.latency_percentile(75.0),
        p95: summary.latency_percentile(95.0),
        p99: summary.latency_percentile(99.0),
    }
}

fn worker_to_json(worker: usize, stats: &TxStats) -> JsonWorker {
    JsonWorker {
        worker,
        succ: stats.succ,
        fail: stats.fail,
        avg_latency: stats.avg_delay(),
    }
}

pub fn round_to_json(summary: &RoundSummary) -> JsonRound {
    let status = if summary.succeeded() {
        JsonRoundStatus::Completed
    } else {
        JsonRoundStatus::Failed
    };
    JsonRound {
        label: summary.label.clone(),
        round_idx: summary.round_idx,
        status,
        error: summary.error.clone(),
        succ: summary.stats.succ,
        fail: summary.stats.fail,
        send_rate: summary.stats.send_rate(),
        latency: latency(summary),
        throughput: summary.stats.throughput(),
        workers: summary
            .per_worker
            .iter()
            .map(|(id, stats)| worker_to_json(*id, stats))
            .collect(),
    }
}

/// Write the report to `output_path`
pub fn write_json_output(output_path: &Path, report: &JsonReport) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON output {}", output_path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)
        .with_context(|| format!("Failed to write JSON output {}", output_path.display()))?;
    Ok(())
}
