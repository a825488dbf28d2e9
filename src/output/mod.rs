//! Result reporting
//!
//! - `text`: the per-round results table printed to the console
//! - `json`: a machine-readable report of every round

pub mod json;
pub mod text;

use crate::stats::histogram::LatencyHistogram;
use crate::stats::TxStats;
use std::collections::BTreeMap;

/// Outcome of one round as reported to the user
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub label: String,

    /// 1-based
    pub round_idx: usize,

    /// Merged statistics (partial when the round failed)
    pub stats: TxStats,

    pub per_worker: BTreeMap<usize, TxStats>,

    pub error: Option<String>,
}

impl RoundSummary {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Latency at `percentile` from the retained per-transaction detail
    pub fn latency_percentile(&self, percentile: f64) -> Option<f64> {
        let detail = &self.stats.delay.as_ref()?.detail;
        if detail.is_empty() {
            return None;
        }
        LatencyHistogram::from_samples(detail).ok()?.percentile(percentile)
    }
}
