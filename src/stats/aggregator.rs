//! Statistics aggregation
//!
//! Collects per-worker statistics for one round and merges them into a single
//! aggregate view while preserving the per-worker details for diagnostics.
//!
//! Two kinds of input are tracked:
//!
//! - **Final results**: one [`TxStats`] per worker, reported at round end
//! - **Progress updates**: periodic `(submitted, committed)` pairs reported while
//!   the round runs
//!
//! # Example
//!
//! ```
//! use txpulse::stats::{TxStats, aggregator::StatisticsAggregator};
//! use txpulse::tx::TxStatus;
//!
//! let mut tx = TxStatus::with_create_time("a", 1_000);
//! tx.set_success_at(1_200);
//!
//! let mut aggregator = StatisticsAggregator::new();
//! aggregator.add_worker(0, TxStats::from_results(&[tx.clone()], false));
//! aggregator.add_worker(1, TxStats::from_results(&[tx], false));
//!
//! assert_eq!(aggregator.aggregate().succ, 2);
//! ```

use crate::stats::TxStats;
use std::collections::BTreeMap;

/// Per-round statistics aggregator
///
/// Workers are keyed by their client index. Merging happens in ascending worker
/// order so that the aggregate is reproducible.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    /// Final per-worker results (worker index → stats)
    workers: BTreeMap<usize, TxStats>,

    /// Running progress per worker
    progress: BTreeMap<usize, WorkerProgress>,

    /// Cached aggregate (computed on demand)
    aggregate_cache: Option<TxStats>,
}

/// Progress reported by one worker while a round runs
#[derive(Debug, Clone, Default)]
pub struct WorkerProgress {
    /// Transactions submitted so far
    pub submitted: u64,

    /// Committed statistics accumulated from every update window
    pub committed: TxStats,

    /// Number of updates received
    pub updates: u64,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the final result of a worker
    pub fn add_worker(&mut self, worker_id: usize, stats: TxStats) {
        self.workers.insert(worker_id, stats);
        self.aggregate_cache = None;
    }

    /// Fold a periodic update into the worker's running progress
    ///
    /// `submitted` is the count since the previous update; `committed` covers the
    /// transactions that finished in the same window.
    pub fn record_update(&mut self, worker_id: usize, submitted: u64, committed: &TxStats) {
        let entry = self.progress.entry(worker_id).or_default();
        entry.submitted += submitted;
        entry.committed = TxStats::merge_or_null(vec![entry.committed.clone(), committed.clone()]);
        entry.updates += 1;
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Merged statistics across all workers (null when nothing is valid)
    pub fn aggregate(&mut self) -> &TxStats {
        let workers = &self.workers;
        self.aggregate_cache
            .get_or_insert_with(|| TxStats::merge_or_null(workers.values().cloned().collect()))
    }

    pub fn worker_stats(&self, worker_id: usize) -> Option<&TxStats> {
        self.workers.get(&worker_id)
    }

    pub fn per_worker(&self) -> &BTreeMap<usize, TxStats> {
        &self.workers
    }

    pub fn worker_ids(&self) -> Vec<usize> {
        self.workers.keys().copied().collect()
    }

    pub fn progress(&self, worker_id: usize) -> Option<&WorkerProgress> {
        self.progress.get(&worker_id)
    }

    /// Totals across all workers: `(submitted, committed succ, committed fail)`
    pub fn progress_totals(&self) -> (u64, u64, u64) {
        self.progress.values().fold((0, 0, 0), |(s, c, f), p| {
            (s + p.submitted, c + p.committed.succ, f + p.committed.fail)
        })
    }

    /// Forget everything, ready for the next round
    pub fn clear(&mut self) {
        self.workers.clear();
        self.progress.clear();
        self.aggregate_cache = None;
    }
}
