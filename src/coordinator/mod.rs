//! Coordinator module
//!
//! Splits each round across the workers, dispatches it and collects the
//! per-worker results. Two implementations share the [`Coordinator`] trait:
//!
//! - [`local::LocalCoordinator`]: a pool of worker processes on this host
//! - [`crate::distributed::coordinator::DistributedCoordinator`]: agents reached
//!   through the coordination store

pub mod confirmation;
pub mod local;

use crate::protocol::{RoundLength, RoundMessage, WorkerMessage};
use crate::stats::aggregator::StatisticsAggregator;
use crate::stats::TxStats;
use crate::Result;
use async_trait::async_trait;
use confirmation::ConfirmationCorrelator;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum spacing of progress log lines
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Failures that end a round
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("worker {worker} exited unexpectedly: {reason}")]
    WorkerCrashed { worker: usize, reason: String },

    #[error("worker {worker} reported an error: {message}")]
    WorkerReported { worker: usize, message: String },

    #[error("failed to start remote test")]
    RemoteStartFailed,

    /// Some workers failed; results from the others are kept in `partial`
    #[error("round '{label}' failed: {}", describe(.failures))]
    RoundFailed {
        label: String,
        failures: Vec<CoordinatorError>,
        partial: Box<StatisticsAggregator>,
    },
}

fn describe(failures: &[CoordinatorError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runs rounds across a set of workers
#[async_trait]
pub trait Coordinator: Send {
    /// Number of workers a round is spread across
    fn worker_count(&self) -> usize;

    /// Run one round and return the final per-worker statistics
    ///
    /// `round` carries the totals for the whole round; the coordinator splits it
    /// per worker. Fails with [`CoordinatorError::RoundFailed`] if any worker
    /// crashed or reported an error.
    async fn start_test(&mut self, round: RoundMessage) -> Result<StatisticsAggregator>;

    /// Release the workers
    async fn stop(&mut self) -> Result<()>;
}

/// Split a round into one message per worker
///
/// A transaction count is divided evenly with the remainder going to the last
/// worker; with fewer transactions than workers every worker gets exactly one.
/// Trim is divided evenly. A duration is replicated unchanged.
pub fn partition(round: &RoundMessage, workers: usize) -> Result<Vec<RoundMessage>> {
    let workers = workers.max(1);
    let length = round.length()?;
    let n = workers as u64;

    Ok((0..workers)
        .map(|idx| {
            let mut msg = round.clone();
            msg.total_clients = workers;
            msg.clients = workers;
            msg.client_idx = idx;
            if let RoundLength::Count(total) = length {
                let share = if total < n {
                    1
                } else if idx == workers - 1 {
                    total / n + total % n
                } else {
                    total / n
                };
                msg.numb = Some(share);
                msg.trim = round.trim / n;
            }
            msg
        })
        .collect())
}

/// Bookkeeping for one round while worker messages come in
pub(crate) struct RoundCollector {
    label: String,
    aggregator: StatisticsAggregator,
    pending: BTreeSet<usize>,
    failures: Vec<CoordinatorError>,
    last_log: Instant,
}

impl RoundCollector {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            aggregator: StatisticsAggregator::new(),
            pending: BTreeSet::new(),
            failures: Vec::new(),
            last_log: Instant::now(),
        }
    }

    /// The round message reached this worker; wait for its terminal message
    pub(crate) fn dispatched(&mut self, worker: usize) {
        self.pending.insert(worker);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn is_pending(&self, worker: usize) -> bool {
        self.pending.contains(&worker)
    }

    pub(crate) fn pending(&self) -> Vec<usize> {
        self.pending.iter().copied().collect()
    }

    pub(crate) fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub(crate) fn fail(&mut self, error: CoordinatorError) {
        if let CoordinatorError::WorkerCrashed { worker, .. } | CoordinatorError::WorkerReported { worker, .. } = &error {
            self.pending.remove(worker);
        }
        self.failures.push(error);
    }

    pub(crate) fn on_message(
        &mut self,
        worker: usize,
        msg: WorkerMessage,
        correlator: Option<&mut ConfirmationCorrelator>,
    ) {
        match msg {
            WorkerMessage::TxUpdated { submitted, committed } => {
                self.aggregator.record_update(worker, submitted, &committed);
            }
            WorkerMessage::TxUpdatedWithConfirmation { submitted } => {
                let count = submitted.len() as u64;
                if let Some(correlator) = correlator {
                    correlator.submit(worker, submitted);
                }
                self.aggregator.record_update(worker, count, &TxStats::null());
            }
            WorkerMessage::TestResult(stats) => {
                debug!(worker, succ = stats.succ, fail = stats.fail, "Worker finished");
                self.aggregator.add_worker(worker, stats);
                self.pending.remove(&worker);
            }
            WorkerMessage::Error(message) => {
                warn!(worker, %message, "Worker reported an error");
                self.fail(CoordinatorError::WorkerReported { worker, message });
            }
        }

        if self.last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
            let (submitted, succ, fail) = self.aggregator.progress_totals();
            info!(
                round = %self.label,
                submitted,
                succ,
                fail,
                unfinished = submitted.saturating_sub(succ + fail),
                "Progress"
            );
            self.last_log = Instant::now();
        }
    }

    /// Replace the workers' own results with statistics over confirmed records
    pub(crate) fn apply_confirmed(&mut self, correlator: &ConfirmationCorrelator) {
        let mut confirmed = correlator.stats_by_worker();
        for worker in self.aggregator.worker_ids() {
            self.aggregator
                .add_worker(worker, confirmed.remove(&worker).unwrap_or_else(TxStats::null));
        }
    }

    pub(crate) fn finish(self) -> Result<StatisticsAggregator> {
        let mut aggregator = self.aggregator;
        if !self.failures.is_empty() {
            return Err(CoordinatorError::RoundFailed {
                label: self.label,
                failures: self.failures,
                partial: Box::new(aggregator),
            }
            .into());
        }
        let total = aggregator.aggregate();
        info!(round = %self.label, succ = total.succ, fail = total.fail, "Round complete");
        Ok(aggregator)
    }
}
