//! Per-round submission loop
//!
//! Drives one worker's share of a round:
//!
//! 1. Resolve the adapter and workload named in the round message and build the
//!    rate controller (an incompatible controller aborts the round here, before
//!    anything is submitted)
//! 2. Obtain an execution context from the adapter and initialize the workload
//! 3. Submit: each iteration starts `Workload::run` without awaiting it, then
//!    awaits the rate controller before the next iteration
//! 4. Join the outstanding iterations, end the workload, trim, compute the final
//!    statistics and release the context
//!
//! While the loop runs, a reporter task sends a `txUpdated` message upstream
//! every update interval with the transactions submitted and finished since the
//! previous one.
//!
//! ```text
//! iteration tasks --Completed--> reporter --txUpdated--> upstream
//! submission loop --Submitted-->    |
//!       ^                           |
//!       +------ results, windows ---+
//! ```

use crate::adapter::{Adapter, AdapterContext, AdapterRegistry, Workload, WorkloadRegistry};
use crate::protocol::{RoundLength, RoundMessage, WorkerMessage};
use crate::rate::{RateController, RateControllerRegistry};
use crate::stats::TxStats;
use crate::tx::TxStatus;
use crate::Result;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default spacing of `txUpdated` reports
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Events flowing into the reporter
#[derive(Debug)]
enum RunnerEvent {
    Submitted,
    Completed(Vec<TxStatus>),
}

/// What the reporter hands back to the submission loop
#[derive(Debug)]
enum Forward {
    Results(Vec<TxStatus>),
    Window(TxStats),
}

/// Mutable state of one round, created fresh for every round
#[derive(Debug, Default)]
struct RoundContext {
    /// Submission counter
    tx_num: u64,

    /// Every result received so far, in arrival order
    results: Vec<TxStatus>,

    /// `[cumulative, latest window]` once any data has arrived
    result_stats: Vec<TxStats>,
}

impl RoundContext {
    fn absorb(&mut self, forward: Forward) {
        if self.result_stats.is_empty() {
            self.result_stats = vec![TxStats::null(), TxStats::null()];
        }
        match forward {
            Forward::Results(results) => {
                for tx in &results {
                    self.result_stats[0].record(tx, false);
                }
                self.results.extend(results);
            }
            Forward::Window(window) => self.result_stats[1] = window,
        }
    }
}

/// Executes rounds for one worker
#[derive(Clone)]
pub struct WorkerRunner {
    adapters: AdapterRegistry,
    workloads: WorkloadRegistry,
    rate_controllers: RateControllerRegistry,
    update_interval: Duration,
}

impl WorkerRunner {
    pub fn new() -> Self {
        Self {
            adapters: AdapterRegistry::default(),
            workloads: WorkloadRegistry::default(),
            rate_controllers: RateControllerRegistry::default(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }

    pub fn with_registries(
        adapters: AdapterRegistry,
        workloads: WorkloadRegistry,
        rate_controllers: RateControllerRegistry,
    ) -> Self {
        Self {
            adapters,
            workloads,
            rate_controllers,
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Run a round and report its outcome upstream
    ///
    /// Progress updates are followed by exactly one terminal message:
    /// `testResult` on success, `error` otherwise.
    pub async fn handle_round(&self, msg: &RoundMessage, upstream: &UnboundedSender<WorkerMessage>) {
        let outcome = match self.run_round(msg, upstream.clone()).await {
            Ok(stats) => WorkerMessage::TestResult(stats),
            Err(e) => {
                error!(round = msg.round_idx, client = msg.client_idx, error = %format!("{:#}", e), "Round failed");
                WorkerMessage::Error(format!("{:#}", e))
            }
        };
        if upstream.send(outcome).is_err() {
            warn!("Upstream closed before the round result could be sent");
        }
    }

    /// Run a round, returning the final (trimmed) statistics
    pub async fn run_round(&self, msg: &RoundMessage, upstream: UnboundedSender<WorkerMessage>) -> Result<TxStats> {
        let length = msg.length()?;
        let adapter = self
            .adapters
            .create(&msg.config)
            .with_context(|| format!("Failed to load adapter for round '{}'", msg.label))?;
        let workload = self.workloads.create(&msg.cb)?;

        let mut controller = self
            .rate_controllers
            .create(&msg.rate_control)
            .with_context(|| format!("Failed to build rate controller for round '{}'", msg.label))?;
        controller
            .init(msg)
            .with_context(|| format!("Failed to initialize rate controller for round '{}'", msg.label))?;

        let client_args = msg.client_args();
        let context = adapter
            .get_context(&msg.label, &client_args, msg.client_idx)
            .await
            .context("Failed to obtain adapter context")?;

        let outcome = self
            .drive(msg, length, adapter.clone(), workload, controller.as_mut(), context.clone(), upstream)
            .await;

        let release = adapter.release_context(context).await;
        let stats = outcome?;
        release.context("Failed to release adapter context")?;
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        msg: &RoundMessage,
        length: RoundLength,
        adapter: Arc<dyn Adapter>,
        workload: Arc<dyn Workload>,
        controller: &mut dyn RateController,
        context: AdapterContext,
        upstream: UnboundedSender<WorkerMessage>,
    ) -> Result<TxStats> {
        workload
            .init(adapter.clone(), context, &msg.args)
            .await
            .context("Failed to initialize workload")?;

        info!(
            client = msg.client_idx,
            round = msg.round_idx,
            label = %msg.label,
            mode = match length {
                RoundLength::Count(_) => "count",
                RoundLength::Duration(_) => "duration",
            },
            info = workload.info(),
            "Starting round"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(report(
            events_rx,
            forward_tx,
            upstream,
            adapter.clone(),
            self.update_interval,
            msg.confirmation,
        ));

        let mut ctx = RoundContext::default();
        let mut iterations = JoinSet::new();
        let start = Instant::now();

        loop {
            let more = match length {
                RoundLength::Count(numb) => ctx.tx_num < numb,
                RoundLength::Duration(seconds) => start.elapsed() < Duration::from_secs(seconds),
            };
            if !more {
                break;
            }

            let run = workload.clone();
            let events = events_tx.clone();
            let idx = ctx.tx_num;
            ctx.tx_num += 1;
            iterations.spawn(async move {
                let results = match run.run().await {
                    Ok(results) => results,
                    Err(e) => vec![failed_iteration(idx, &e)],
                };
                let _ = events.send(RunnerEvent::Completed(results));
            });
            let _ = events_tx.send(RunnerEvent::Submitted);

            while let Ok(forward) = forward_rx.try_recv() {
                ctx.absorb(forward);
            }

            controller
                .apply_rate_control(start, idx, &ctx.results, &ctx.result_stats)
                .await;

            while let Some(joined) = iterations.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "Iteration task aborted");
                }
            }
            tokio::task::yield_now().await;
        }

        while let Some(joined) = iterations.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Iteration task aborted");
            }
        }
        drop(events_tx);
        reporter.await.context("Reporter task failed")?;
        while let Some(forward) = forward_rx.recv().await {
            ctx.absorb(forward);
        }

        debug!(
            client = msg.client_idx,
            submitted = ctx.tx_num,
            finished = ctx.results.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Submission loop finished"
        );

        if let Err(e) = controller.end().await {
            warn!(error = %format!("{:#}", e), "Rate controller failed to end cleanly");
        }
        workload.end(&ctx.results).await.context("Workload end failed")?;

        let results = trim_results(ctx.results, msg.trim, length);
        let mut stats = TxStats::from_results(&results, true);
        adapter.get_default_tx_stats(&mut stats, &results);
        Ok(stats)
    }
}

impl Default for WorkerRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Record a workload error as a failed transaction
fn failed_iteration(idx: u64, error: &anyhow::Error) -> TxStatus {
    let mut tx = TxStatus::new(format!("failed-{}", idx));
    tx.set_failed();
    tx.set_error_message(0, format!("{:#}", error));
    tx
}

/// Reporter task: periodic progress upstream, results back to the loop
async fn report(
    mut events: UnboundedReceiver<RunnerEvent>,
    forward: UnboundedSender<Forward>,
    upstream: UnboundedSender<WorkerMessage>,
    adapter: Arc<dyn Adapter>,
    interval: Duration,
    confirmation: bool,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut submitted = 0u64;
    let mut window: Vec<TxStatus> = Vec::new();

    let flush = |submitted: &mut u64, window: &mut Vec<TxStatus>| {
        if *submitted == 0 && window.is_empty() {
            return;
        }
        let finished = std::mem::take(window);
        let stats = if finished.is_empty() {
            TxStats::null()
        } else {
            let mut stats = TxStats::from_results(&finished, false);
            adapter.get_default_tx_stats(&mut stats, &finished);
            stats
        };
        let message = if confirmation {
            WorkerMessage::TxUpdatedWithConfirmation { submitted: finished }
        } else {
            WorkerMessage::TxUpdated {
                submitted: *submitted,
                committed: stats.clone(),
            }
        };
        let _ = upstream.send(message);
        let _ = forward.send(Forward::Window(stats));
        *submitted = 0;
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RunnerEvent::Submitted) => submitted += 1,
                Some(RunnerEvent::Completed(results)) => {
                    window.extend(results.iter().cloned());
                    let _ = forward.send(Forward::Results(results));
                }
                None => break,
            },
            _ = ticker.tick() => flush(&mut submitted, &mut window),
        }
    }
    flush(&mut submitted, &mut window);
}

/// Drop `trim` samples from both ends of the round
///
/// Count-bounded rounds trim `trim` transactions; duration-bounded rounds treat
/// `trim` as seconds and convert it with the observed sample density. Results
/// are ordered by submission time first since completion order is arbitrary.
/// If the cut would consume everything, nothing is kept.
pub fn trim_results(mut results: Vec<TxStatus>, trim: u64, length: RoundLength) -> Vec<TxStatus> {
    if trim == 0 || results.is_empty() {
        return results;
    }
    let cut = match length {
        RoundLength::Count(_) => trim as usize,
        RoundLength::Duration(seconds) if seconds > 0 => {
            (trim as f64 * (results.len() as f64 / seconds as f64)).floor() as usize
        }
        RoundLength::Duration(_) => 0,
    };
    if cut == 0 {
        return results;
    }
    if 2 * cut >= results.len() {
        return Vec::new();
    }

    results.sort_by_key(|tx| tx.time_create);
    let end = results.len() - cut;
    results.truncate(end);
    results.drain(..cut);
    results
}
