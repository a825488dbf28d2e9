//! Local coordinator
//!
//! Runs each worker as a child process on this host and talks to it over its
//! stdin/stdout with framed MessagePack. The pool is kept between rounds and only
//! re-created when a round needs a different number of workers (or after a
//! worker died).
//!
//! # Round lifecycle
//!
//! 1. Ensure the pool has one worker per client
//! 2. Partition the round and send each worker its share
//! 3. Collect `txUpdated` progress and exactly one terminal message per worker
//! 4. In confirmation mode, wait for the out-of-band source to confirm the
//!    submitted transactions, then rebuild the statistics from the confirmed
//!    records
//!
//! Any crash or worker-reported error fails the round, but the results of the
//! remaining workers are returned inside [`CoordinatorError::RoundFailed`].

use super::confirmation::{Confirmation, ConfirmationCorrelator, ConfirmationSettings};
use super::{partition, Coordinator, CoordinatorError, RoundCollector};
use crate::protocol::{read_message, write_message, CoordinatorMessage, RoundMessage, WorkerMessage};
use crate::stats::aggregator::StatisticsAggregator;
use crate::worker::process::serve;
use crate::worker::WorkerRunner;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a worker gets to exit after `quit`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Streams connected to a freshly launched worker
pub struct WorkerHandle {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: Box<dyn AsyncRead + Send + Unpin>,

    /// The OS process, when the worker is one
    pub process: Option<Child>,
}

/// Starts workers for the pool
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, worker: usize) -> Result<WorkerHandle>;
}

/// Launches workers as child processes running `<program> <args...>`
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run the current executable in worker mode
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the current executable")?;
        Ok(Self::new(program, vec!["--mode".to_string(), "worker".to_string()]))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, worker: usize) -> Result<WorkerHandle> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker {} ({})", worker, self.program.display()))?;

        let input = child.stdin.take().context("Worker stdin not captured")?;
        let output = child.stdout.take().context("Worker stdout not captured")?;
        debug!(worker, pid = ?child.id(), "Spawned worker process");

        Ok(WorkerHandle {
            input: Box::new(input),
            output: Box::new(output),
            process: Some(child),
        })
    }
}

/// Runs workers as tasks inside this process, connected by in-memory pipes
#[derive(Clone, Default)]
pub struct InProcessLauncher {
    runner: WorkerRunner,
}

impl InProcessLauncher {
    pub fn new(runner: WorkerRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, worker: usize) -> Result<WorkerHandle> {
        let (parent, child) = tokio::io::duplex(1 << 20);
        let (child_read, child_write) = tokio::io::split(child);
        let (parent_read, parent_write) = tokio::io::split(parent);
        let runner = self.runner.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(child_read, child_write, runner).await {
                warn!(worker, error = %format!("{:#}", e), "In-process worker stopped");
            }
        });
        Ok(WorkerHandle {
            input: Box::new(parent_write),
            output: Box::new(parent_read),
            process: None,
        })
    }
}

/// What a worker's output stream produced
#[derive(Debug)]
enum WorkerEvent {
    Message(WorkerMessage),

    /// Stream ended, with the read error if there was one
    Closed(Option<String>),
}

struct PooledWorker {
    idx: usize,
    input: Box<dyn AsyncWrite + Send + Unpin>,
    process: Option<Child>,
}

/// Process-pool coordinator for a single host
pub struct LocalCoordinator {
    launcher: Arc<dyn WorkerLauncher>,
    pool: Vec<PooledWorker>,
    events: Option<UnboundedReceiver<(usize, WorkerEvent)>>,
    confirmations: Option<UnboundedReceiver<Confirmation>>,
    confirmation_settings: ConfirmationSettings,
}

impl LocalCoordinator {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            pool: Vec::new(),
            events: None,
            confirmations: None,
            confirmation_settings: ConfirmationSettings::default(),
        }
    }

    /// Enable confirmation mode with the given confirmation source
    pub fn with_confirmation(
        mut self,
        source: UnboundedReceiver<Confirmation>,
        settings: ConfirmationSettings,
    ) -> Self {
        self.confirmations = Some(source);
        self.confirmation_settings = settings;
        self
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    async fn ensure_pool(&mut self, workers: usize) -> Result<()> {
        if self.pool.len() == workers && self.events.is_some() {
            return Ok(());
        }
        self.shutdown_pool().await;

        let (tx, rx) = mpsc::unbounded_channel();
        for idx in 0..workers {
            let handle = self.launcher.launch(idx).await?;
            tokio::spawn(forward_output(idx, handle.output, tx.clone()));
            self.pool.push(PooledWorker {
                idx,
                input: handle.input,
                process: handle.process,
            });
        }
        self.events = Some(rx);
        info!(workers, "Worker pool ready");
        Ok(())
    }

    async fn shutdown_pool(&mut self) {
        for mut worker in self.pool.drain(..) {
            if let Err(e) = write_message(&mut worker.input, &CoordinatorMessage::Quit).await {
                debug!(worker = worker.idx, error = %e, "Worker already gone");
            }
            drop(worker.input);
            if let Some(mut child) = worker.process.take() {
                match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(Ok(status)) => debug!(worker = worker.idx, %status, "Worker exited"),
                    Ok(Err(e)) => warn!(worker = worker.idx, error = %e, "Failed to reap worker"),
                    Err(_) => {
                        warn!(worker = worker.idx, "Worker ignored quit, killing it");
                        let _ = child.kill().await;
                    }
                }
            }
        }
        self.events = None;
    }

    /// Describe why a worker's stream closed, reaping the process if there is one
    async fn exit_reason(&mut self, idx: usize, read_error: Option<String>) -> String {
        let status = match self.pool.iter_mut().find(|w| w.idx == idx).and_then(|w| w.process.as_mut()) {
            Some(child) => match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => Some(status.to_string()),
                _ => None,
            },
            None => None,
        };
        match (status, read_error) {
            (Some(status), Some(e)) => format!("{} ({})", status, e),
            (Some(status), None) => status,
            (None, Some(e)) => e,
            (None, None) => "output closed".to_string(),
        }
    }

    async fn run_round(
        &mut self,
        events: &mut UnboundedReceiver<(usize, WorkerEvent)>,
        round: RoundMessage,
    ) -> Result<(RoundCollector, bool)> {
        let messages = partition(&round, self.pool.len())?;
        let mut collector = RoundCollector::new(round.label.clone());
        let mut broken = false;

        for (worker, msg) in self.pool.iter_mut().zip(messages) {
            match write_message(&mut worker.input, &CoordinatorMessage::Test(msg)).await {
                Ok(()) => collector.dispatched(worker.idx),
                Err(e) => {
                    broken = true;
                    collector.fail(CoordinatorError::WorkerCrashed {
                        worker: worker.idx,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        let mut correlator = round.confirmation.then(ConfirmationCorrelator::new);

        while !collector.is_done() {
            tokio::select! {
                event = events.recv() => match event {
                    Some((idx, WorkerEvent::Message(msg))) => collector.on_message(idx, msg, correlator.as_mut()),
                    Some((idx, WorkerEvent::Closed(read_error))) => {
                        broken = true;
                        if collector.is_pending(idx) {
                            let reason = self.exit_reason(idx, read_error).await;
                            warn!(worker = idx, %reason, "Worker exited during round");
                            collector.fail(CoordinatorError::WorkerCrashed { worker: idx, reason });
                        }
                    }
                    None => {
                        broken = true;
                        for idx in collector.pending() {
                            collector.fail(CoordinatorError::WorkerCrashed {
                                worker: idx,
                                reason: "output closed".to_string(),
                            });
                        }
                    }
                },
                Some(confirmation) = next_confirmation(&mut self.confirmations) => {
                    if let Some(c) = correlator.as_mut() {
                        c.confirm(confirmation);
                    }
                }
            }
        }

        if let Some(mut correlator) = correlator {
            if !collector.has_failures() {
                self.settle(&mut correlator).await;
                collector.apply_confirmed(&correlator);
            }
        }

        Ok((collector, broken))
    }

    /// Wait until every submission is confirmed or the wait limit passes
    async fn settle(&mut self, correlator: &mut ConfirmationCorrelator) {
        if self.confirmations.is_none() {
            warn!("Confirmation mode without a confirmation source, nothing will be confirmed");
            return;
        }
        let settings = self.confirmation_settings;
        let started = Instant::now();
        let mut retry = tokio::time::interval(settings.retry_interval);
        retry.tick().await;

        while !correlator.is_settled() {
            tokio::select! {
                Some(confirmation) = next_confirmation(&mut self.confirmations) => {
                    correlator.confirm(confirmation);
                }
                _ = retry.tick() => {
                    info!(
                        submitted = correlator.submitted(),
                        committed = correlator.committed(),
                        unconfirmed = correlator.unconfirmed(),
                        "Waiting for confirmations"
                    );
                    if settings.max_wait.is_some_and(|max| started.elapsed() >= max) {
                        warn!(unconfirmed = correlator.unconfirmed(), "Gave up waiting for confirmations");
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    fn worker_count(&self) -> usize {
        self.pool.len()
    }

    async fn start_test(&mut self, round: RoundMessage) -> Result<StatisticsAggregator> {
        let workers = round.client_count();
        self.ensure_pool(workers).await?;
        let mut events = self.events.take().context("Worker pool has no event channel")?;

        let outcome = self.run_round(&mut events, round).await;
        self.events = Some(events);
        let (collector, broken) = outcome?;

        if broken {
            self.shutdown_pool().await;
        }
        collector.finish()
    }

    async fn stop(&mut self) -> Result<()> {
        self.shutdown_pool().await;
        Ok(())
    }
}

async fn forward_output(
    idx: usize,
    mut output: Box<dyn AsyncRead + Send + Unpin>,
    events: UnboundedSender<(usize, WorkerEvent)>,
) {
    loop {
        match read_message::<_, WorkerMessage>(&mut output).await {
            Ok(Some(msg)) => {
                if events.send((idx, WorkerEvent::Message(msg))).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = events.send((idx, WorkerEvent::Closed(None)));
                return;
            }
            Err(e) => {
                let _ = events.send((idx, WorkerEvent::Closed(Some(format!("{:#}", e)))));
                return;
            }
        }
    }
}

async fn next_confirmation(source: &mut Option<UnboundedReceiver<Confirmation>>) -> Option<Confirmation> {
    match source {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RateControlSpec;
    use crate::util::time::now_millis;

    fn round(numb: u64, clients: usize) -> RoundMessage {
        let mut msg = RoundMessage::count("local", numb);
        msg.cb = "simple-open".to_string();
        msg.config = "mock".to_string();
        msg.total_clients = clients;
        msg.clients = clients;
        msg.rate_control = RateControlSpec::new("fixed-rate", serde_json::json!({"tps": 200}));
        msg
    }

    fn coordinator() -> LocalCoordinator {
        LocalCoordinator::new(Arc::new(InProcessLauncher::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_across_workers() {
        let mut coordinator = coordinator();
        let mut result = coordinator.start_test(round(30, 3)).await.unwrap();

        assert_eq!(result.num_workers(), 3);
        assert_eq!(result.aggregate().succ, 30);
        assert_eq!(result.worker_stats(2).unwrap().succ, 10);
        assert_eq!(coordinator.worker_count(), 3);
        coordinator.stop().await.unwrap();
        assert_eq!(coordinator.pool_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_resized_between_rounds() {
        let mut coordinator = coordinator();
        coordinator.start_test(round(4, 2)).await.unwrap();
        assert_eq!(coordinator.pool_size(), 2);
        let mut result = coordinator.start_test(round(9, 3)).await.unwrap();
        assert_eq!(coordinator.pool_size(), 3);
        assert_eq!(result.aggregate().succ, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_error_fails_round_and_keeps_partial() {
        let mut coordinator = coordinator();
        let mut msg = round(6, 2);
        msg.rate_control = RateControlSpec::new("zero-rate", serde_json::Value::Null);
        let err = coordinator.start_test(msg).await.unwrap_err();
        match err.downcast_ref::<CoordinatorError>() {
            Some(CoordinatorError::RoundFailed { failures, partial, .. }) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(partial.num_workers(), 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    struct BrokenLauncher;

    #[async_trait]
    impl WorkerLauncher for BrokenLauncher {
        async fn launch(&self, worker: usize) -> Result<WorkerHandle> {
            if worker == 0 {
                return InProcessLauncher::default().launch(worker).await;
            }
            // A worker that dies as soon as it is started
            let (parent, child) = tokio::io::duplex(64);
            drop(child);
            let (read, write) = tokio::io::split(parent);
            Ok(WorkerHandle {
                input: Box::new(write),
                output: Box::new(read),
                process: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_worker_preserves_partial_data() {
        let mut coordinator = LocalCoordinator::new(Arc::new(BrokenLauncher));
        let err = coordinator.start_test(round(10, 2)).await.unwrap_err();
        match err.downcast_ref::<CoordinatorError>() {
            Some(CoordinatorError::RoundFailed { failures, partial, .. }) => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(failures[0], CoordinatorError::WorkerCrashed { worker: 1, .. }));
                assert_eq!(partial.worker_stats(0).unwrap().succ, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        // pool is rebuilt for the next round
        assert_eq!(coordinator.pool_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_mode() {
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        let mut coordinator = coordinator().with_confirmation(
            confirm_rx,
            ConfirmationSettings {
                retry_interval: Duration::from_millis(100),
                max_wait: Some(Duration::from_secs(2)),
            },
        );

        // Mock ids are "mock-<client>-<n>"; these confirmations all arrive
        // before the submissions they refer to
        let valid_time = now_millis() + 1_000;
        for n in 0..4 {
            confirm_tx
                .send(Confirmation { id: format!("mock-0-{}", n), valid_time })
                .unwrap();
        }
        let mut msg = round(4, 1);
        msg.confirmation = true;
        let mut result = coordinator.start_test(msg).await.unwrap();
        let stats = result.aggregate();
        assert_eq!(stats.succ, 4);
        assert!(stats.delay.as_ref().unwrap().min > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_gives_up_after_max_wait() {
        let (_confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        let mut coordinator = coordinator().with_confirmation(
            confirm_rx,
            ConfirmationSettings {
                retry_interval: Duration::from_millis(100),
                max_wait: Some(Duration::from_millis(500)),
            },
        );
        let mut msg = round(3, 1);
        msg.confirmation = true;
        let mut result = coordinator.start_test(msg).await.unwrap();
        // nothing confirmed, nothing committed
        assert_eq!(result.aggregate().total(), 0);
    }
}
