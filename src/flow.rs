//! Benchmark flow
//!
//! Prepares the adapter once, expands every configured round into its
//! individual runs and drives them through a [`Coordinator`], pausing between
//! runs. A failed run is reported with whatever partial data the coordinator
//! recovered and the flow moves on to the next one.

use crate::adapter::AdapterRegistry;
use crate::config::{BenchConfig, ClientMode, RoundConfig};
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::output::json::{write_json_output, JsonReport};
use crate::output::text::{print_round_results, print_summary};
use crate::output::RoundSummary;
use crate::protocol::{RateControlSpec, RoundMessage};
use crate::stats::aggregator::StatisticsAggregator;
use crate::Result;
use anyhow::Context;
use std::time::Duration;
use tracing::{error, info, warn};

/// Expand one configured round into a message per run
///
/// Runs are numbered from `first_idx`. A missing rate control falls back to
/// the default fixed rate.
pub fn expand_round(
    round: &RoundConfig,
    adapter_ref: &str,
    clients: usize,
    first_idx: usize,
) -> Vec<RoundMessage> {
    (0..round.round_count())
        .filter_map(|i| {
            let mut msg = match (round.tx_number.get(i), round.tx_duration.get(i)) {
                (Some(&numb), _) => RoundMessage::count(&round.label, numb),
                (None, Some(&secs)) => RoundMessage::duration(&round.label, secs),
                (None, None) => return None,
            };
            msg.rate_control = round
                .rate_control
                .get(i)
                .cloned()
                .unwrap_or_else(RateControlSpec::default_fixed);
            msg.trim = round.trim;
            msg.args = round.arguments.clone();
            msg.cb = round.callback.clone();
            msg.config = adapter_ref.to_string();
            msg.total_clients = clients;
            msg.clients = clients;
            msg.round_idx = first_idx + i;
            msg.confirmation = round.confirmation;
            Some(msg)
        })
        .collect()
}

fn summarize(label: String, round_idx: usize, mut aggregator: StatisticsAggregator, error: Option<String>) -> RoundSummary {
    let stats = aggregator.aggregate().clone();
    RoundSummary {
        label,
        round_idx,
        stats,
        per_worker: aggregator.per_worker().clone(),
        error,
    }
}

/// Runs a benchmark configuration against a coordinator
pub struct BenchmarkFlow {
    config: BenchConfig,
    adapters: AdapterRegistry,
}

impl BenchmarkFlow {
    pub fn new(config: BenchConfig) -> Self {
        Self::with_adapters(config, AdapterRegistry::with_builtins())
    }

    pub fn with_adapters(config: BenchConfig, adapters: AdapterRegistry) -> Self {
        Self { config, adapters }
    }

    /// Number of clients rounds are spread across
    fn client_count(&self, coordinator: &dyn Coordinator) -> usize {
        match self.config.clients.mode {
            ClientMode::Local => self.config.clients.number,
            ClientMode::Distributed => coordinator.worker_count().max(1),
        }
    }

    /// Run every round and return their summaries in order
    pub async fn run(&self, coordinator: &mut dyn Coordinator) -> Result<Vec<RoundSummary>> {
        let adapter_ref = self.config.adapter.reference();
        let adapter = self.adapters.create(&adapter_ref)?;
        let clients = self.client_count(coordinator);

        adapter
            .init()
            .await
            .with_context(|| format!("Failed to initialize adapter '{}'", adapter.name()))?;
        adapter
            .install_smart_contract()
            .await
            .context("Failed to install smart contract")?;
        let clientargs = adapter
            .prepare_clients(clients)
            .await
            .context("Failed to prepare clients")?;

        let test = &self.config.test;
        let mut runs = Vec::new();
        for round in &test.rounds {
            runs.extend(expand_round(round, &adapter_ref, clients, runs.len() + 1));
        }
        info!(
            test = %test.name,
            rounds = runs.len(),
            clients,
            adapter = %adapter.name(),
            "Starting benchmark"
        );

        let pause = Duration::from_secs(test.pause_secs);
        let total = runs.len();
        let mut summaries = Vec::with_capacity(total);
        for mut msg in runs {
            msg.clientargs = clientargs.clone();
            let label = msg.label.clone();
            let round_idx = msg.round_idx;
            info!(round = round_idx, label = %label, "Round started");

            let summary = match coordinator.start_test(msg).await {
                Ok(aggregator) => summarize(label, round_idx, aggregator, None),
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(round = round_idx, label = %label, "Round failed: {}", message);
                    match e.downcast::<CoordinatorError>() {
                        Ok(CoordinatorError::RoundFailed { partial, .. }) => {
                            let partial = *partial;
                            if partial.num_workers() > 0 {
                                warn!(
                                    round = round_idx,
                                    workers = partial.num_workers(),
                                    "Reporting partial results"
                                );
                            }
                            summarize(label, round_idx, partial, Some(message))
                        }
                        _ => summarize(label, round_idx, StatisticsAggregator::new(), Some(message)),
                    }
                }
            };
            print_round_results(&summary);
            summaries.push(summary);

            if round_idx < total && !pause.is_zero() {
                info!("Waiting {} seconds before the next round", pause.as_secs());
                tokio::time::sleep(pause).await;
            }
        }

        print_summary(&test.name, &summaries);
        if let Some(ref path) = self.config.output.json {
            let description = (!test.description.is_empty()).then_some(test.description.as_str());
            let report = JsonReport::new(&test.name, description, &summaries);
            write_json_output(path, &report)?;
            info!(path = %path.display(), "Wrote JSON report");
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::toml::parse_toml_string;
    use crate::coordinator::local::{InProcessLauncher, LocalCoordinator};
    use std::sync::Arc;

    const CONFIG: &str = r#"
[clients]
number = 2

[adapter]
name = "mock"

[test]
name = "flow"
pause_secs = 1

[[test.rounds]]
label = "open"
tx_number = [20, 40]
rate_control = [
    { type = "fixed-rate", opts = { tps = 100 } },
    { type = "linear-rate", opts = { startingTps = 50, finishingTps = 100 } },
]
callback = "simple-open"

[[test.rounds]]
label = "query"
tx_duration = [2]
rate_control = [{ type = "fixed-rate", opts = { tps = 50 } }]
callback = "simple-query"
"#;

    #[test]
    fn test_expand_round() {
        let config = parse_toml_string(CONFIG).unwrap();
        let runs = expand_round(&config.test.rounds[0], "mock", 2, 1);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].numb, Some(20));
        assert_eq!(runs[1].numb, Some(40));
        assert_eq!(runs[1].round_idx, 2);
        assert_eq!(runs[0].rate_control.kind, "fixed-rate");
        assert_eq!(runs[1].rate_control.kind, "linear-rate");
        assert_eq!(runs[0].total_clients, 2);
        assert_eq!(runs[0].cb, "simple-open");

        let runs = expand_round(&config.test.rounds[1], "mock", 2, 3);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].tx_duration, Some(2));
        assert_eq!(runs[0].numb, None);
        assert_eq!(runs[0].round_idx, 3);

        let mut bare = config.test.rounds[1].clone();
        bare.rate_control.clear();
        let runs = expand_round(&bare, "mock", 1, 1);
        assert_eq!(runs[0].rate_control, RateControlSpec::default_fixed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_runs_every_round() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("report.json");
        let mut config = parse_toml_string(CONFIG).unwrap();
        config.output.json = Some(json_path.clone());
        crate::config::validator::validate_config(&config).unwrap();

        let mut coordinator = LocalCoordinator::new(Arc::new(InProcessLauncher::default()));
        let flow = BenchmarkFlow::new(config);
        let summaries = flow.run(&mut coordinator).await.unwrap();
        coordinator.stop().await.unwrap();

        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|s| s.succeeded()));
        assert_eq!(summaries[0].stats.succ, 20);
        assert_eq!(summaries[1].stats.succ, 40);
        assert_eq!(summaries[1].per_worker.len(), 2);
        assert_eq!(summaries[2].label, "query");
        assert!(summaries[2].stats.succ > 0);

        let report: JsonReport =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(report.rounds.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_round_is_reported() {
        let mut config = parse_toml_string(CONFIG).unwrap();
        config.test.pause_secs = 0;
        config.test.rounds.truncate(1);
        config.test.rounds[0].tx_number = vec![10];
        config.test.rounds[0].rate_control = vec![RateControlSpec::new("zero-rate", serde_json::Value::Null)];

        let mut coordinator = LocalCoordinator::new(Arc::new(InProcessLauncher::default()));
        let summaries = BenchmarkFlow::new(config).run(&mut coordinator).await.unwrap();
        coordinator.stop().await.unwrap();

        assert_eq!(summaries.len(), 1);
        let error = summaries[0].error.as_deref().unwrap();
        assert!(error.contains("zero-rate"), "{}", error);
        assert_eq!(summaries[0].stats.succ, 0);
    }

    #[tokio::test]
    async fn test_unknown_adapter() {
        let mut config = parse_toml_string(CONFIG).unwrap();
        config.adapter.name = "fabric".to_string();
        let mut coordinator = LocalCoordinator::new(Arc::new(InProcessLauncher::default()));
        let err = BenchmarkFlow::new(config).run(&mut coordinator).await.unwrap_err();
        assert!(err.to_string().contains("fabric"));
    }
}
