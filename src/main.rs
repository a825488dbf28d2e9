//! TxPulse CLI entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use txpulse::config::cli::{Cli, ExecutionMode};
use txpulse::config::toml::{merge_cli_with_config, parse_toml_file};
use txpulse::config::validator::validate_config;
use txpulse::config::{BenchConfig, ClientMode};
use txpulse::coordinator::confirmation::{ConfirmationListener, ConfirmationSettings};
use txpulse::coordinator::local::{LocalCoordinator, ProcessLauncher};
use txpulse::coordinator::Coordinator;
use txpulse::distributed::remote::{RemoteStore, StoreServer};
use txpulse::distributed::store::CoordinationStore;
use txpulse::distributed::{Agent, DistributedCoordinator};
use txpulse::flow::BenchmarkFlow;
use txpulse::worker::process::run_stdio;
use txpulse::worker::WorkerRunner;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(&cli.log_level);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(async {
        match cli.mode {
            ExecutionMode::Worker => run_stdio().await,
            ExecutionMode::Agent => run_agent(&cli).await,
            ExecutionMode::Store => run_store(&cli).await,
            ExecutionMode::Standalone | ExecutionMode::Coordinator => run_benchmark(&cli).await,
        }
    })
}

/// Log to stderr so worker stdout stays a clean protocol channel
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel the returned token on Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
        }
        trigger.cancel();
    });
    token
}

fn load_config(cli: &Cli) -> Result<BenchConfig> {
    let path = cli
        .config
        .as_ref()
        .context("A benchmark configuration file is required in this mode")?;
    let config = parse_toml_file(path)?;
    let config = merge_cli_with_config(cli, config);
    validate_config(&config)?;
    Ok(config)
}

fn store_address(cli: &Cli, config: Option<&BenchConfig>) -> Result<String> {
    cli.store
        .clone()
        .or_else(|| config.and_then(|c| c.clients.store.clone()))
        .context("No coordination store address given (--store)")
}

async fn run_benchmark(cli: &Cli) -> Result<()> {
    println!("TxPulse v{}", env!("CARGO_PKG_VERSION"));
    let config = load_config(cli)?;
    info!(
        test = %config.test.name,
        mode = %config.clients.mode,
        clients = config.clients.number,
        "Loaded configuration"
    );

    let mut coordinator: Box<dyn Coordinator> = match config.clients.mode {
        ClientMode::Local => Box::new(local_coordinator(&config).await?),
        ClientMode::Distributed => {
            let addr = store_address(cli, Some(&config))?;
            let store: Arc<dyn CoordinationStore> = Arc::new(RemoteStore::connect(&addr).await?);
            let coordinator = DistributedCoordinator::wait_for_agents(
                store,
                &config.clients.root,
                config.clients.number,
                Duration::from_secs(config.clients.agent_timeout_secs),
            )
            .await?;
            Box::new(coordinator)
        }
    };

    let flow = BenchmarkFlow::new(config);
    let outcome = flow.run(&mut *coordinator).await;
    if let Err(e) = coordinator.stop().await {
        warn!(error = %format!("{:#}", e), "Failed to release workers");
    }
    let summaries = outcome?;

    let failed = summaries.iter().filter(|s| !s.succeeded()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} round(s) failed", failed, summaries.len());
    }
    Ok(())
}

async fn local_coordinator(config: &BenchConfig) -> Result<LocalCoordinator> {
    let launcher = match config.clients.worker_command {
        Some(ref command) => match command.split_first() {
            Some((program, args)) => ProcessLauncher::new(program, args.to_vec()),
            None => anyhow::bail!("worker_command must not be empty"),
        },
        None => ProcessLauncher::current_exe()?,
    };
    let coordinator = LocalCoordinator::new(Arc::new(launcher));

    let Some(ref confirmation) = config.clients.confirmation else {
        return Ok(coordinator);
    };
    let listener = ConfirmationListener::bind(&confirmation.listen).await?;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = listener.run(tx).await {
            warn!(error = %format!("{:#}", e), "Confirmation listener stopped");
        }
    });
    let settings = ConfirmationSettings {
        retry_interval: Duration::from_secs(confirmation.retry_interval_secs),
        max_wait: confirmation.max_wait_secs.map(Duration::from_secs),
    };
    Ok(coordinator.with_confirmation(rx, settings))
}

async fn run_agent(cli: &Cli) -> Result<()> {
    let addr = store_address(cli, None)?;
    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| txpulse::distributed::agent::DEFAULT_ROOT.to_string());
    let store: Arc<dyn CoordinationStore> = Arc::new(RemoteStore::connect(&addr).await?);
    info!(store = %addr, root = %root, "Starting agent");

    let agent = Agent::new(store.clone(), WorkerRunner::new(), root);
    let result = agent.run(shutdown_on_ctrl_c()).await;
    if let Err(e) = store.close().await {
        warn!(error = %e, "Failed to close store connection");
    }
    result
}

async fn run_store(cli: &Cli) -> Result<()> {
    let server = StoreServer::bind(&cli.listen).await?;
    info!(addr = %server.local_addr()?, "Coordination store listening");
    server.run(shutdown_on_ctrl_c()).await
}
