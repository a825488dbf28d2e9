//! A full benchmark over the TCP coordination store with two agents

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use txpulse::config::toml::parse_toml_string;
use txpulse::config::validator::validate_config;
use txpulse::coordinator::Coordinator;
use txpulse::distributed::remote::{RemoteStore, StoreServer};
use txpulse::distributed::store::CoordinationStore;
use txpulse::distributed::{Agent, DistributedCoordinator};
use txpulse::flow::BenchmarkFlow;
use txpulse::worker::WorkerRunner;

const CONFIG: &str = r#"
[clients]
type = "distributed"
number = 2
store = "127.0.0.1:0"
root = "/bench"

[adapter]
name = "mock"
latency_ms = 5

[test]
name = "distributed"
pause_secs = 0

[[test.rounds]]
label = "open"
tx_number = [30]
rate_control = [{ type = "fixed-rate", opts = { tps = 300 } }]
callback = "simple-open"

[[test.rounds]]
label = "transfer"
tx_number = [20]
callback = "simple-transfer"
rate_control = [{ type = "linear-rate", opts = { startingTps = 100, finishingTps = 200 } }]
"#;

async fn connect(addr: &str) -> Arc<dyn CoordinationStore> {
    Arc::new(RemoteStore::connect(addr).await.unwrap())
}

#[tokio::test]
async fn test_benchmark_on_remote_agents() {
    let config = parse_toml_string(CONFIG).unwrap();
    validate_config(&config).unwrap();
    let root = config.clients.root.clone();

    let shutdown = CancellationToken::new();
    let server = StoreServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let server = tokio::spawn(server.run(shutdown.clone()));

    let mut agents = Vec::new();
    for _ in 0..2 {
        let agent = Agent::new(connect(&addr).await, WorkerRunner::new(), root.clone());
        agents.push(tokio::spawn(agent.run(shutdown.clone())));
    }

    let coordinator_store = connect(&addr).await;
    let mut coordinator = DistributedCoordinator::wait_for_agents(
        coordinator_store.clone(),
        &root,
        2,
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(coordinator.worker_count(), 2);

    let summaries = BenchmarkFlow::new(config).run(&mut coordinator).await.unwrap();
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.succeeded()));
    assert_eq!(summaries[0].stats.succ, 30);
    assert_eq!(summaries[0].per_worker.len(), 2);
    assert_eq!(summaries[1].stats.succ, 20);
    assert_eq!(summaries[1].round_idx, 2);

    // quit makes the agents deregister and return
    coordinator.stop().await.unwrap();
    for agent in agents {
        tokio::time::timeout(Duration::from_secs(10), agent)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
    let clients = format!("{}/clients", root);
    assert!(coordinator_store.children(&clients).await.unwrap().names.is_empty());

    shutdown.cancel();
    server.await.unwrap().unwrap();
}
