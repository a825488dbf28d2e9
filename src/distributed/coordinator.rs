//! Distributed coordinator
//!
//! Drives rounds on agents registered in the coordination store. Each agent
//! counts as one client: the round is partitioned across agents (transaction
//! count and trim divided by the number of agents, duration replicated) and
//! every agent gets its own slice of the client arguments.
//!
//! ```text
//! Coordinator                        Agent i
//!     |-- test  -> <root>/<id>_in  ---->|
//!     |<- txUpdated ... <id>_out -------|
//!     |<- testResult | error  ----------|   (watch stops here)
//! ```

use super::agent::{clients_path, inbox_path, outbox_path};
use super::queue::{MessageQueue, WatchControl};
use super::store::{CoordinationStore, StoreError};
use crate::coordinator::{partition, Coordinator, CoordinatorError, RoundCollector};
use crate::protocol::{from_payload, to_payload, CoordinatorMessage, RoundMessage, WorkerMessage};
use crate::stats::aggregator::StatisticsAggregator;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A registered agent and its queues
#[derive(Clone)]
pub struct RemoteClient {
    pub id: String,
    inbox: MessageQueue,
    outbox: MessageQueue,
}

#[derive(Debug)]
enum RemoteEvent {
    Message(WorkerMessage),

    /// The outbox watch ended, with its error if it failed
    WatchEnded(Option<String>),
}

pub struct DistributedCoordinator {
    store: Arc<dyn CoordinationStore>,
    clients: Vec<RemoteClient>,
}

impl DistributedCoordinator {
    /// Use every agent currently registered under `root`
    pub async fn discover(store: Arc<dyn CoordinationStore>, root: &str) -> Result<Self> {
        let path = clients_path(root);
        let ids = match store.children(&path).await {
            Ok(list) => list.names,
            Err(StoreError::NoNode(_)) => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("Failed to list agents under {}", path)),
        };
        if ids.is_empty() {
            anyhow::bail!("No agents registered under {}", path);
        }
        Ok(Self::with_agents(store, root, ids))
    }

    /// Wait until at least `count` agents have registered, then use them all
    pub async fn wait_for_agents(
        store: Arc<dyn CoordinationStore>,
        root: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let path = clients_path(root);
        super::store::ensure_path(store.as_ref(), root).await?;
        super::store::ensure_path(store.as_ref(), &path).await?;

        let wait = async {
            loop {
                let list = store.children(&path).await?;
                if list.names.len() >= count {
                    return Ok::<_, StoreError>(list.names);
                }
                info!(registered = list.names.len(), expected = count, "Waiting for agents");
                store.watch_children(&path, list.version).await?;
            }
        };
        let ids = tokio::time::timeout(timeout, wait)
            .await
            .with_context(|| format!("Timed out waiting for {} agents", count))?
            .context("Failed to watch agent registrations")?;
        Ok(Self::with_agents(store, root, ids))
    }

    fn with_agents(store: Arc<dyn CoordinationStore>, root: &str, ids: Vec<String>) -> Self {
        let clients: Vec<RemoteClient> = ids
            .into_iter()
            .map(|id| RemoteClient {
                inbox: MessageQueue::new(store.clone(), inbox_path(root, &id)),
                outbox: MessageQueue::new(store.clone(), outbox_path(root, &id)),
                id,
            })
            .collect();
        info!(agents = clients.len(), "Discovered agents");
        Self { store, clients }
    }

    pub fn clients(&self) -> &[RemoteClient] {
        &self.clients
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }
}

/// The client arguments agent `host` of `hosts` receives
///
/// With at least one entry per agent each agent gets its own; otherwise every
/// agent gets the full list.
pub fn slice_client_args(args: &[serde_json::Value], host: usize, hosts: usize) -> Vec<serde_json::Value> {
    if hosts == 0 || args.len() < hosts {
        return args.to_vec();
    }
    let per_host = args.len() / hosts;
    let start = host * per_host;
    let end = if host + 1 == hosts { args.len() } else { start + per_host };
    args[start..end].to_vec()
}

/// The single client argument sent to agent `host`
///
/// Each agent runs one worker, so it gets the head of its own slice, or its own
/// entry of the full list when there are fewer entries than agents.
pub fn agent_client_args(args: &[serde_json::Value], host: usize, hosts: usize) -> Vec<serde_json::Value> {
    let own = if args.len() < hosts {
        args.get(host).or_else(|| args.first()).cloned()
    } else {
        slice_client_args(args, host, hosts).into_iter().next()
    };
    own.into_iter().collect()
}

#[async_trait]
impl Coordinator for DistributedCoordinator {
    fn worker_count(&self) -> usize {
        self.clients.len()
    }

    async fn start_test(&mut self, round: RoundMessage) -> Result<StatisticsAggregator> {
        let hosts = self.clients.len();
        let messages = partition(&round, hosts)?;
        let mut collector = RoundCollector::new(round.label.clone());
        let cancel = CancellationToken::new();
        let (events_tx, mut events) = mpsc::unbounded_channel::<(usize, RemoteEvent)>();

        let mut sent = 0;
        for (idx, (client, mut msg)) in self.clients.iter().zip(messages).enumerate() {
            msg.clientargs = agent_client_args(&round.clientargs, idx, hosts);

            let forward = events_tx.clone();
            let watch = client.outbox.watch(cancel.child_token(), move |payload| {
                let msg: WorkerMessage = from_payload(&payload)?;
                let terminal = msg.is_terminal();
                let _ = forward.send((idx, RemoteEvent::Message(msg)));
                Ok(if terminal { WatchControl::Stop } else { WatchControl::Continue })
            });
            let ended = events_tx.clone();
            tokio::spawn(async move {
                let error = match watch.await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{:#}", e)),
                    Err(e) => Some(e.to_string()),
                };
                let _ = ended.send((idx, RemoteEvent::WatchEnded(error)));
            });

            let delivered = match to_payload(&CoordinatorMessage::Test(msg)) {
                Ok(payload) => client.inbox.send(payload).await,
                Err(e) => Err(e),
            };
            match delivered {
                Ok(node) => {
                    debug!(agent = %client.id, node = %node, "Round dispatched");
                    collector.dispatched(idx);
                    sent += 1;
                }
                Err(e) => warn!(agent = %client.id, error = %format!("{:#}", e), "Failed to dispatch round"),
            }
        }
        drop(events_tx);

        if sent == 0 {
            cancel.cancel();
            return Err(CoordinatorError::RemoteStartFailed.into());
        }
        info!(round = %round.label, agents = sent, "Remote round started");

        while !collector.is_done() {
            match events.recv().await {
                Some((idx, RemoteEvent::Message(msg))) => collector.on_message(idx, msg, None),
                Some((idx, RemoteEvent::WatchEnded(error))) => {
                    if collector.is_pending(idx) {
                        collector.fail(CoordinatorError::WorkerCrashed {
                            worker: idx,
                            reason: error.unwrap_or_else(|| "outbox watch closed".to_string()),
                        });
                    }
                }
                None => break,
            }
        }
        cancel.cancel();
        collector.finish()
    }

    async fn stop(&mut self) -> Result<()> {
        let payload = to_payload(&CoordinatorMessage::Quit)?;
        for client in &self.clients {
            if let Err(e) = client.inbox.send(payload.clone()).await {
                warn!(agent = %client.id, error = %format!("{:#}", e), "Failed to send quit");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::agent::{Agent, DEFAULT_ROOT};
    use crate::distributed::memory::MemoryStore;
    use crate::distributed::store::CreateMode;
    use crate::protocol::RateControlSpec;
    use crate::worker::WorkerRunner;
    use serde_json::json;

    fn round(numb: u64) -> RoundMessage {
        let mut msg = RoundMessage::count("remote", numb);
        msg.cb = "simple-open".to_string();
        msg.config = "mock".to_string();
        msg.rate_control = RateControlSpec::new("fixed-rate", json!({"tps": 500}));
        msg
    }

    #[test]
    fn test_slice_client_args() {
        let args: Vec<serde_json::Value> = (0..5).map(|i| json!(i)).collect();
        assert_eq!(slice_client_args(&args, 0, 2), vec![json!(0), json!(1)]);
        assert_eq!(slice_client_args(&args, 1, 2), vec![json!(2), json!(3), json!(4)]);
        assert_eq!(slice_client_args(&args[..1], 1, 2), vec![json!(0)]);
        assert!(slice_client_args(&[], 0, 3).is_empty());
    }

    #[test]
    fn test_each_agent_gets_its_own_client_arg() {
        let args: Vec<serde_json::Value> = (0..4).map(|i| json!(format!("org{}", i))).collect();
        let mut msg = round(10);
        msg.clientargs = args.clone();
        let messages = partition(&msg, 2).unwrap();

        let received: Vec<serde_json::Value> = messages
            .into_iter()
            .enumerate()
            .map(|(host, mut m)| {
                m.clientargs = agent_client_args(&args, host, 2);
                m.client_args()
            })
            .collect();
        assert_eq!(received, vec![json!("org0"), json!("org2")]);

        // fewer entries than agents: each still resolves by its own index
        let short = vec![json!("a"), json!("b")];
        let received: Vec<serde_json::Value> = partition(&msg, 3)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(host, mut m)| {
                m.clientargs = agent_client_args(&short, host, 3);
                m.client_args()
            })
            .collect();
        assert_eq!(received, vec![json!("a"), json!("b"), json!("a")]);
        assert!(agent_client_args(&[], 0, 2).is_empty());
    }

    #[tokio::test]
    async fn test_discover_without_agents_fails() {
        let store = Arc::new(MemoryStore::new());
        assert!(DistributedCoordinator::discover(store, DEFAULT_ROOT).await.is_err());
    }

    #[tokio::test]
    async fn test_round_on_two_agents() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let mut agents = Vec::new();
        for _ in 0..2 {
            let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
            let agent = Agent::new(session, WorkerRunner::new(), DEFAULT_ROOT);
            agents.push(tokio::spawn(agent.run(shutdown.clone())));
        }

        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        let mut coordinator =
            DistributedCoordinator::wait_for_agents(session, DEFAULT_ROOT, 2, Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(coordinator.worker_count(), 2);

        let mut result = coordinator.start_test(round(11)).await.unwrap();
        assert_eq!(result.num_workers(), 2);
        assert_eq!(result.aggregate().succ, 11);
        assert_eq!(result.worker_stats(1).unwrap().succ, 6);

        coordinator.stop().await.unwrap();
        for agent in agents {
            tokio::time::timeout(Duration::from_secs(5), agent)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
        assert!(store.children("/caliper/clients").await.unwrap().names.is_empty());
    }

    #[tokio::test]
    async fn test_remote_error_fails_round() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        let agent = tokio::spawn(Agent::new(session, WorkerRunner::new(), DEFAULT_ROOT).run(shutdown.clone()));

        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        let mut coordinator =
            DistributedCoordinator::wait_for_agents(session, DEFAULT_ROOT, 1, Duration::from_secs(5))
                .await
                .unwrap();
        let mut msg = round(5);
        msg.cb = "no-such-workload".to_string();
        let err = coordinator.start_test(msg).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoordinatorError>(),
            Some(CoordinatorError::RoundFailed { .. })
        ));

        shutdown.cancel();
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_delivery_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        // registered agent whose queues were never created
        store.create("/caliper", Vec::new(), CreateMode::Persistent).await.unwrap();
        store
            .create("/caliper/clients", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        store
            .create("/caliper/clients/ghost", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let mut coordinator = DistributedCoordinator::discover(store, DEFAULT_ROOT).await.unwrap();
        let err = coordinator.start_test(round(3)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoordinatorError>(),
            Some(CoordinatorError::RemoteStartFailed)
        ));
    }
}
