//! Distributed agent
//!
//! An agent is a worker that receives its rounds through the coordination
//! store instead of stdin. On start it registers an ephemeral-sequential node
//! `client_<timestamp>_<seq>` under `<root>/clients` and creates its two queues,
//! `<root>/<id>_in` (rounds from the coordinator) and `<root>/<id>_out` (progress
//! and results back). It leaves on `quit` or when shut down, clearing its queues
//! and removing its registration.

use super::queue::{MessageQueue, WatchControl};
use super::store::{ensure_path, join, name_of, CoordinationStore, CreateMode, StoreError};
use crate::protocol::{from_payload, to_payload, CoordinatorMessage, WorkerMessage};
use crate::util::time::now_millis;
use crate::worker::WorkerRunner;
use crate::Result;
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default root of the store layout
pub const DEFAULT_ROOT: &str = "/caliper";

pub fn clients_path(root: &str) -> String {
    join(root, "clients")
}

pub fn inbox_path(root: &str, id: &str) -> String {
    join(root, &format!("{}_in", id))
}

pub fn outbox_path(root: &str, id: &str) -> String {
    join(root, &format!("{}_out", id))
}

/// An agent's presence in the store
pub struct Registration {
    pub id: String,

    /// Full path of the registration node
    pub node: String,

    pub inbox: MessageQueue,
    pub outbox: MessageQueue,
}

/// Register under `<root>/clients` and create the agent's queues
pub async fn register(store: Arc<dyn CoordinationStore>, root: &str) -> Result<Registration> {
    let clients = clients_path(root);
    ensure_path(store.as_ref(), root)
        .await
        .with_context(|| format!("Failed to create {}", root))?;
    ensure_path(store.as_ref(), &clients)
        .await
        .with_context(|| format!("Failed to create {}", clients))?;

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let node = store
        .create(
            &join(&clients, &format!("client_{}_", now_millis())),
            host.into_bytes(),
            CreateMode::EphemeralSequential,
        )
        .await
        .context("Failed to register agent")?;
    let id = name_of(&node).to_string();

    let inbox = inbox_path(root, &id);
    let outbox = outbox_path(root, &id);
    for queue in [&inbox, &outbox] {
        ensure_path(store.as_ref(), queue)
            .await
            .with_context(|| format!("Failed to create queue {}", queue))?;
    }

    Ok(Registration {
        id,
        node,
        inbox: MessageQueue::new(store.clone(), inbox),
        outbox: MessageQueue::new(store, outbox),
    })
}

/// Worker reachable through the coordination store
pub struct Agent {
    store: Arc<dyn CoordinationStore>,
    runner: WorkerRunner,
    root: String,
}

impl Agent {
    pub fn new(store: Arc<dyn CoordinationStore>, runner: WorkerRunner, root: impl Into<String>) -> Self {
        Self {
            store,
            runner,
            root: root.into(),
        }
    }

    /// Register and serve rounds until `quit` or `shutdown`
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let registration = register(self.store.clone(), &self.root).await?;
        info!(id = %registration.id, root = %self.root, "Agent registered");

        let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<CoordinatorMessage>();
        let watch_cancel = shutdown.child_token();
        let watch = registration.inbox.watch(watch_cancel.clone(), move |payload| {
            let msg: CoordinatorMessage = from_payload(&payload).context("unknown message type")?;
            inbound_tx
                .send(msg)
                .map_err(|_| anyhow::anyhow!("agent no longer accepting messages"))?;
            Ok(WatchControl::Continue)
        });

        let (upstream, mut outbound) = mpsc::unbounded_channel::<WorkerMessage>();
        let outbox = registration.outbox.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let sent = match to_payload(&msg) {
                    Ok(payload) => outbox.send(payload).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!(error = %format!("{:#}", e), "Failed to send message to coordinator");
                }
            }
        });

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(CoordinatorMessage::Test(round)) => {
                        info!(round = round.round_idx, label = %round.label, client = round.client_idx, "Received round");
                        tokio::select! {
                            _ = self.runner.handle_round(&round, &upstream) => {}
                            _ = shutdown.cancelled() => {
                                warn!("Interrupted during a round");
                                break;
                            }
                        }
                    }
                    Some(CoordinatorMessage::Quit) => {
                        info!("Received quit");
                        break;
                    }
                    None => {
                        warn!("Inbox watch ended");
                        break;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Shutting down agent");
                    break;
                }
            }
        }

        watch_cancel.cancel();
        match watch.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %format!("{:#}", e), "Inbox watch failed"),
            Err(e) => warn!(error = %e, "Inbox watch task aborted"),
        }
        drop(upstream);
        let _ = forwarder.await;

        self.deregister(&registration).await
    }

    async fn deregister(&self, registration: &Registration) -> Result<()> {
        for queue in [&registration.inbox, &registration.outbox] {
            let cleared = queue.clear().await?;
            if cleared > 0 {
                debug!(queue = queue.path(), cleared, "Cleared queue");
            }
            match self.store.remove(queue.path()).await {
                Ok(()) | Err(StoreError::NoNode(_)) => {}
                Err(e) => warn!(queue = queue.path(), error = %e, "Failed to remove queue"),
            }
        }
        match self.store.remove(&registration.node).await {
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(e) => return Err(e).context("Failed to deregister agent"),
        }
        info!(id = %registration.id, "Agent deregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::memory::MemoryStore;
    use std::time::Duration;

    #[test]
    fn test_layout_paths() {
        assert_eq!(clients_path("/caliper"), "/caliper/clients");
        assert_eq!(inbox_path("/caliper", "client_1_0000000000"), "/caliper/client_1_0000000000_in");
        assert_eq!(outbox_path("/caliper", "c"), "/caliper/c_out");
    }

    #[tokio::test]
    async fn test_register_creates_layout() {
        let store = Arc::new(MemoryStore::new());
        let registration = register(store.clone(), DEFAULT_ROOT).await.unwrap();

        assert!(registration.id.starts_with("client_"));
        assert!(registration.id.ends_with("_0000000000"));
        let clients = store.children("/caliper/clients").await.unwrap();
        assert_eq!(clients.names, vec![registration.id.clone()]);
        assert!(store.exists(registration.inbox.path()).await.unwrap());
        assert!(store.exists(registration.outbox.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_quit_deregisters() {
        let store = Arc::new(MemoryStore::new());
        let agent_session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        let agent = Agent::new(agent_session, WorkerRunner::new(), DEFAULT_ROOT);
        let handle = tokio::spawn(agent.run(CancellationToken::new()));

        // wait for the registration
        let id = loop {
            if let Ok(list) = store.children("/caliper/clients").await {
                if let Some(id) = list.names.first() {
                    break id.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let inbox = MessageQueue::new(store.clone(), inbox_path(DEFAULT_ROOT, &id));
        inbox.send(to_payload(&CoordinatorMessage::Quit).unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(store.children("/caliper/clients").await.unwrap().names.is_empty());
        assert!(!store.exists(&inbox_path(DEFAULT_ROOT, &id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_deregisters() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let agent = Agent::new(store.clone(), WorkerRunner::new(), "/bench");
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        while store.children("/bench/clients").await.map(|l| l.names.len()).unwrap_or(0) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(store.children("/bench").await.unwrap().names, vec!["clients".to_string()]);
    }
}
