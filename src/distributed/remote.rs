//! Coordination store over TCP
//!
//! [`StoreServer`] exposes a [`MemoryStore`] to the network; every connection is
//! its own session, so ephemeral nodes disappear when their creator
//! disconnects. [`RemoteStore`] is the matching client.
//!
//! Requests and replies use the same length-prefixed MessagePack framing as
//! the worker protocol. Each request carries an id and the server answers them
//! concurrently, so a long-running `watch_children` does not block other
//! requests on the same connection.

use super::memory::MemoryStore;
use super::store::{ChildList, CoordinationStore, CreateMode, StoreError, StoreResult};
use crate::protocol::{read_message, write_message};
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum Request {
    Exists { path: String },
    Create { path: String, data: Vec<u8>, mode: CreateMode },
    GetData { path: String },
    Remove { path: String },
    Children { path: String },
    WatchChildren { path: String, version: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
enum Reply {
    Exists(bool),
    Created(String),
    Data(Vec<u8>),
    Removed,
    Children(ChildList),
    Changed(u64),
    Failed(StoreError),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    id: u64,
    body: T,
}

async fn execute(store: &MemoryStore, request: Request) -> Reply {
    let outcome = match request {
        Request::Exists { path } => store.exists(&path).await.map(Reply::Exists),
        Request::Create { path, data, mode } => store.create(&path, data, mode).await.map(Reply::Created),
        Request::GetData { path } => store.get_data(&path).await.map(Reply::Data),
        Request::Remove { path } => store.remove(&path).await.map(|_| Reply::Removed),
        Request::Children { path } => store.children(&path).await.map(Reply::Children),
        Request::WatchChildren { path, version } => store.watch_children(&path, version).await.map(Reply::Changed),
    };
    outcome.unwrap_or_else(Reply::Failed)
}

/// TCP front end for a shared in-memory store
pub struct StoreServer {
    listener: TcpListener,
    store: MemoryStore,
}

impl StoreServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind store server on {}", addr))?;
        Ok(Self {
            listener,
            store: MemoryStore::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read store server address")
    }

    /// Serve connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "Coordination store listening");
        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => accepted.context("Failed to accept store client")?,
                _ = shutdown.cancelled() => {
                    info!("Coordination store shutting down");
                    return Ok(());
                }
            };
            let session = self.store.session();
            debug!(%peer, session = session.session_id(), "Store client connected");
            tokio::spawn(serve_connection(stream, peer, session));
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, session: MemoryStore) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let session = Arc::new(session);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Envelope<Reply>>();

    let writer_task = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &reply).await {
                debug!(error = %e, "Store client went away while replying");
                break;
            }
        }
    });

    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
    loop {
        match read_message::<_, Envelope<Request>>(&mut reader).await {
            Ok(Some(Envelope { id, body })) => {
                let session = session.clone();
                let reply_tx = reply_tx.clone();
                in_flight.retain(|task| !task.is_finished());
                in_flight.push(tokio::spawn(async move {
                    let body = execute(&session, body).await;
                    let _ = reply_tx.send(Envelope { id, body });
                }));
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %format!("{:#}", e), "Dropping store client");
                break;
            }
        }
    }

    for task in in_flight {
        task.abort();
    }
    drop(reply_tx);
    writer_task.abort();
    if let Err(e) = session.close().await {
        warn!(%peer, error = %e, "Failed to expire session");
    }
    debug!(%peer, "Store client disconnected");
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Client session on a [`StoreServer`]
pub struct RemoteStore {
    requests: mpsc::UnboundedSender<(Request, oneshot::Sender<Reply>)>,
    connection: CancellationToken,
}

impl RemoteStore {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to coordination store at {}", addr))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connection = CancellationToken::new();
        let (requests, mut request_rx) = mpsc::unbounded_channel::<(Request, oneshot::Sender<Reply>)>();

        let outgoing = pending.clone();
        let closed = connection.clone();
        tokio::spawn(async move {
            let mut next_id = 0u64;
            loop {
                let (body, reply) = tokio::select! {
                    next = request_rx.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                    _ = closed.cancelled() => break,
                };
                let id = next_id;
                next_id += 1;
                lock(&outgoing).insert(id, reply);
                if let Err(e) = write_message(&mut writer, &Envelope { id, body }).await {
                    warn!(error = %format!("{:#}", e), "Lost connection to coordination store");
                    break;
                }
            }
            closed.cancel();
        });

        let incoming = pending;
        let closed = connection.clone();
        tokio::spawn(async move {
            loop {
                let reply = tokio::select! {
                    reply = read_message::<_, Envelope<Reply>>(&mut reader) => reply,
                    _ = closed.cancelled() => break,
                };
                match reply {
                    Ok(Some(Envelope { id, body })) => {
                        if let Some(waiter) = lock(&incoming).remove(&id) {
                            let _ = waiter.send(body);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %format!("{:#}", e), "Bad reply from coordination store");
                        break;
                    }
                }
            }
            closed.cancel();
            // Waiters see their sender dropped as a connection error
            lock(&incoming).clear();
        });

        Ok(Self { requests, connection })
    }

    async fn call(&self, request: Request) -> StoreResult<Reply> {
        if self.connection.is_cancelled() {
            return Err(StoreError::Connection("session closed".to_string()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send((request, reply_tx))
            .map_err(|_| StoreError::Connection("session closed".to_string()))?;
        match reply_rx.await {
            Ok(Reply::Failed(e)) => Err(e),
            Ok(reply) => Ok(reply),
            Err(_) => Err(StoreError::Connection("connection lost".to_string())),
        }
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unexpected(reply: Reply) -> StoreError {
    StoreError::Connection(format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    async fn exists(&self, path: &str) -> StoreResult<bool> {
        match self.call(Request::Exists { path: path.to_string() }).await? {
            Reply::Exists(exists) => Ok(exists),
            other => Err(unexpected(other)),
        }
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String> {
        let request = Request::Create {
            path: path.to_string(),
            data,
            mode,
        };
        match self.call(request).await? {
            Reply::Created(path) => Ok(path),
            other => Err(unexpected(other)),
        }
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        match self.call(Request::GetData { path: path.to_string() }).await? {
            Reply::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        match self.call(Request::Remove { path: path.to_string() }).await? {
            Reply::Removed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn children(&self, path: &str) -> StoreResult<ChildList> {
        match self.call(Request::Children { path: path.to_string() }).await? {
            Reply::Children(list) => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    async fn watch_children(&self, path: &str, version: u64) -> StoreResult<u64> {
        let request = Request::WatchChildren {
            path: path.to_string(),
            version,
        };
        match self.call(request).await? {
            Reply::Changed(version) => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Drop the connection; the server expires this session's ephemeral nodes
    async fn close(&self) -> StoreResult<()> {
        self.connection.cancel();
        Ok(())
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.connection.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn server() -> (String, CancellationToken) {
        let server = StoreServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_remote_operations() {
        let (addr, shutdown) = server().await;
        let store = RemoteStore::connect(&addr).await.unwrap();

        store.create("/r", b"hi".to_vec(), CreateMode::Persistent).await.unwrap();
        assert!(store.exists("/r").await.unwrap());
        assert_eq!(store.get_data("/r").await.unwrap(), b"hi".to_vec());
        let seq = store
            .create("/r/m_", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(seq, "/r/m_0000000000");
        assert_eq!(store.children("/r").await.unwrap().names, vec!["m_0000000000".to_string()]);
        assert_eq!(
            store.create("/r", Vec::new(), CreateMode::Persistent).await,
            Err(StoreError::NodeExists("/r".into()))
        );
        store.remove(&seq).await.unwrap();
        assert!(store.children("/r").await.unwrap().names.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_watch_does_not_block_other_requests() {
        let (addr, shutdown) = server().await;
        let store = Arc::new(RemoteStore::connect(&addr).await.unwrap());
        store.create("/w", Vec::new(), CreateMode::Persistent).await.unwrap();
        let version = store.children("/w").await.unwrap().version;

        let watcher = store.clone();
        let watch = tokio::spawn(async move { watcher.watch_children("/w", version).await });

        // same connection keeps working while the watch is parked
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.create("/w/a", Vec::new(), CreateMode::Persistent).await.unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(5), watch)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(changed, version + 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_expires_ephemerals() {
        let (addr, shutdown) = server().await;
        let observer = RemoteStore::connect(&addr).await.unwrap();
        observer.create("/clients", Vec::new(), CreateMode::Persistent).await.unwrap();

        let agent = RemoteStore::connect(&addr).await.unwrap();
        agent
            .create("/clients/client_", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(observer.children("/clients").await.unwrap().names.len(), 1);
        agent.close().await.unwrap();
        assert!(agent.exists("/clients").await.is_err());

        loop {
            let list = observer.children("/clients").await.unwrap();
            if list.names.is_empty() {
                break;
            }
            tokio::time::timeout(Duration::from_secs(5), observer.watch_children("/clients", list.version))
                .await
                .expect("ephemeral node never expired")
                .unwrap();
        }
        shutdown.cancel();
    }
}
