//! Watched message queue
//!
//! A queue is a persistent node whose children are messages. Senders append
//! ephemeral-sequential children, so names sort in send order. A watcher loops
//! through "list, fetch new, delete, invoke callback, wait for change",
//! remembering the last name it handled so a message is never delivered twice
//! even if its deletion raced with someone else's.
//!
//! A watch ends when the callback asks to stop, when the queue cannot be
//! listed at all on the first attempt, or when its [`CancellationToken`] is
//! cancelled. Later store errors and delete races are logged and treated as
//! "no new message".

use super::store::{join, CoordinationStore, CreateMode, StoreError};
use crate::Result;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prefix of message node names
pub const MESSAGE_PREFIX: &str = "msg_";

/// Back-off after a failed listing
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Whether a watch continues after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchControl {
    Continue,
    Stop,
}

#[derive(Clone)]
pub struct MessageQueue {
    store: Arc<dyn CoordinationStore>,
    path: String,
}

impl MessageQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Append a message, returning the node path it was stored at
    pub async fn send(&self, payload: Vec<u8>) -> Result<String> {
        let node = join(&self.path, MESSAGE_PREFIX);
        self.store
            .create(&node, payload, CreateMode::EphemeralSequential)
            .await
            .with_context(|| format!("Failed to send message to {}", self.path))
    }

    /// Delete every pending message, returning how many were removed
    pub async fn clear(&self) -> Result<usize> {
        let list = match self.store.children(&self.path).await {
            Ok(list) => list,
            Err(StoreError::NoNode(_)) => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", self.path)),
        };
        let mut removed = 0;
        for name in list.names {
            match self.store.remove(&join(&self.path, &name)).await {
                Ok(()) => removed += 1,
                Err(StoreError::NoNode(_)) => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to clear {}", self.path)),
            }
        }
        Ok(removed)
    }

    /// Watch the queue on a background task
    ///
    /// `handler` receives each message payload in send order. Handler errors are
    /// logged and the watch carries on.
    pub fn watch<F>(&self, cancel: CancellationToken, handler: F) -> JoinHandle<Result<()>>
    where
        F: FnMut(Vec<u8>) -> Result<WatchControl> + Send + 'static,
    {
        let queue = self.clone();
        tokio::spawn(async move { queue.run_watch(cancel, handler).await })
    }

    async fn run_watch<F>(self, cancel: CancellationToken, mut handler: F) -> Result<()>
    where
        F: FnMut(Vec<u8>) -> Result<WatchControl> + Send,
    {
        let mut last_seen: Option<String> = None;
        let mut list = self
            .store
            .children(&self.path)
            .await
            .with_context(|| format!("Failed to watch {}", self.path))?;

        loop {
            for name in &list.names {
                if last_seen.as_ref().is_some_and(|seen| name <= seen) {
                    continue;
                }
                last_seen = Some(name.clone());

                let node = join(&self.path, name);
                let payload = match self.store.get_data(&node).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!(node = %node, error = %e, "Message vanished before it was read");
                        continue;
                    }
                };
                if let Err(e) = self.store.remove(&node).await {
                    debug!(node = %node, error = %e, "Message already removed");
                }

                match handler(payload) {
                    Ok(WatchControl::Continue) => {}
                    Ok(WatchControl::Stop) => {
                        debug!(queue = %self.path, "Watch finished");
                        return Ok(());
                    }
                    Err(e) => warn!(queue = %self.path, error = %format!("{:#}", e), "Message handler failed"),
                }
            }

            let changed = tokio::select! {
                changed = self.store.watch_children(&self.path, list.version) => changed,
                _ = cancel.cancelled() => {
                    debug!(queue = %self.path, "Watch closed");
                    return Ok(());
                }
            };
            if let Err(e) = changed {
                warn!(queue = %self.path, error = %e, "Queue watch failed");
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
            }

            list = match self.store.children(&self.path).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(queue = %self.path, error = %e, "Failed to list queue");
                    list
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::memory::MemoryStore;
    use tokio::sync::mpsc;

    async fn queue() -> (Arc<MemoryStore>, MessageQueue) {
        let store = Arc::new(MemoryStore::new());
        store.create("/q", Vec::new(), CreateMode::Persistent).await.unwrap();
        let queue = MessageQueue::new(store.clone(), "/q");
        (store, queue)
    }

    #[tokio::test]
    async fn test_messages_delivered_in_order_and_deleted() {
        let (store, queue) = queue().await;
        for i in 0..3u8 {
            queue.send(vec![i]).await.unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = queue.watch(CancellationToken::new(), move |payload| {
            let stop = payload == vec![4];
            tx.send(payload)?;
            Ok(if stop { WatchControl::Stop } else { WatchControl::Continue })
        });

        for i in 0..3u8 {
            assert_eq!(rx.recv().await.unwrap(), vec![i]);
        }
        queue.send(vec![3]).await.unwrap();
        queue.send(vec![4]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![3]);
        assert_eq!(rx.recv().await.unwrap(), vec![4]);

        handle.await.unwrap().unwrap();
        assert!(store.children("/q").await.unwrap().names.is_empty());
    }

    #[tokio::test]
    async fn test_watch_can_be_closed() {
        let (_store, queue) = queue().await;
        let cancel = CancellationToken::new();
        let handle = queue.watch(cancel.clone(), |_| Ok(WatchControl::Continue));
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_watch_of_missing_queue_fails() {
        let store = Arc::new(MemoryStore::new());
        let queue = MessageQueue::new(store, "/missing");
        let result = queue.watch(CancellationToken::new(), |_| Ok(WatchControl::Continue)).await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_end_watch() {
        let (_store, queue) = queue().await;
        queue.send(b"bad".to_vec()).await.unwrap();
        queue.send(b"stop".to_vec()).await.unwrap();

        let handle = queue.watch(CancellationToken::new(), |payload| {
            if payload == b"bad" {
                anyhow::bail!("cannot decode");
            }
            Ok(WatchControl::Stop)
        });
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_clear() {
        let (_store, queue) = queue().await;
        queue.send(Vec::new()).await.unwrap();
        queue.send(Vec::new()).await.unwrap();
        assert_eq!(queue.clear().await.unwrap(), 2);
        assert_eq!(queue.clear().await.unwrap(), 0);

        let missing = MessageQueue::new(Arc::new(MemoryStore::new()), "/nope");
        assert_eq!(missing.clear().await.unwrap(), 0);
    }
}
