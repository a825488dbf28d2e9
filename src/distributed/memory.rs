//! In-memory coordination store
//!
//! All sessions of one [`MemoryStore`] share a single node tree. Call
//! [`MemoryStore::session`] to open another session on the same tree; closing a
//! session removes its ephemeral nodes. The TCP store server wraps this type,
//! opening one session per connection.

use super::store::{
    name_of, parent_of, sequential_name, validate_path, ChildList, CoordinationStore, CreateMode,
    StoreError, StoreResult,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,

    /// Owning session for ephemeral nodes
    owner: Option<u64>,

    /// Next suffix for sequential children
    sequence: u64,

    /// Child-list version
    cversion: u64,

    children: BTreeSet<String>,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<String, Node>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::default());
        Self { nodes }
    }

    fn create(&mut self, path: &str, data: Vec<u8>, mode: CreateMode, session: u64) -> StoreResult<String> {
        validate_path(path)?;
        let parent_path = parent_of(path).ok_or_else(|| StoreError::NodeExists(path.to_string()))?;
        let parent = self
            .nodes
            .get_mut(parent_path)
            .ok_or_else(|| StoreError::NoParent(path.to_string()))?;

        let actual = if mode.is_sequential() {
            let name = sequential_name(path, parent.sequence);
            parent.sequence += 1;
            name
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists(actual));
        }

        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.insert(name_of(&actual).to_string());
            parent.cversion += 1;
        }
        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                owner: mode.is_ephemeral().then_some(session),
                ..Node::default()
            },
        );
        Ok(actual)
    }

    fn remove(&mut self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        let node = self.nodes.get(path).ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        let Some(parent_path) = parent_of(path) else {
            return Err(StoreError::InvalidPath(path.to_string()));
        };
        self.nodes.remove(path);
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            parent.children.remove(name_of(path));
            parent.cversion += 1;
        }
        Ok(())
    }

    fn node(&self, path: &str) -> StoreResult<&Node> {
        validate_path(path)?;
        self.nodes.get(path).ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    /// Remove every node owned by `session`, deepest first
    fn expire(&mut self, session: u64) -> usize {
        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        owned.sort_by_key(|path| std::cmp::Reverse(path.matches('/').count()));

        let mut removed = 0;
        for path in owned {
            // Ephemeral nodes may have gained persistent children; those pin them
            if self.remove(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

struct Shared {
    tree: Mutex<Tree>,

    /// Bumped on every mutation; watchers re-check their node when it moves
    revision: watch::Sender<u64>,

    next_session: AtomicU64,
}

/// Session on an in-memory node tree
pub struct MemoryStore {
    shared: Arc<Shared>,
    session: u64,
}

impl MemoryStore {
    /// A fresh tree containing only the root, with one open session
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            tree: Mutex::new(Tree::new()),
            revision,
            next_session: AtomicU64::new(1),
        });
        Self { shared, session: 0 }
    }

    /// Open another session on the same tree
    pub fn session(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            session: self.shared.next_session.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.shared.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.shared.revision.send_modify(|revision| *revision += 1);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn exists(&self, path: &str) -> StoreResult<bool> {
        validate_path(path)?;
        Ok(self.tree().nodes.contains_key(path))
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String> {
        let created = self.tree().create(path, data, mode, self.session)?;
        self.bump();
        Ok(created)
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        Ok(self.tree().node(path)?.data.clone())
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        self.tree().remove(path)?;
        self.bump();
        Ok(())
    }

    async fn children(&self, path: &str) -> StoreResult<ChildList> {
        let tree = self.tree();
        let node = tree.node(path)?;
        Ok(ChildList {
            names: node.children.iter().cloned().collect(),
            version: node.cversion,
        })
    }

    async fn watch_children(&self, path: &str, version: u64) -> StoreResult<u64> {
        let mut revision = self.shared.revision.subscribe();
        loop {
            revision.borrow_and_update();
            let current = self.tree().node(path)?.cversion;
            if current != version {
                return Ok(current);
            }
            revision
                .changed()
                .await
                .map_err(|_| StoreError::Connection("store dropped".to_string()))?;
        }
    }

    async fn close(&self) -> StoreResult<()> {
        let removed = self.tree().expire(self.session);
        if removed > 0 {
            debug!(session = self.session, removed, "Expired ephemeral nodes");
            self.bump();
        }
        Ok(())
    }
}
