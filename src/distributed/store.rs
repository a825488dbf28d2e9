//! Coordination store interface
//!
//! A small hierarchical key-value store in the style of ZooKeeper: nodes are
//! addressed by absolute slash-separated paths, carry an opaque payload and may
//! have children. Nodes can be tied to the session that created them
//! (ephemeral) and can get a monotonically increasing, zero-padded suffix
//! appended to their name (sequential), which makes lexicographic order equal
//! to creation order.
//!
//! The queue primitive in [`super::queue`] and the agent/coordinator protocol are
//! built purely on this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of the sequence suffix of sequential nodes
pub const SEQUENCE_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Lives until explicitly removed
    Persistent,

    /// Removed when the creating session ends
    Ephemeral,

    /// Ephemeral, with a sequence suffix appended to the requested name
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("parent of {0} does not exist")]
    NoParent(String),

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("store connection failed: {0}")]
    Connection(String),
}

/// Children of a node together with the version of that child list
///
/// The version changes every time a child is added or removed; pass it to
/// [`CoordinationStore::watch_children`] to wait for the next change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildList {
    /// Child names (not full paths), in lexicographic order
    pub names: Vec<String>,
    pub version: u64,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Session handle to a coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Create a node, returning its actual path (which differs from `path` for
    /// sequential nodes)
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String>;

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Remove a node without children
    async fn remove(&self, path: &str) -> StoreResult<()>;

    async fn children(&self, path: &str) -> StoreResult<ChildList>;

    /// Wait until the child list of `path` differs from `version`, returning
    /// the new version
    async fn watch_children(&self, path: &str, version: u64) -> StoreResult<u64>;

    /// End the session, removing every ephemeral node it created
    async fn close(&self) -> StoreResult<()>;
}

/// Create a persistent node unless it already exists
pub async fn ensure_path(store: &dyn CoordinationStore, path: &str) -> StoreResult<()> {
    match store.create(path, Vec::new(), CreateMode::Persistent).await {
        Ok(_) | Err(StoreError::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check that `path` is absolute, has no empty segments and no trailing slash
pub fn validate_path(path: &str) -> StoreResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Parent path of a validated path (`None` for the root)
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a validated path
pub fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Append the zero-padded sequence suffix
pub fn sequential_name(path: &str, sequence: u64) -> String {
    format!("{}{:0width$}", path, sequence, width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/caliper").is_ok());
        assert!(validate_path("/caliper/clients").is_ok());
        for bad in ["", "caliper", "/caliper/", "//x", "/a//b"] {
            assert_eq!(validate_path(bad), Err(StoreError::InvalidPath(bad.to_string())), "{}", bad);
        }
    }

    #[test]
    fn test_path_parts() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
        assert_eq!(name_of("/a/b/c"), "c");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_sequential_names_sort_by_creation() {
        let a = sequential_name("/q/msg_", 9);
        let b = sequential_name("/q/msg_", 10);
        assert_eq!(a, "/q/msg_0000000009");
        assert!(a < b);
    }
}
