use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::host::Host;
use crate::error::Result;

pub mod memory_registry;

pub use memory_registry::{MemoryRegistry, MemoryRegistryClient};

pub const NODES_ROOT: &str = "/nodes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Master,
    Worker,
}

impl NodeType {
    /// Parent path of every node of this type.
    pub fn path_prefix(&self) -> &'static str {
        match self {
            NodeType::Master => "/nodes/master",
            NodeType::Worker => "/nodes/worker",
        }
    }

    pub fn node_path(&self, host: &Host) -> String {
        format!("{}/{}", self.path_prefix(), host)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Master => f.write_str("master"),
            NodeType::Worker => f.write_str("worker"),
        }
    }
}

/// A live cluster member as published in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub host: Host,
    pub node_type: NodeType,
    /// Only meaningful for workers.
    #[serde(default)]
    pub worker_groups: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    100
}

impl Server {
    pub fn master(host: Host) -> Self {
        Server { host, node_type: NodeType::Master, worker_groups: Vec::new(), weight: default_weight() }
    }

    pub fn worker(host: Host, worker_groups: Vec<String>) -> Self {
        Server { host, node_type: NodeType::Worker, worker_groups, weight: default_weight() }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn path(&self) -> String {
        self.node_type.node_path(&self.host)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.worker_groups.iter().any(|g| g == group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEventKind {
    Added,
    Removed,
    Updated,
}

/// Change notification delivered to subscribers of a path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEvent {
    pub path: String,
    pub kind: RegistryEventKind,
    /// Present for node paths, absent for lock paths.
    pub server: Option<Server>,
}

/// Called synchronously by the registry. Must not block.
pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Coordination service seen by the core: ephemeral membership nodes, path subscriptions and
/// distributed locks. Every handle is one session; a session that dies loses its nodes and locks.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publishes `server` under its node path for the lifetime of this session.
    async fn register(&self, server: Server) -> Result<()>;

    async fn unregister(&self, node_type: NodeType, host: &Host) -> Result<()>;

    /// Delivers every change below `path` to `listener`.
    async fn subscribe(&self, path: &str, listener: RegistryListener) -> Result<()>;

    /// Waits up to `timeout` for the lock. Returns `false` when the wait timed out.
    /// Acquiring a lock this session already holds succeeds immediately.
    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<bool>;

    /// Returns `false` if this session did not hold the lock.
    async fn release_lock(&self, path: &str) -> Result<bool>;

    async fn is_lock_held(&self, path: &str) -> Result<bool>;

    /// Live servers of `node_type` in registration order.
    async fn get_server_list(&self, node_type: NodeType) -> Result<Vec<Server>>;

    async fn check_node_exists(&self, host: &Host, node_type: NodeType) -> Result<bool>;
}
