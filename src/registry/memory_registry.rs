use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::domain::host::Host;
use crate::error::{Error, Result};
use crate::registry::{NodeType, Registry, RegistryEvent, RegistryEventKind, RegistryListener, Server};

type SessionId = u64;

struct Subscription {
    session: SessionId,
    prefix: String,
    listener: RegistryListener,
}

struct NodeEntry {
    sequence: u64,
    owner: SessionId,
    server: Server,
}

#[derive(Default)]
struct RegistryState {
    next_sequence: u64,
    nodes: HashMap<String, NodeEntry>,
    locks: HashMap<String, SessionId>,
    subscriptions: Vec<Subscription>,
}

impl RegistryState {
    /// Listeners interested in `path`, collected so they can be called after the state lock is dropped.
    fn listeners_for(&self, path: &str) -> Vec<RegistryListener> {
        self.subscriptions.iter().filter(|s| is_under(path, &s.prefix)).map(|s| s.listener.clone()).collect()
    }
}

/// `path` is `prefix` itself or one of its descendants. `/lock/master-ha` is not under `/lock/master`.
fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

struct Backend {
    state: Mutex<RegistryState>,
    lock_released: Notify,
    next_session: AtomicU64,
}

/// In-process registry shared by every session created from it.
///
/// Stands in for the external coordination service in standalone mode and in tests. Each
/// [`MemoryRegistryClient`] behaves like one remote session: its nodes are ephemeral and its locks
/// are released when the session closes.
#[derive(Clone)]
pub struct MemoryRegistry {
    backend: Arc<Backend>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry {
            backend: Arc::new(Backend { state: Mutex::new(RegistryState::default()), lock_released: Notify::new(), next_session: AtomicU64::new(1) }),
        }
    }

    /// Opens a new session.
    pub fn connect(&self) -> MemoryRegistryClient {
        let session = self.backend.next_session.fetch_add(1, Ordering::Relaxed);
        log::debug!("Registry session {} opened.", session);
        MemoryRegistryClient { backend: self.backend.clone(), session, closed: Arc::new(AtomicBool::new(false)) }
    }
}

/// One session on a [`MemoryRegistry`].
#[derive(Clone)]
pub struct MemoryRegistryClient {
    backend: Arc<Backend>,
    session: SessionId,
    closed: Arc<AtomicBool>,
}

impl MemoryRegistryClient {
    pub fn session_id(&self) -> u64 {
        self.session
    }

    fn state(&self) -> Result<MutexGuard<'_, RegistryState>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Registry(format!("session {} is closed", self.session)));
        }
        self.backend.state.lock().map_err(|_| Error::Registry("registry state poisoned".to_string()))
    }

    fn notify(listeners: Vec<RegistryListener>, event: &RegistryEvent) {
        for listener in listeners {
            listener(event);
        }
    }

    /// Ends the session as if the process died: its locks are released, its nodes removed and
    /// its subscriptions dropped. Subscribers of other sessions are notified.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut notifications: Vec<(Vec<RegistryListener>, RegistryEvent)> = Vec::new();
        {
            let Ok(mut state) = self.backend.state.lock() else {
                log::error!("Registry state poisoned while closing session {}", self.session);
                return;
            };

            state.subscriptions.retain(|s| s.session != self.session);

            let released: Vec<String> = state.locks.iter().filter(|(_, owner)| **owner == self.session).map(|(path, _)| path.clone()).collect();
            for path in released {
                state.locks.remove(&path);
                let event = RegistryEvent { path: path.clone(), kind: RegistryEventKind::Removed, server: None };
                notifications.push((state.listeners_for(&path), event));
            }

            let mut removed: Vec<(String, NodeEntry)> = Vec::new();
            let owned: Vec<String> = state.nodes.iter().filter(|(_, e)| e.owner == self.session).map(|(p, _)| p.clone()).collect();
            for path in owned {
                if let Some(entry) = state.nodes.remove(&path) {
                    removed.push((path, entry));
                }
            }
            removed.sort_by_key(|(_, e)| e.sequence);
            for (path, entry) in removed {
                let event = RegistryEvent { path: path.clone(), kind: RegistryEventKind::Removed, server: Some(entry.server) };
                notifications.push((state.listeners_for(&path), event));
            }
        }

        self.backend.lock_released.notify_waiters();
        log::info!("Registry session {} closed.", self.session);

        for (listeners, event) in notifications {
            Self::notify(listeners, &event);
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistryClient {
    async fn register(&self, server: Server) -> Result<()> {
        let path = server.path();
        let (listeners, kind) = {
            let mut state = self.state()?;
            let kind = if state.nodes.contains_key(&path) { RegistryEventKind::Updated } else { RegistryEventKind::Added };
            state.next_sequence += 1;
            let sequence = match state.nodes.get(&path) {
                Some(existing) => existing.sequence,
                None => state.next_sequence,
            };
            state.nodes.insert(path.clone(), NodeEntry { sequence, owner: self.session, server: server.clone() });
            (state.listeners_for(&path), kind)
        };

        log::debug!("Registered {} {} ({:?})", server.node_type, server.host, kind);
        Self::notify(listeners, &RegistryEvent { path, kind, server: Some(server) });
        Ok(())
    }

    async fn unregister(&self, node_type: NodeType, host: &Host) -> Result<()> {
        let path = node_type.node_path(host);
        let removed = {
            let mut state = self.state()?;
            state.nodes.remove(&path).map(|entry| (state.listeners_for(&path), entry.server))
        };

        if let Some((listeners, server)) = removed {
            Self::notify(listeners, &RegistryEvent { path, kind: RegistryEventKind::Removed, server: Some(server) });
        }
        Ok(())
    }

    async fn subscribe(&self, path: &str, listener: RegistryListener) -> Result<()> {
        self.state()?.subscriptions.push(Subscription { session: self.session, prefix: path.to_string(), listener });
        Ok(())
    }

    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            let released = self.backend.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = self.state()?;
                match state.locks.get(path) {
                    Some(owner) if *owner == self.session => return Ok(true),
                    Some(_) => {}
                    None => {
                        state.locks.insert(path.to_string(), self.session);
                        log::debug!("Session {} acquired lock {}", self.session, path);
                        return Ok(true);
                    }
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Ok(false);
            }
        }
    }

    async fn release_lock(&self, path: &str) -> Result<bool> {
        let listeners = {
            let mut state = self.state()?;
            if state.locks.get(path) != Some(&self.session) {
                return Ok(false);
            }
            state.locks.remove(path);
            state.listeners_for(path)
        };

        self.backend.lock_released.notify_waiters();
        log::debug!("Session {} released lock {}", self.session, path);
        Self::notify(listeners, &RegistryEvent { path: path.to_string(), kind: RegistryEventKind::Removed, server: None });
        Ok(true)
    }

    async fn is_lock_held(&self, path: &str) -> Result<bool> {
        Ok(self.state()?.locks.get(path) == Some(&self.session))
    }

    async fn get_server_list(&self, node_type: NodeType) -> Result<Vec<Server>> {
        let state = self.state()?;
        let mut entries: Vec<&NodeEntry> = state.nodes.values().filter(|e| e.server.node_type == node_type).collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries.into_iter().map(|e| e.server.clone()).collect())
    }

    async fn check_node_exists(&self, host: &Host, node_type: NodeType) -> Result<bool> {
        Ok(self.state()?.nodes.contains_key(&node_type.node_path(host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn worker(port: u16) -> Server {
        Server::worker(Host::new("127.0.0.1", port), vec!["default".to_string()])
    }

    #[tokio::test]
    async fn server_list_keeps_registration_order() {
        let registry = MemoryRegistry::new();
        let session = registry.connect();
        session.register(worker(3)).await.unwrap();
        session.register(worker(1)).await.unwrap();
        session.register(worker(2)).await.unwrap();

        let ports: Vec<u16> = session.get_server_list(NodeType::Worker).await.unwrap().iter().map(|s| s.host.port).collect();
        assert_eq!(ports, vec![3, 1, 2]);
        assert!(session.get_server_list(NodeType::Master).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_is_exclusive_between_sessions() {
        let registry = MemoryRegistry::new();
        let a = registry.connect();
        let b = registry.connect();

        assert!(a.acquire_lock("/lock/x", Duration::from_millis(10)).await.unwrap());
        assert!(a.acquire_lock("/lock/x", Duration::from_millis(10)).await.unwrap());
        assert!(!b.acquire_lock("/lock/x", Duration::from_millis(20)).await.unwrap());
        assert!(!b.release_lock("/lock/x").await.unwrap());

        assert!(a.release_lock("/lock/x").await.unwrap());
        assert!(b.acquire_lock("/lock/x", Duration::from_millis(10)).await.unwrap());
        assert!(b.is_lock_held("/lock/x").await.unwrap());
        assert!(!a.is_lock_held("/lock/x").await.unwrap());
    }

    #[tokio::test]
    async fn waiting_acquirer_gets_lock_when_owner_dies() {
        let registry = MemoryRegistry::new();
        let owner = registry.connect();
        let waiter = registry.connect();
        assert!(owner.acquire_lock("/lock/x", Duration::ZERO).await.unwrap());

        let pending = tokio::spawn(async move { waiter.acquire_lock("/lock/x", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        owner.close();

        assert!(pending.await.unwrap().unwrap());
    }

    #[test]
    fn subscription_prefix_matches_whole_path_segments() {
        assert!(is_under("/lock/master", "/lock/master"));
        assert!(is_under("/nodes/worker/127.0.0.1:7", "/nodes"));
        assert!(is_under("/nodes/worker/127.0.0.1:7", "/nodes/"));
        assert!(!is_under("/lock/master-ha", "/lock/master"));
        assert!(!is_under("/nodesx/worker", "/nodes"));
    }

    #[tokio::test]
    async fn lock_listener_ignores_sibling_lock_paths() {
        let registry = MemoryRegistry::new();
        let observer = registry.connect();
        let owner = registry.connect();
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        let sink = seen.clone();
        observer.subscribe("/lock/master", Arc::new(move |event: &RegistryEvent| sink.lock().unwrap().push(event.path.clone()))).await.unwrap();

        assert!(owner.acquire_lock("/lock/master-ha", Duration::ZERO).await.unwrap());
        assert!(owner.release_lock("/lock/master-ha").await.unwrap());
        assert!(owner.acquire_lock("/lock/master", Duration::ZERO).await.unwrap());
        assert!(owner.release_lock("/lock/master").await.unwrap());

        assert_eq!(*seen.lock().unwrap(), vec!["/lock/master".to_string()]);
    }

    #[tokio::test]
    async fn closing_a_session_notifies_removed_nodes() {
        let registry = MemoryRegistry::new();
        let observer = registry.connect();
        let doomed = registry.connect();
        let seen: Arc<StdMutex<Vec<RegistryEvent>>> = Arc::new(StdMutex::new(Vec::new()));

        let sink = seen.clone();
        observer.subscribe("/nodes", Arc::new(move |event: &RegistryEvent| sink.lock().unwrap().push(event.clone()))).await.unwrap();

        doomed.register(worker(7)).await.unwrap();
        doomed.close();

        assert!(!observer.check_node_exists(&Host::new("127.0.0.1", 7), NodeType::Worker).await.unwrap());
        assert!(doomed.get_server_list(NodeType::Worker).await.is_err());

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, RegistryEventKind::Added);
        assert_eq!(events[1].kind, RegistryEventKind::Removed);
        assert_eq!(events[1].server.as_ref().unwrap().host.port, 7);
    }
}
