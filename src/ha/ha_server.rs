use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ElectionConfig;
use crate::error::{Error, Result};
use crate::registry::{Registry, RegistryEvent, RegistryEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    Active,
    StandBy,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Active => f.write_str("ACTIVE"),
            ServerStatus::StandBy => f.write_str("STAND_BY"),
        }
    }
}

/// Observer of status transitions.
///
/// Called synchronously while the status lock is held, so a listener sees transitions in order and
/// nothing changes the status until it returns. It must not block and must not call back into the
/// [`HaServer`].
pub trait HaServerListener: Send + Sync {
    fn on_status_change(&self, status: ServerStatus);
}

struct StatusState {
    status: ServerStatus,
    listeners: Vec<Arc<dyn HaServerListener>>,
}

struct HaInner {
    name: String,
    registry: Arc<dyn Registry>,
    lock_path: String,
    interval: Duration,
    lock_wait: Duration,
    state: Mutex<StatusState>,
    wake: Notify,
}

impl HaInner {
    fn status(&self) -> ServerStatus {
        self.state.lock().map(|s| s.status).unwrap_or(ServerStatus::StandBy)
    }

    /// Returns `true` if the status changed.
    fn set_status(&self, status: ServerStatus) -> bool {
        let Ok(mut state) = self.state.lock() else {
            log::error!("[{}] Status lock poisoned, cannot switch to {}", self.name, status);
            return false;
        };
        if state.status == status {
            return false;
        }

        log::info!("[{}] Server status {} -> {}", self.name, state.status, status);
        state.status = status;
        for listener in &state.listeners {
            listener.on_status_change(status);
        }
        true
    }

    async fn participate_election(&self) -> Result<bool> {
        let acquired = self.registry.acquire_lock(&self.lock_path, self.lock_wait).await?;
        if acquired {
            self.set_status(ServerStatus::Active);
        }
        Ok(acquired)
    }

    async fn round(&self) {
        match self.status() {
            ServerStatus::Active => {
                let held = match self.registry.is_lock_held(&self.lock_path).await {
                    Ok(held) => held,
                    Err(e) => {
                        log::warn!("[{}] Cannot verify ownership of {}: {}", self.name, self.lock_path, e);
                        false
                    }
                };
                if !held && self.set_status(ServerStatus::StandBy) {
                    log::warn!("[{}] Lost {}, stepping down.", self.name, self.lock_path);
                    self.wake.notify_one();
                }
            }
            ServerStatus::StandBy => {
                if let Err(e) = self.participate_election().await {
                    log::warn!("[{}] Election attempt failed: {}", self.name, e);
                }
            }
        }
    }
}

/// Registry-lock based leader election between masters.
///
/// A STAND_BY server becomes ACTIVE when it acquires the election lock, waiting at most
/// `lock_wait` per attempt. Attempts repeat with a fixed delay and immediately whenever the lock
/// path reports a removal. An ACTIVE server that finds it no longer holds the lock drops back to
/// STAND_BY. [`HaServer::shutdown`] releases the lock.
pub struct HaServer {
    inner: Arc<HaInner>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HaServer {
    pub fn new(name: impl Into<String>, registry: Arc<dyn Registry>, config: &ElectionConfig) -> Self {
        HaServer {
            inner: Arc::new(HaInner {
                name: name.into(),
                registry,
                lock_path: config.lock_path.clone(),
                interval: config.interval(),
                lock_wait: config.lock_wait(),
                state: Mutex::new(StatusState { status: ServerStatus::StandBy, listeners: Vec::new() }),
                wake: Notify::new(),
            }),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn HaServerListener>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.listeners.push(listener);
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.inner.status()
    }

    pub fn is_active(&self) -> bool {
        self.status() == ServerStatus::Active
    }

    /// One election attempt. Returns whether this server holds the lock afterwards.
    pub async fn participate_election(&self) -> Result<bool> {
        self.inner.participate_election().await
    }

    /// Subscribes to the lock path and starts the election loop.
    pub async fn start(&self) -> Result<()> {
        if self.handle.lock().map_err(|_| Error::Election("ha server state poisoned".to_string()))?.is_some() {
            return Err(Error::Election(format!("{} is already started", self.inner.name)));
        }

        let weak: Weak<HaInner> = Arc::downgrade(&self.inner);
        self.inner
            .registry
            .subscribe(
                &self.inner.lock_path,
                Arc::new(move |event: &RegistryEvent| {
                    if event.kind == RegistryEventKind::Removed {
                        if let Some(inner) = weak.upgrade() {
                            inner.wake.notify_one();
                        }
                    }
                }),
            )
            .await?;

        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        let loop_handle = tokio::spawn(async move {
            log::info!("[{}] Election loop started on {}", inner.name, inner.lock_path);
            loop {
                inner.round().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep(inner.interval) => {}
                }
            }
            log::info!("[{}] Election loop stopped.", inner.name);
        });

        if let Ok(mut handle) = self.handle.lock() {
            *handle = Some(loop_handle);
        }
        Ok(())
    }

    /// Stops the loop and gives up the lock if held.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("[{}] Election loop ended abnormally: {}", self.inner.name, e);
            }
        }

        if self.is_active() {
            match self.inner.registry.release_lock(&self.inner.lock_path).await {
                Ok(_) => log::info!("[{}] Released {}", self.inner.name, self.inner.lock_path),
                Err(e) => log::warn!("[{}] Could not release {}: {}", self.inner.name, self.inner.lock_path, e),
            }
        }
        self.inner.set_status(ServerStatus::StandBy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    struct Recording(Mutex<Vec<ServerStatus>>);

    impl HaServerListener for Recording {
        fn on_status_change(&self, status: ServerStatus) {
            self.0.lock().unwrap().push(status);
        }
    }

    fn config() -> ElectionConfig {
        ElectionConfig { lock_path: "/lock/test".to_string(), interval_ms: 20, lock_wait_ms: 10 }
    }

    #[tokio::test]
    async fn single_server_becomes_active_and_steps_down_on_shutdown() {
        let registry = MemoryRegistry::new();
        let server = HaServer::new("m1", Arc::new(registry.connect()), &config());
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        server.add_listener(recording.clone());

        assert!(server.participate_election().await.unwrap());
        assert!(server.is_active());

        server.shutdown().await;
        assert_eq!(server.status(), ServerStatus::StandBy);
        assert_eq!(*recording.0.lock().unwrap(), vec![ServerStatus::Active, ServerStatus::StandBy]);

        let other = registry.connect();
        assert!(other.acquire_lock("/lock/test", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn second_server_stays_stand_by() {
        let registry = MemoryRegistry::new();
        let first = HaServer::new("m1", Arc::new(registry.connect()), &config());
        let second = HaServer::new("m2", Arc::new(registry.connect()), &config());

        assert!(first.participate_election().await.unwrap());
        assert!(!second.participate_election().await.unwrap());
        assert_eq!(second.status(), ServerStatus::StandBy);
    }
}
